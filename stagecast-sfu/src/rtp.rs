//! RTP and transport negotiation parameters exchanged with peers
//!
//! Field names follow the JSON shapes browser-side media clients send and expect
//! (camelCase). Fields the coordinator never inspects are kept as raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stagecast_core::config::CodecConfig;
use stagecast_core::MediaKind;

/// First dynamic payload type handed out to router codecs
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

/// One codec a router or endpoint can handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Same codec, ignoring payload type and feedback
    #[must_use]
    pub fn matches(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && (self.kind == MediaKind::Video || self.channels.unwrap_or(1) == codec.channels.unwrap_or(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Build router capabilities from the configured codec list,
    /// assigning dynamic payload types in order.
    #[must_use]
    pub fn from_codecs(codecs: &[CodecConfig]) -> Self {
        let codecs = codecs
            .iter()
            .zip(FIRST_DYNAMIC_PAYLOAD_TYPE..)
            .map(|(codec, payload_type)| RtpCodecCapability {
                kind: codec.kind,
                mime_type: codec.mime_type.clone(),
                preferred_payload_type: Some(payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: match codec.kind {
                    MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
                    MediaKind::Video => vec![
                        RtcpFeedback::new("nack", ""),
                        RtcpFeedback::new("nack", "pli"),
                        RtcpFeedback::new("ccm", "fir"),
                        RtcpFeedback::new("goog-remb", ""),
                    ],
                },
            })
            .collect();

        Self {
            codecs,
            header_extensions: Vec::new(),
        }
    }

    /// Capability entry matching the given codec
    #[must_use]
    pub fn find_codec(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.matches(codec))
    }
}

/// A negotiated codec inside `RtpParameters`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    /// Codec name without the media type prefix (`video/VP8` → `VP8`)
    #[must_use]
    pub fn codec_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map_or(self.mime_type.as_str(), |(_, name)| name)
    }

    /// Media kind implied by the mime type prefix
    #[must_use]
    pub fn kind(&self) -> Option<MediaKind> {
        self.mime_type
            .split_once('/')
            .and_then(|(kind, _)| kind.parse().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

impl RtpParameters {
    /// The codec media flows with (first entry)
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

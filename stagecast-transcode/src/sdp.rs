//! SDP description handed to the transcoder
//!
//! The transcoder reads a single RTP stream; everything it needs to decode
//! the packets comes from the consumer's negotiated parameters.

use stagecast_core::MediaKind;
use stagecast_sfu::rtp::RtpParameters;
use std::fmt::Write;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    pub kind: MediaKind,
    pub address: String,
    pub port: u16,
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    /// `a=fmtp` parameters, already rendered as `key=value;...`
    pub format_parameters: Option<String>,
}

impl StreamDescription {
    pub fn from_parameters(
        kind: MediaKind,
        parameters: &RtpParameters,
        address: &str,
        port: u16,
    ) -> Result<Self> {
        let codec = parameters.primary_codec().ok_or_else(|| {
            BridgeError::InvalidDescription("consumer has no negotiated codec".to_string())
        })?;

        if codec.clock_rate == 0 {
            return Err(BridgeError::InvalidDescription(format!(
                "codec {} without clock rate",
                codec.mime_type
            )));
        }

        let format_parameters = (!codec.parameters.is_empty()).then(|| {
            codec
                .parameters
                .iter()
                .map(|(key, value)| match value.as_str() {
                    Some(text) => format!("{key}={text}"),
                    None => format!("{key}={value}"),
                })
                .collect::<Vec<_>>()
                .join(";")
        });

        Ok(Self {
            kind,
            address: address.to_string(),
            port,
            payload_type: codec.payload_type,
            codec_name: codec.codec_name().to_string(),
            clock_rate: codec.clock_rate,
            channels: codec.channels.filter(|_| kind == MediaKind::Audio),
            format_parameters,
        })
    }

    /// Render the session description (CRLF line endings)
    #[must_use]
    pub fn to_sdp(&self) -> String {
        let ip_version = if self.address.contains(':') { "IP6" } else { "IP4" };
        let mut sdp = String::new();

        // writing into a String cannot fail
        let _ = write!(
            sdp,
            "v=0\r\n\
             o=- 0 0 IN {ip_version} {address}\r\n\
             s=Stagecast RTP Input\r\n\
             c=IN {ip_version} {address}\r\n\
             t=0 0\r\n\
             m={kind} {port} RTP/AVP {pt}\r\n",
            address = self.address,
            kind = self.kind,
            port = self.port,
            pt = self.payload_type,
        );

        let _ = write!(
            sdp,
            "a=rtpmap:{} {}/{}",
            self.payload_type, self.codec_name, self.clock_rate
        );
        if let Some(channels) = self.channels {
            let _ = write!(sdp, "/{channels}");
        }
        sdp.push_str("\r\n");

        if let Some(fmtp) = &self.format_parameters {
            let _ = write!(sdp, "a=fmtp:{} {fmtp}\r\n", self.payload_type);
        }
        sdp.push_str("a=recvonly\r\n");
        sdp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecast_sfu::rtp::RtpCodecParameters;

    fn parameters(mime_type: &str, payload_type: u8) -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: mime_type.to_string(),
                payload_type,
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_vp8_description() {
        let description = StreamDescription::from_parameters(
            MediaKind::Video,
            &parameters("video/VP8", 101),
            "127.0.0.1",
            5004,
        )
        .unwrap();

        let sdp = description.to_sdp();
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("c=IN IP4 127.0.0.1\r\n"));
        assert!(sdp.contains("m=video 5004 RTP/AVP 101\r\n"));
        assert!(sdp.contains("a=rtpmap:101 VP8/90000\r\n"));
        assert!(!sdp.contains("a=fmtp"));
    }

    #[test]
    fn test_format_parameters_rendered() {
        let mut params = parameters("video/H264", 102);
        params.codecs[0]
            .parameters
            .insert("packetization-mode".to_string(), serde_json::json!(1));
        params.codecs[0]
            .parameters
            .insert("profile-level-id".to_string(), serde_json::json!("42e01f"));

        let description =
            StreamDescription::from_parameters(MediaKind::Video, &params, "127.0.0.1", 5004)
                .unwrap();
        assert_eq!(
            description.format_parameters.as_deref(),
            Some("packetization-mode=1;profile-level-id=42e01f")
        );
        assert!(description
            .to_sdp()
            .contains("a=fmtp:102 packetization-mode=1;profile-level-id=42e01f\r\n"));
    }

    #[test]
    fn test_missing_codec_rejected() {
        let result = StreamDescription::from_parameters(
            MediaKind::Video,
            &RtpParameters::default(),
            "127.0.0.1",
            5004,
        );
        assert!(matches!(result, Err(BridgeError::InvalidDescription(_))));
    }
}

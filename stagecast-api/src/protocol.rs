//! JSON signaling frames
//!
//! Client → server: `{"id"?: u64, "method": "...", "data"?: {...}}`.
//! Server → client: a response `{"id", "ok", "data" | "error"}` or an event
//! `{"event", "data"}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stagecast_core::{Error, ErrorCode, MediaKind};
use stagecast_sfu::rtp::{DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters};
use stagecast_sfu::{ConsumerId, PeerEvent, ProducerId, TransportId};

/// Raw inbound frame
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetRtpCapabilities,
    CreateWebRtcTransport {
        sender: bool,
    },
    TransportConnect {
        dtls_parameters: DtlsParameters,
    },
    TransportProduce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    TransportRecvConnect {
        dtls_parameters: DtlsParameters,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ConsumerResume {
        consumer_id: ConsumerId,
    },
}

#[derive(Deserialize)]
struct CreateTransportData {
    #[serde(default)]
    sender: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectData {
    dtls_parameters: DtlsParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    producer_id: ProducerId,
    rtp_capabilities: RtpCapabilities,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeData {
    consumer_id: ConsumerId,
}

fn payload<T: serde::de::DeserializeOwned>(method: &str, data: Value) -> Result<T, Error> {
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| Error::InvalidRequest(format!("invalid {method} payload: {e}")))
}

impl Request {
    pub fn parse(method: &str, data: Value) -> Result<Self, Error> {
        let request = match method {
            "getRtpCapabilities" => Self::GetRtpCapabilities,
            "createWebRtcTransport" => {
                let CreateTransportData { sender } = payload(method, data)?;
                Self::CreateWebRtcTransport { sender }
            }
            "transportConnect" => {
                let ConnectData { dtls_parameters } = payload(method, data)?;
                Self::TransportConnect { dtls_parameters }
            }
            "transportProduce" => {
                let ProduceData {
                    kind,
                    rtp_parameters,
                } = payload(method, data)?;
                Self::TransportProduce {
                    kind,
                    rtp_parameters,
                }
            }
            "transportRecvConnect" => {
                let ConnectData { dtls_parameters } = payload(method, data)?;
                Self::TransportRecvConnect { dtls_parameters }
            }
            "consume" => {
                let ConsumeData {
                    producer_id,
                    rtp_capabilities,
                } = payload(method, data)?;
                Self::Consume {
                    producer_id,
                    rtp_capabilities,
                }
            }
            "consumerResume" => {
                let ResumeData { consumer_id } = payload(method, data)?;
                Self::ConsumerResume { consumer_id }
            }
            other => return Err(Error::InvalidRequest(format!("unknown method {other}"))),
        };
        Ok(request)
    }

    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetRtpCapabilities => "getRtpCapabilities",
            Self::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            Self::TransportConnect { .. } => "transportConnect",
            Self::TransportProduce { .. } => "transportProduce",
            Self::TransportRecvConnect { .. } => "transportRecvConnect",
            Self::Consume { .. } => "consume",
            Self::ConsumerResume { .. } => "consumerResume",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilitiesResponse {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    #[must_use]
    pub const fn success(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: u64, error: &Error) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }
}

/// Anything the server writes to a signaling connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(ResponseFrame),
    Event(PeerEvent),
}

impl ServerMessage {
    pub fn to_text(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

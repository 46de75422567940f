//! Per-connection request handling
//!
//! `SignalingSession` turns inbound text frames into coordinator calls and
//! builds the response frames. It knows nothing about websockets, so the
//! same loop serves the HTTP upgrade handler and the integration tests.

use serde::Serialize;
use serde_json::{json, Value};
use stagecast_core::{Error, Result};
use stagecast_sfu::{PeerEvent, PeerId, TransportRole};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::impls::coordinator::Coordinator;
use crate::protocol::{
    ClientRequest, ProduceResponse, Request, ResponseFrame, RtpCapabilitiesResponse,
    ServerMessage,
};

pub struct SignalingSession {
    coordinator: Arc<Coordinator>,
    peer_id: PeerId,
}

impl SignalingSession {
    /// Register a new peer; the receiver yields its server-initiated events
    pub fn open(coordinator: Arc<Coordinator>) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_id, events) = coordinator.connect();
        (
            Self {
                coordinator,
                peer_id,
            },
            events,
        )
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Handle one text frame; returns the response to write, if any
    ///
    /// Requests without an `id` are fire-and-forget: their outcome is only
    /// logged.
    pub async fn handle_text(&self, text: &str) -> Option<ServerMessage> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(peer_id = %self.peer_id, error = %e, "Malformed signaling frame");
                return None;
            }
        };
        let id = value.get("id").and_then(Value::as_u64);

        match serde_json::from_value::<ClientRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                let err = Error::InvalidRequest(format!("malformed request: {e}"));
                warn!(peer_id = %self.peer_id, error = %err, "Rejected signaling frame");
                id.map(|id| ServerMessage::Response(ResponseFrame::failure(id, &err)))
            }
        }
    }

    pub async fn handle(&self, request: ClientRequest) -> Option<ServerMessage> {
        let ClientRequest { id, method, data } = request;

        let result = match Request::parse(&method, data) {
            Ok(request) => {
                debug!(peer_id = %self.peer_id, method = request.method(), "Dispatching request");
                self.dispatch(request).await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => debug!(peer_id = %self.peer_id, method = %method, "Request handled"),
            Err(e) if e.is_request_scoped() => {
                warn!(peer_id = %self.peer_id, method = %method, error = %e, "Request failed");
            }
            Err(e) => error!(peer_id = %self.peer_id, method = %method, error = %e, "Request failed"),
        }

        let id = id?;
        Some(ServerMessage::Response(match result {
            Ok(data) => ResponseFrame::success(id, data),
            Err(e) => ResponseFrame::failure(id, &e),
        }))
    }

    async fn dispatch(&self, request: Request) -> Result<Value> {
        let peer_id = &self.peer_id;
        let coordinator = &self.coordinator;

        match request {
            Request::GetRtpCapabilities => to_value(&RtpCapabilitiesResponse {
                rtp_capabilities: coordinator.rtp_capabilities(),
            }),
            Request::CreateWebRtcTransport { sender } => {
                to_value(&coordinator.create_transport(peer_id, sender).await?)
            }
            Request::TransportConnect { dtls_parameters } => {
                coordinator
                    .connect_transport(peer_id, TransportRole::Producing, dtls_parameters)
                    .await?;
                Ok(ack())
            }
            Request::TransportRecvConnect { dtls_parameters } => {
                coordinator
                    .connect_transport(peer_id, TransportRole::Consuming, dtls_parameters)
                    .await?;
                Ok(ack())
            }
            Request::TransportProduce {
                kind,
                rtp_parameters,
            } => {
                let id = coordinator.produce(peer_id, kind, rtp_parameters).await?;
                to_value(&ProduceResponse { id })
            }
            Request::Consume {
                producer_id,
                rtp_capabilities,
            } => to_value(
                &coordinator
                    .consume(peer_id, &producer_id, rtp_capabilities)
                    .await?,
            ),
            Request::ConsumerResume { consumer_id } => {
                coordinator.resume_consumer(peer_id, &consumer_id).await?;
                Ok(ack())
            }
        }
    }

    /// End the session; everything the peer owns is torn down
    pub fn close(self) {
        self.coordinator.disconnect(&self.peer_id);
    }
}

fn ack() -> Value {
    json!({})
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value> {
    Ok(serde_json::to_value(payload)?)
}

//! Media engine boundary
//!
//! The engine performs ICE, DTLS, SRTP and RTP routing. The coordinator only
//! ever sees the handles declared here: transports, producers and consumers,
//! plus a stream of lifecycle events for things that close on the engine side.

use async_trait::async_trait;
use stagecast_core::{MediaKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::rtp::{DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, ProducerId, TransportId};

/// Lifecycle notifications emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A transport closed on the engine side (DTLS closed, ICE failure, ...)
    TransportClosed(TransportId),
    /// A producer closed on the engine side
    ProducerClosed(ProducerId),
    /// The engine worker process died; nothing it handed out is valid anymore
    WorkerDied,
}

/// Options for creating a consumer
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    /// Start paused; media flows after `Consumer::resume`
    pub paused: bool,
}

/// Entry point to the media engine (one worker, one router)
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Router capabilities, fixed at startup
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(&self) -> Result<Arc<dyn WebRtcTransport>>;

    /// Non-DTLS transport used to hand RTP to local processes
    async fn create_plain_transport(&self, listen_ip: &str) -> Result<Arc<dyn PlainTransport>>;

    /// Whether an endpoint with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    /// Complete the DTLS handshake with the remote endpoint's parameters
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>>;

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>>;

    /// Close the transport and everything created on it
    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait PlainTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Send RTP to `ip:port` (RTCP multiplexed on the same port)
    async fn connect(&self, ip: &str, port: u16) -> Result<()>;

    /// Remote address set by `connect`
    fn remote(&self) -> Option<SocketAddr>;

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Parameters negotiated for the receiving endpoint
    fn rtp_parameters(&self) -> RtpParameters;

    async fn resume(&self) -> Result<()>;

    fn is_paused(&self) -> bool;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

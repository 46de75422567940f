//! In-process media engine
//!
//! `LocalEngine` implements the negotiation side of the engine boundary:
//! capability checks, parameter derivation, identifiers and close cascades.
//! It never opens sockets or moves RTP, which makes it suitable for local
//! development of signaling clients and for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use stagecast_core::config::MediaConfig;
use stagecast_core::{Error, MediaKind, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::engine::{
    ConsumeOptions, Consumer, EngineEvent, MediaEngine, PlainTransport, Producer, WebRtcTransport,
};
use crate::rtp::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters, RtpCapabilities,
    RtpCodecParameters, RtpParameters,
};
use crate::types::{ConsumerId, ProducerId, TransportId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Live object counts, for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub webrtc_transports: usize,
    pub plain_transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct EngineState {
    capabilities: RtpCapabilities,
    announced_ip: String,
    rtc_min_port: u16,
    rtc_max_port: u16,
    next_port: AtomicU32,
    transports: DashMap<TransportId, Weak<LocalWebRtcTransport>>,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    consumers_by_producer: DashMap<ProducerId, Vec<Weak<LocalConsumer>>>,
    webrtc_transport_count: AtomicUsize,
    plain_transport_count: AtomicUsize,
    consumer_count: AtomicUsize,
    events: broadcast::Sender<EngineEvent>,
    alive: AtomicBool,
}

impl EngineState {
    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::EngineFatal)
        }
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.rtc_max_port - self.rtc_min_port) + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX + 1, and min + offset <= max
        self.rtc_min_port + u16::try_from(offset).unwrap_or_default()
    }

    /// Drop the producer record and close consumers fed by it
    fn forget_producer(&self, producer_id: &ProducerId) {
        self.producers.remove(producer_id);
        if let Some((_, consumers)) = self.consumers_by_producer.remove(producer_id) {
            for consumer in consumers.iter().filter_map(Weak::upgrade) {
                consumer.close();
            }
        }
    }

    fn create_consumer(
        self: &Arc<Self>,
        options: &ConsumeOptions,
        mid: u32,
    ) -> Result<Arc<LocalConsumer>> {
        self.ensure_alive()?;

        let producer = self
            .producers
            .get(&options.producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::ProducerNotFound(options.producer_id.to_string()))?;

        let producer_codec = producer
            .rtp_parameters
            .primary_codec()
            .ok_or_else(|| Error::Engine("producer has no codec".to_string()))?;

        let capability = options
            .rtp_capabilities
            .find_codec(producer_codec)
            .ok_or_else(|| Error::IncompatibleCapabilities(options.producer_id.to_string()))?;

        let codec = RtpCodecParameters {
            payload_type: capability
                .preferred_payload_type
                .unwrap_or(producer_codec.payload_type),
            rtcp_feedback: capability.rtcp_feedback.clone(),
            ..producer_codec.clone()
        };

        // low 32 bits of a fresh uuid are as good as any ssrc
        let ssrc = uuid::Uuid::new_v4().as_u128() as u32;
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs: vec![codec],
            header_extensions: Vec::new(),
            encodings: vec![json!({ "ssrc": ssrc })],
            rtcp: Some(json!({ "cname": producer.id.as_str(), "reducedSize": true })),
        };

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::random(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            engine: Arc::downgrade(self),
        });

        let mut entry = self
            .consumers_by_producer
            .entry(producer.id.clone())
            .or_default();
        entry.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
        entry.push(Arc::downgrade(&consumer));
        drop(entry);

        self.consumer_count.fetch_add(1, Ordering::SeqCst);
        debug!(
            consumer_id = %consumer.id,
            producer_id = %consumer.producer_id,
            paused = options.paused,
            "Consumer created"
        );

        Ok(consumer)
    }
}

/// In-process engine: one worker, one router
#[derive(Clone)]
pub struct LocalEngine {
    state: Arc<EngineState>,
}

impl LocalEngine {
    #[must_use]
    pub fn new(config: &MediaConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let announced_ip = config
            .announced_ip
            .clone()
            .unwrap_or_else(|| config.listen_ip.clone());

        info!(
            codecs = config.codecs.len(),
            announced_ip = %announced_ip,
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            "Local media engine started"
        );

        Self {
            state: Arc::new(EngineState {
                capabilities: RtpCapabilities::from_codecs(&config.codecs),
                announced_ip,
                rtc_min_port: config.rtc_min_port.min(config.rtc_max_port),
                rtc_max_port: config.rtc_max_port.max(config.rtc_min_port),
                next_port: AtomicU32::new(0),
                transports: DashMap::new(),
                producers: DashMap::new(),
                consumers_by_producer: DashMap::new(),
                webrtc_transport_count: AtomicUsize::new(0),
                plain_transport_count: AtomicUsize::new(0),
                consumer_count: AtomicUsize::new(0),
                events,
                alive: AtomicBool::new(true),
            }),
        }
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            webrtc_transports: self.state.webrtc_transport_count.load(Ordering::SeqCst),
            plain_transports: self.state.plain_transport_count.load(Ordering::SeqCst),
            producers: self.state.producers.len(),
            consumers: self.state.consumer_count.load(Ordering::SeqCst),
        }
    }

    /// Close a transport as if its DTLS session ended on the remote side
    pub fn close_transport_remotely(&self, transport_id: &TransportId) -> bool {
        let Some(transport) = self
            .state
            .transports
            .get(transport_id)
            .and_then(|entry| entry.value().upgrade())
        else {
            return false;
        };

        transport.close();
        self.state
            .emit(EngineEvent::TransportClosed(transport_id.clone()));
        true
    }

    /// Close a producer as if it failed inside the engine
    pub fn close_producer_remotely(&self, producer_id: &ProducerId) -> bool {
        let Some(producer) = self
            .state
            .producers
            .get(producer_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return false;
        };

        producer.close();
        self.state
            .emit(EngineEvent::ProducerClosed(producer_id.clone()));
        true
    }

    /// Simulate the worker process dying
    pub fn kill_worker(&self) {
        if self.state.alive.swap(false, Ordering::SeqCst) {
            error!("Local media engine worker died");
            self.state.emit(EngineEvent::WorkerDied);
        }
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.state.capabilities.clone()
    }

    async fn create_webrtc_transport(&self) -> Result<Arc<dyn WebRtcTransport>> {
        self.state.ensure_alive()?;

        let port = self.state.allocate_port();
        let ip = self.state.announced_ip.clone();
        let transport = Arc::new(LocalWebRtcTransport {
            id: TransportId::random(),
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates: vec![
                IceCandidate {
                    foundation: "udpcandidate".to_string(),
                    priority: 1_076_302_079,
                    ip: ip.clone(),
                    protocol: "udp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                },
                IceCandidate {
                    foundation: "tcpcandidate".to_string(),
                    priority: 1_076_276_479,
                    ip,
                    protocol: "tcp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                },
            ],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: pseudo_fingerprint(),
                }],
            },
            remote_dtls: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            next_mid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            engine: Arc::downgrade(&self.state),
        });

        self.state
            .transports
            .insert(transport.id.clone(), Arc::downgrade(&transport));
        self.state
            .webrtc_transport_count
            .fetch_add(1, Ordering::SeqCst);
        debug!(transport_id = %transport.id, port, "WebRTC transport created");

        Ok(transport)
    }

    async fn create_plain_transport(&self, listen_ip: &str) -> Result<Arc<dyn PlainTransport>> {
        self.state.ensure_alive()?;

        let listen_ip: IpAddr = listen_ip
            .parse()
            .map_err(|e| Error::InvalidRequest(format!("invalid listen ip {listen_ip}: {e}")))?;

        let transport = Arc::new(LocalPlainTransport {
            id: TransportId::random(),
            listen_ip,
            remote: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            next_mid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            engine: Arc::downgrade(&self.state),
        });

        self.state
            .plain_transport_count
            .fetch_add(1, Ordering::SeqCst);
        debug!(transport_id = %transport.id, listen_ip = %listen_ip, "Plain transport created");

        Ok(transport)
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.state.producers.get(producer_id).is_some_and(|producer| {
            !producer.is_closed()
                && producer
                    .rtp_parameters
                    .primary_codec()
                    .is_some_and(|codec| rtp_capabilities.find_codec(codec).is_some())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.state.events.subscribe()
    }
}

fn pseudo_fingerprint() -> String {
    let bytes = [
        uuid::Uuid::new_v4().into_bytes(),
        uuid::Uuid::new_v4().into_bytes(),
    ]
    .concat();
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn closed_error(id: &TransportId) -> Error {
    Error::TransportNotFound(format!("{id} (closed)"))
}

struct LocalWebRtcTransport {
    id: TransportId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    remote_dtls: Mutex<Option<DtlsParameters>>,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    next_mid: AtomicU32,
    closed: AtomicBool,
    engine: Weak<EngineState>,
}

impl LocalWebRtcTransport {
    fn engine(&self) -> Result<Arc<EngineState>> {
        if self.is_closed() {
            return Err(closed_error(&self.id));
        }
        let engine = self.engine.upgrade().ok_or(Error::EngineFatal)?;
        engine.ensure_alive()?;
        Ok(engine)
    }
}

#[async_trait]
impl WebRtcTransport for LocalWebRtcTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.engine()?;

        if dtls_parameters.fingerprints.is_empty() {
            return Err(Error::InvalidRequest(
                "dtlsParameters without fingerprints".to_string(),
            ));
        }

        let mut remote = self.remote_dtls.lock();
        match remote.as_ref() {
            // retried request with the same parameters
            Some(existing) if *existing == dtls_parameters => Ok(()),
            Some(_) => Err(Error::Engine(format!(
                "transport {} already connected",
                self.id
            ))),
            None => {
                *remote = Some(dtls_parameters);
                debug!(transport_id = %self.id, "DTLS connected");
                Ok(())
            }
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>> {
        let engine = self.engine()?;

        let codec = rtp_parameters
            .primary_codec()
            .ok_or_else(|| Error::InvalidRequest("rtpParameters without codecs".to_string()))?;

        if codec.kind() != Some(kind) {
            return Err(Error::InvalidRequest(format!(
                "codec {} does not carry {kind}",
                codec.mime_type
            )));
        }

        if engine.capabilities.find_codec(codec).is_none() {
            return Err(Error::Engine(format!(
                "codec {}/{} not supported by router",
                codec.mime_type, codec.clock_rate
            )));
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::random(),
            kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
            engine: Arc::downgrade(&engine),
        });

        engine
            .producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.producers.lock().push(Arc::clone(&producer));
        debug!(transport_id = %self.id, producer_id = %producer.id, %kind, "Producer created");

        Ok(producer)
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>> {
        let engine = self.engine()?;
        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let consumer = engine.create_consumer(&options, mid)?;
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for consumer in self.consumers.lock().drain(..) {
            consumer.close();
        }
        for producer in self.producers.lock().drain(..) {
            producer.close();
        }

        if let Some(engine) = self.engine.upgrade() {
            engine.transports.remove(&self.id);
            engine.webrtc_transport_count.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(transport_id = %self.id, "WebRTC transport closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct LocalPlainTransport {
    id: TransportId,
    listen_ip: IpAddr,
    remote: Mutex<Option<SocketAddr>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    next_mid: AtomicU32,
    closed: AtomicBool,
    engine: Weak<EngineState>,
}

impl LocalPlainTransport {
    fn engine(&self) -> Result<Arc<EngineState>> {
        if self.is_closed() {
            return Err(closed_error(&self.id));
        }
        let engine = self.engine.upgrade().ok_or(Error::EngineFatal)?;
        engine.ensure_alive()?;
        Ok(engine)
    }
}

#[async_trait]
impl PlainTransport for LocalPlainTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    async fn connect(&self, ip: &str, port: u16) -> Result<()> {
        self.engine()?;

        let ip: IpAddr = ip
            .parse()
            .map_err(|e| Error::InvalidRequest(format!("invalid remote ip {ip}: {e}")))?;

        let mut remote = self.remote.lock();
        if remote.is_some() {
            return Err(Error::Engine(format!(
                "plain transport {} already connected",
                self.id
            )));
        }
        *remote = Some(SocketAddr::new(ip, port));
        debug!(
            transport_id = %self.id,
            local = %self.listen_ip,
            remote = %SocketAddr::new(ip, port),
            "Plain transport connected"
        );
        Ok(())
    }

    fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>> {
        let engine = self.engine()?;
        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let consumer = engine.create_consumer(&options, mid)?;
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for consumer in self.consumers.lock().drain(..) {
            consumer.close();
        }

        if let Some(engine) = self.engine.upgrade() {
            engine.plain_transport_count.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(transport_id = %self.id, "Plain transport closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
    engine: Weak<EngineState>,
}

impl Producer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.forget_producer(&self.id);
        }
        debug!(producer_id = %self.id, "Producer closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    engine: Weak<EngineState>,
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConsumerNotFound(format!("{} (closed)", self.id)));
        }
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!(consumer_id = %self.id, "Consumer resumed");
        }
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.consumer_count.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(consumer_id = %self.id, "Consumer closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

//! Transport-agnostic signaling operations
//!
//! `Coordinator` ties the media engine, session registry, broadcaster and
//! transcode bridge together. Engine calls are awaited without any registry
//! lock held; their results are committed afterwards and closed again if
//! the commit is rejected.

use stagecast_core::config::Config;
use stagecast_core::{Error, MediaKind, Result};
use stagecast_sfu::rtp::{DtlsParameters, RtpCapabilities, RtpParameters};
use stagecast_sfu::{
    ConsumeOptions, ConsumerHandle, ConsumerId, EngineEvent, MediaEngine, PeerEvent, PeerId,
    ProducerHandle, ProducerId, SessionRegistry, Teardown, TopologyBroadcaster, TransportHandle,
    TransportRole,
};
use stagecast_transcode::TranscodeBridge;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::protocol::{ConsumerParams, TransportParams};

pub struct Coordinator {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<SessionRegistry>,
    broadcaster: TopologyBroadcaster,
    bridge: Option<TranscodeBridge>,
    fatal: watch::Sender<bool>,
}

impl Coordinator {
    /// Build the coordinator and start its engine event listener
    pub fn new(config: &Config, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let bridge = config.transcode.enabled.then(|| {
            TranscodeBridge::spawn(
                config.transcode.clone(),
                Arc::clone(&engine),
                Arc::clone(&registry),
            )
        });
        let (fatal, _) = watch::channel(false);

        let coordinator = Arc::new(Self {
            engine,
            registry,
            broadcaster: TopologyBroadcaster::new(config.signaling.announce_policy),
            bridge,
            fatal,
        });
        coordinator.spawn_engine_listener();
        coordinator
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn broadcaster(&self) -> &TopologyBroadcaster {
        &self.broadcaster
    }

    #[must_use]
    pub const fn bridge(&self) -> Option<&TranscodeBridge> {
        self.bridge.as_ref()
    }

    /// Flips to `true` once the engine worker died
    #[must_use]
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal.subscribe()
    }

    /// Register a new peer and open its event queue
    pub fn connect(&self) -> (PeerId, mpsc::UnboundedReceiver<PeerEvent>) {
        let mut peer_id = PeerId::generate();
        while !self.registry.register(peer_id.clone()) {
            peer_id = PeerId::generate();
        }

        let events = self.broadcaster.attach(peer_id.clone());
        self.broadcaster.send_to(
            &peer_id,
            PeerEvent::ConnectionSuccess {
                peer_id: peer_id.clone(),
            },
        );
        info!(peer_id = %peer_id, peers = self.registry.peer_count(), "Peer connected");
        (peer_id, events)
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.engine.rtp_capabilities()
    }

    pub async fn create_transport(&self, peer_id: &PeerId, sender: bool) -> Result<TransportParams> {
        let role = TransportRole::from_sender(sender);
        let transport = self.engine.create_webrtc_transport().await?;

        let params = TransportParams {
            id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        };

        let handle = Arc::new(TransportHandle::new(
            peer_id.clone(),
            role,
            Arc::clone(&transport),
        ));
        match self.registry.attach_transport(peer_id, role, handle) {
            Ok(replaced) => {
                if let Some(teardown) = replaced {
                    self.after_partial_teardown(&teardown);
                }
            }
            Err(e) => {
                transport.close();
                return Err(e);
            }
        }

        debug!(peer_id = %peer_id, transport_id = %params.id, role = %role, "Transport created");
        Ok(params)
    }

    /// DTLS connect on one of the peer's transports
    ///
    /// A missing transport is logged and otherwise ignored. The first
    /// successful connect of the producing transport sends the room snapshot.
    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let transport = match self.registry.transport(peer_id, role) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(peer_id = %peer_id, role = %role, error = %e, "Connect without transport");
                return Ok(());
            }
        };

        transport.transport().connect(dtls_parameters).await?;
        debug!(peer_id = %peer_id, role = %role, "Transport connected");

        if role == TransportRole::Producing && self.registry.mark_snapshot_sent(peer_id) {
            let others = self.registry.list_producers_excluding(peer_id);
            self.broadcaster.snapshot(peer_id, others);
        }
        Ok(())
    }

    pub async fn produce(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let transport = self.registry.transport(peer_id, TransportRole::Producing)?;
        let producer = transport.transport().produce(kind, rtp_parameters).await?;

        let handle = Arc::new(ProducerHandle::new(
            peer_id.clone(),
            transport.id().clone(),
            producer,
        ));
        let added = match self.registry.add_producer(peer_id, Arc::clone(&handle)) {
            Ok(added) => added,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };

        let producer_id = handle.id().clone();
        self.broadcaster.producer_added(peer_id, added.peer_producers);
        if kind == MediaKind::Video {
            if let Some(bridge) = &self.bridge {
                bridge.video_produced(producer_id.clone());
            }
        }
        Ok(producer_id)
    }

    pub async fn consume(
        &self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams> {
        if self.registry.find_producer(producer_id).is_none() {
            return Err(Error::ProducerNotFound(producer_id.to_string()));
        }
        if !self.engine.can_consume(producer_id, &rtp_capabilities) {
            return Err(Error::IncompatibleCapabilities(producer_id.to_string()));
        }

        let transport = self.registry.transport(peer_id, TransportRole::Consuming)?;
        let consumer = transport
            .transport()
            .consume(ConsumeOptions {
                producer_id: producer_id.clone(),
                rtp_capabilities,
                paused: true,
            })
            .await?;

        let handle = Arc::new(ConsumerHandle::new(
            peer_id.clone(),
            transport.id().clone(),
            consumer,
        ));
        if let Err(e) = self.registry.add_consumer(peer_id, Arc::clone(&handle)) {
            handle.close();
            return Err(e);
        }

        let consumer = handle.consumer();
        Ok(ConsumerParams {
            id: handle.id().clone(),
            producer_id: producer_id.clone(),
            kind: handle.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    pub async fn resume_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        let consumer = self.registry.find_consumer(peer_id, consumer_id)?;
        consumer.resume().await
    }

    /// Tear down everything the peer owns, then tell the others
    pub fn disconnect(&self, peer_id: &PeerId) {
        self.broadcaster.detach(peer_id);

        let Some(teardown) = self.registry.unregister(peer_id) else {
            return;
        };

        let notified = self.broadcaster.peer_left(peer_id);
        if let Some(bridge) = &self.bridge {
            bridge.producers_closed(&teardown);
        }
        info!(
            peer_id = %peer_id,
            notified,
            peers = self.registry.peer_count(),
            "Peer disconnected"
        );
    }

    /// Stop the transcode bridge
    pub async fn shutdown(&self) {
        if let Some(bridge) = &self.bridge {
            bridge.shutdown().await;
        }
    }

    /// Producers closed without the peer leaving
    fn after_partial_teardown(&self, teardown: &Teardown) {
        if teardown.closed_producers.is_empty() {
            return;
        }

        if let Some(bridge) = &self.bridge {
            bridge.producers_closed(teardown);
        }
        if teardown.owner_remaining_producers == 0 {
            if let Some(owner) = &teardown.peer_id {
                self.broadcaster.peer_left(owner);
            }
        }
    }

    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportClosed(transport_id) => {
                if let Some(teardown) = self.registry.transport_closed(&transport_id) {
                    self.after_partial_teardown(&teardown);
                }
            }
            EngineEvent::ProducerClosed(producer_id) => {
                if let Some(teardown) = self.registry.remove_producer(&producer_id) {
                    self.after_partial_teardown(&teardown);
                }
            }
            EngineEvent::WorkerDied => {
                error!("Media engine worker died");
                self.fatal.send_replace(true);
            }
        }
    }

    fn spawn_engine_listener(self: &Arc<Self>) {
        let mut events = self.engine.subscribe();
        let coordinator: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(coordinator) = coordinator.upgrade() else {
                            break;
                        };
                        debug!(event = ?event, "Engine event");
                        coordinator.handle_engine_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Engine event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

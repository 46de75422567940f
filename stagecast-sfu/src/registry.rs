//! Session registry
//!
//! Authoritative record of connected peers and the transports, producers and
//! consumers they own. All state sits behind one mutex that is never held
//! across an `.await`: engine objects are created first, then committed here
//! after re-validating that their owner (and for consumers, their producer)
//! is still present. Removals detach handles under the lock and close them
//! after it is released, in consumer → producer → transport order.

use indexmap::IndexMap;
use parking_lot::Mutex;
use stagecast_core::config::SelectionPolicy;
use stagecast_core::{Error, MediaKind, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::broadcaster::{PeerProducers, ProducerDescriptor};
use crate::handle::{ConsumerHandle, ProducerHandle, TransportHandle, TransportRole};
use crate::peer::PeerSession;
use crate::types::{ConsumerId, PeerId, ProducerId, TransportId};

/// What a removal closed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    pub peer_id: Option<PeerId>,
    pub closed_consumers: Vec<ConsumerId>,
    pub closed_producers: Vec<ProducerDescriptor>,
    pub closed_transports: Vec<TransportId>,
    /// Producers left in the whole registry afterwards
    pub remaining_producers: usize,
    /// Producers the affected peer still owns afterwards
    pub owner_remaining_producers: usize,
}

impl Teardown {
    #[must_use]
    pub fn closed_video_producers(&self) -> Vec<ProducerId> {
        self.closed_producers
            .iter()
            .filter(|p| p.kind == MediaKind::Video)
            .map(|p| p.id.clone())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.closed_consumers.is_empty()
            && self.closed_producers.is_empty()
            && self.closed_transports.is_empty()
    }
}

/// Result of committing a new producer
#[derive(Debug, Clone)]
pub struct ProducerAdded {
    /// All of the owner's producers, in creation order
    pub peer_producers: Vec<ProducerDescriptor>,
    pub total_producers: usize,
}

/// Handles removed from the maps, waiting to be closed
#[derive(Default)]
struct Detached {
    consumers: Vec<Arc<ConsumerHandle>>,
    producers: Vec<Arc<ProducerHandle>>,
    transports: Vec<Arc<TransportHandle>>,
}

impl Detached {
    fn close(self, peer_id: Option<PeerId>, remaining: (usize, usize)) -> Teardown {
        for consumer in &self.consumers {
            consumer.close();
        }
        for producer in &self.producers {
            producer.close();
        }
        for transport in &self.transports {
            transport.close();
        }

        Teardown {
            peer_id,
            closed_consumers: self.consumers.iter().map(|c| c.id().clone()).collect(),
            closed_producers: self
                .producers
                .iter()
                .map(|p| ProducerDescriptor {
                    id: p.id().clone(),
                    kind: p.kind(),
                })
                .collect(),
            closed_transports: self.transports.iter().map(|t| t.id().clone()).collect(),
            remaining_producers: remaining.0,
            owner_remaining_producers: remaining.1,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    peers: IndexMap<PeerId, PeerSession>,
    producers: IndexMap<ProducerId, Arc<ProducerHandle>>,
    consumers: HashMap<ConsumerId, Arc<ConsumerHandle>>,
}

impl RegistryState {
    /// (all producers, producers owned by `peer_id`)
    fn remaining(&self, peer_id: &PeerId) -> (usize, usize) {
        (
            self.producers.len(),
            self.peers.get(peer_id).map_or(0, |s| s.producers.len()),
        )
    }

    fn session(&self, peer_id: &PeerId) -> Result<&PeerSession> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))
    }

    fn detach_consumer(&mut self, consumer_id: &ConsumerId) -> Option<Arc<ConsumerHandle>> {
        let consumer = self.consumers.remove(consumer_id)?;
        if let Some(owner) = self.peers.get_mut(consumer.owner()) {
            owner.consumers.shift_remove(consumer_id);
        }
        Some(consumer)
    }

    /// Remove a producer plus every consumer fed by it
    fn detach_producer(&mut self, producer_id: &ProducerId, detached: &mut Detached) {
        let Some(producer) = self.producers.shift_remove(producer_id) else {
            return;
        };

        let dependents: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.producer_id() == producer_id)
            .map(|c| c.id().clone())
            .collect();
        for consumer_id in dependents {
            if let Some(consumer) = self.detach_consumer(&consumer_id) {
                detached.consumers.push(consumer);
            }
        }

        if let Some(owner) = self.peers.get_mut(producer.owner()) {
            owner.producers.shift_remove(producer_id);
        }
        detached.producers.push(producer);
    }

    /// Remove everything created on a transport
    fn detach_transport_contents(&mut self, transport_id: &TransportId, detached: &mut Detached) {
        let consumers: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.transport_id() == transport_id)
            .map(|c| c.id().clone())
            .collect();
        for consumer_id in consumers {
            if let Some(consumer) = self.detach_consumer(&consumer_id) {
                detached.consumers.push(consumer);
            }
        }

        let producers: Vec<ProducerId> = self
            .producers
            .values()
            .filter(|p| p.transport_id() == transport_id)
            .map(|p| p.id().clone())
            .collect();
        for producer_id in producers {
            self.detach_producer(&producer_id, detached);
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty session; returns false if the peer already exists
    pub fn register(&self, peer_id: PeerId) -> bool {
        let mut state = self.state.lock();
        if state.peers.contains_key(&peer_id) {
            return false;
        }
        debug!(peer_id = %peer_id, "Peer registered");
        state.peers.insert(peer_id.clone(), PeerSession::new(peer_id));
        true
    }

    /// Remove a peer and close everything it owns
    ///
    /// Consumers go first (the peer's own, then others' consumers of its
    /// producers), then producers, then transports. The session entry is
    /// gone before this returns.
    pub fn unregister(&self, peer_id: &PeerId) -> Option<Teardown> {
        let (detached, remaining) = {
            let mut state = self.state.lock();
            let session = state.peers.get(peer_id)?;
            let own_consumers: Vec<ConsumerId> = session.consumers.iter().cloned().collect();
            let own_producers: Vec<ProducerId> = session.producers.iter().cloned().collect();

            let mut detached = Detached::default();
            for consumer_id in own_consumers {
                if let Some(consumer) = state.detach_consumer(&consumer_id) {
                    detached.consumers.push(consumer);
                }
            }
            for producer_id in own_producers {
                state.detach_producer(&producer_id, &mut detached);
            }

            if let Some(mut session) = state.peers.shift_remove(peer_id) {
                detached
                    .transports
                    .extend(session.producing_transport.take());
                detached
                    .transports
                    .extend(session.consuming_transport.take());
            }
            (detached, state.remaining(peer_id))
        };

        let teardown = detached.close(Some(peer_id.clone()), remaining);
        info!(
            peer_id = %peer_id,
            consumers = teardown.closed_consumers.len(),
            producers = teardown.closed_producers.len(),
            transports = teardown.closed_transports.len(),
            "Peer unregistered"
        );
        Some(teardown)
    }

    /// Store a transport for a role, closing the one it replaces
    ///
    /// Fails with `PeerNotFound` if the peer left meanwhile; the caller owns
    /// closing `transport` in that case.
    pub fn attach_transport(
        &self,
        peer_id: &PeerId,
        role: TransportRole,
        transport: Arc<TransportHandle>,
    ) -> Result<Option<Teardown>> {
        let (detached, remaining) = {
            let mut state = self.state.lock();
            let session = state
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;

            let Some(previous) = session.transport_slot(role).replace(transport) else {
                return Ok(None);
            };

            let mut detached = Detached::default();
            state.detach_transport_contents(previous.id(), &mut detached);
            detached.transports.push(previous);
            (detached, state.remaining(peer_id))
        };

        debug!(peer_id = %peer_id, role = %role, "Replaced existing transport");
        Ok(Some(detached.close(Some(peer_id.clone()), remaining)))
    }

    pub fn transport(&self, peer_id: &PeerId, role: TransportRole) -> Result<Arc<TransportHandle>> {
        let state = self.state.lock();
        let transport = state.session(peer_id)?.transport(role).cloned();
        transport.ok_or_else(|| Error::TransportNotFound(format!("{role} transport of {peer_id}")))
    }

    /// Commit a producer created on the peer's producing transport
    ///
    /// Fails if the peer left or its producing transport was replaced while
    /// the engine call was in flight; the caller closes the producer then.
    pub fn add_producer(
        &self,
        peer_id: &PeerId,
        producer: Arc<ProducerHandle>,
    ) -> Result<ProducerAdded> {
        let mut state = self.state.lock();
        let session = state
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;

        let current = session
            .producing_transport
            .as_ref()
            .is_some_and(|t| t.id() == producer.transport_id());
        if !current {
            return Err(Error::TransportNotFound(producer.transport_id().to_string()));
        }

        session.producers.insert(producer.id().clone());
        let owned: Vec<ProducerId> = session.producers.iter().cloned().collect();
        state
            .producers
            .insert(producer.id().clone(), Arc::clone(&producer));

        let peer_producers = owned
            .iter()
            .filter_map(|id| state.producers.get(id))
            .map(|p| ProducerDescriptor {
                id: p.id().clone(),
                kind: p.kind(),
            })
            .collect();

        info!(
            peer_id = %peer_id,
            producer_id = %producer.id(),
            kind = %producer.kind(),
            "Producer registered"
        );

        Ok(ProducerAdded {
            peer_producers,
            total_producers: state.producers.len(),
        })
    }

    /// Remove one producer (engine-side close) and its consumers
    pub fn remove_producer(&self, producer_id: &ProducerId) -> Option<Teardown> {
        let (detached, owner, remaining) = {
            let mut state = self.state.lock();
            let owner = state.producers.get(producer_id)?.owner().clone();
            let mut detached = Detached::default();
            state.detach_producer(producer_id, &mut detached);
            let remaining = state.remaining(&owner);
            (detached, owner, remaining)
        };

        debug!(producer_id = %producer_id, peer_id = %owner, "Producer removed");
        Some(detached.close(Some(owner), remaining))
    }

    /// Commit a consumer created on the peer's consuming transport
    ///
    /// Re-checks that the producer is still registered: a consumer is never
    /// recorded for a producer that went away during the engine call.
    pub fn add_consumer(&self, peer_id: &PeerId, consumer: Arc<ConsumerHandle>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.producers.contains_key(consumer.producer_id()) {
            return Err(Error::ProducerNotFound(consumer.producer_id().to_string()));
        }

        let session = state
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;

        let current = session
            .consuming_transport
            .as_ref()
            .is_some_and(|t| t.id() == consumer.transport_id());
        if !current {
            return Err(Error::TransportNotFound(consumer.transport_id().to_string()));
        }

        session.consumers.insert(consumer.id().clone());
        debug!(
            peer_id = %peer_id,
            consumer_id = %consumer.id(),
            producer_id = %consumer.producer_id(),
            "Consumer registered"
        );
        state.consumers.insert(consumer.id().clone(), consumer);
        Ok(())
    }

    pub fn remove_consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<ConsumerHandle>> {
        let consumer = self.state.lock().detach_consumer(consumer_id)?;
        consumer.close();
        Some(consumer)
    }

    #[must_use]
    pub fn find_producer(&self, producer_id: &ProducerId) -> Option<Arc<ProducerHandle>> {
        self.state.lock().producers.get(producer_id).cloned()
    }

    /// Look up a consumer owned by `peer_id`
    pub fn find_consumer(
        &self,
        peer_id: &PeerId,
        consumer_id: &ConsumerId,
    ) -> Result<Arc<ConsumerHandle>> {
        self.state
            .lock()
            .consumers
            .get(consumer_id)
            .filter(|c| c.owner() == peer_id)
            .cloned()
            .ok_or_else(|| Error::ConsumerNotFound(consumer_id.to_string()))
    }

    /// Other peers' producers, grouped by peer in join order
    #[must_use]
    pub fn list_producers_excluding(&self, peer_id: &PeerId) -> Vec<PeerProducers> {
        let state = self.state.lock();
        state
            .peers
            .values()
            .filter(|session| &session.peer_id != peer_id && !session.producers.is_empty())
            .map(|session| PeerProducers {
                peer_id: session.peer_id.clone(),
                producers: session
                    .producers
                    .iter()
                    .filter_map(|id| state.producers.get(id))
                    .map(|p| ProducerDescriptor {
                        id: p.id().clone(),
                        kind: p.kind(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Engine closed a transport: drop it from its owner and cascade
    pub fn transport_closed(&self, transport_id: &TransportId) -> Option<Teardown> {
        let (detached, owner, remaining) = {
            let mut state = self.state.lock();
            let (owner, role) = state
                .peers
                .values()
                .find_map(|s| s.role_of(transport_id).map(|r| (s.peer_id.clone(), r)))?;

            let mut detached = Detached::default();
            state.detach_transport_contents(transport_id, &mut detached);
            if let Some(session) = state.peers.get_mut(&owner) {
                detached.transports.extend(session.transport_slot(role).take());
            }
            let remaining = state.remaining(&owner);
            (detached, owner, remaining)
        };

        debug!(transport_id = %transport_id, peer_id = %owner, "Transport closed by engine");
        Some(detached.close(Some(owner), remaining))
    }

    /// Pick the video producer the transcode bridge should tap
    #[must_use]
    pub fn select_video_producer(&self, policy: SelectionPolicy) -> Option<ProducerId> {
        let state = self.state.lock();
        let selected = match policy {
            SelectionPolicy::FirstRegistered => state
                .peers
                .values()
                .flat_map(|session| session.producers.iter())
                .find(|id| {
                    state
                        .producers
                        .get(*id)
                        .is_some_and(|p| p.kind() == MediaKind::Video)
                })
                .cloned(),
            SelectionPolicy::Latest => state
                .producers
                .values()
                .rev()
                .find(|p| p.kind() == MediaKind::Video)
                .map(|p| p.id().clone()),
        };
        selected
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    #[must_use]
    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.state.lock().peers.contains_key(peer_id)
    }

    /// Number of peers with at least one (audio, video) producer
    #[must_use]
    pub fn kind_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        let has_kind = |session: &PeerSession, kind: MediaKind| {
            session
                .producers
                .iter()
                .any(|id| state.producers.get(id).is_some_and(|p| p.kind() == kind))
        };

        state.peers.values().fold((0, 0), |(audio, video), session| {
            (
                audio + usize::from(has_kind(session, MediaKind::Audio)),
                video + usize::from(has_kind(session, MediaKind::Video)),
            )
        })
    }

    /// Flip the snapshot flag; true only for the call that flipped it
    pub fn mark_snapshot_sent(&self, peer_id: &PeerId) -> bool {
        let mut state = self.state.lock();
        match state.peers.get_mut(peer_id) {
            Some(session) if !session.snapshot_sent => {
                session.snapshot_sent = true;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConsumeOptions, MediaEngine};
    use crate::local_engine::tests::{opus_parameters, vp8_parameters};
    use crate::local_engine::LocalEngine;
    use stagecast_core::config::MediaConfig;

    struct Fixture {
        engine: LocalEngine,
        registry: SessionRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                engine: LocalEngine::new(&MediaConfig::default()),
                registry: SessionRegistry::new(),
            }
        }

        async fn join(&self, name: &str) -> PeerId {
            let peer = PeerId::from(name);
            assert!(self.registry.register(peer.clone()));
            for role in [TransportRole::Producing, TransportRole::Consuming] {
                let transport = self.engine.create_webrtc_transport().await.unwrap();
                let handle = Arc::new(TransportHandle::new(peer.clone(), role, transport));
                assert!(self
                    .registry
                    .attach_transport(&peer, role, handle)
                    .unwrap()
                    .is_none());
            }
            peer
        }

        async fn produce(&self, peer: &PeerId, kind: MediaKind) -> ProducerId {
            let transport = self
                .registry
                .transport(peer, TransportRole::Producing)
                .unwrap();
            let params = match kind {
                MediaKind::Audio => opus_parameters(),
                MediaKind::Video => vp8_parameters(),
            };
            let producer = transport.transport().produce(kind, params).await.unwrap();
            let handle = Arc::new(ProducerHandle::new(
                peer.clone(),
                transport.id().clone(),
                producer,
            ));
            let id = handle.id().clone();
            self.registry.add_producer(peer, handle).unwrap();
            id
        }

        async fn consume(&self, peer: &PeerId, producer_id: &ProducerId) -> Result<ConsumerId> {
            let transport = self
                .registry
                .transport(peer, TransportRole::Consuming)?;
            let consumer = transport
                .transport()
                .consume(ConsumeOptions {
                    producer_id: producer_id.clone(),
                    rtp_capabilities: self.engine.rtp_capabilities(),
                    paused: true,
                })
                .await?;
            let handle = Arc::new(ConsumerHandle::new(
                peer.clone(),
                transport.id().clone(),
                consumer,
            ));
            let id = handle.id().clone();
            self.registry.add_consumer(peer, handle)?;
            Ok(id)
        }
    }

    #[tokio::test]
    async fn test_register_is_unique() {
        let registry = SessionRegistry::new();
        assert!(registry.register(PeerId::from("a")));
        assert!(!registry.register(PeerId::from("a")));
        assert_eq!(registry.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_leaves_nothing_behind() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        let b = fx.join("b").await;

        let video = fx.produce(&a, MediaKind::Video).await;
        fx.produce(&a, MediaKind::Audio).await;
        let b_video = fx.produce(&b, MediaKind::Video).await;
        let b_consumer = fx.consume(&b, &video).await.unwrap();
        fx.consume(&a, &b_video).await.unwrap();

        let teardown = fx.registry.unregister(&a).unwrap();
        assert_eq!(teardown.peer_id, Some(a.clone()));
        assert_eq!(teardown.closed_producers.len(), 2);
        assert_eq!(teardown.closed_transports.len(), 2);
        // a's own consumer plus b's consumer of a's video
        assert_eq!(teardown.closed_consumers.len(), 2);
        assert!(teardown.closed_consumers.contains(&b_consumer));
        assert_eq!(teardown.remaining_producers, 1);
        assert_eq!(teardown.owner_remaining_producers, 0);

        assert!(!fx.registry.contains_peer(&a));
        assert!(fx.registry.find_producer(&video).is_none());
        assert!(fx.registry.find_consumer(&b, &b_consumer).is_err());
        assert_eq!(fx.registry.consumer_count(), 0);
        assert!(fx.registry.list_producers_excluding(&b).is_empty());

        // engine side is closed as well
        assert_eq!(fx.engine.stats().producers, 1);
        assert_eq!(fx.engine.stats().consumers, 0);

        // second removal is a no-op
        assert!(fx.registry.unregister(&a).is_none());
    }

    #[tokio::test]
    async fn test_consume_of_departed_producer_fails() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        let b = fx.join("b").await;
        let video = fx.produce(&a, MediaKind::Video).await;

        fx.registry.unregister(&a);
        let err = fx.consume(&b, &video).await.unwrap_err();
        assert!(matches!(err, Error::ProducerNotFound(_)));
    }

    #[tokio::test]
    async fn test_producer_removed_during_consume_is_rejected() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        let b = fx.join("b").await;
        let video = fx.produce(&a, MediaKind::Video).await;

        let transport = fx.registry.transport(&b, TransportRole::Consuming).unwrap();
        let consumer = transport
            .transport()
            .consume(ConsumeOptions {
                producer_id: video.clone(),
                rtp_capabilities: fx.engine.rtp_capabilities(),
                paused: true,
            })
            .await
            .unwrap();

        // producer goes away before the commit
        fx.registry.remove_producer(&video).unwrap();

        let handle = Arc::new(ConsumerHandle::new(
            b.clone(),
            transport.id().clone(),
            consumer,
        ));
        assert!(matches!(
            fx.registry.add_consumer(&b, handle),
            Err(Error::ProducerNotFound(_))
        ));
        assert_eq!(fx.registry.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_replacing_transport_cascades() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        fx.produce(&a, MediaKind::Video).await;

        let transport = fx.engine.create_webrtc_transport().await.unwrap();
        let handle = Arc::new(TransportHandle::new(
            a.clone(),
            TransportRole::Producing,
            transport,
        ));
        let teardown = fx
            .registry
            .attach_transport(&a, TransportRole::Producing, handle)
            .unwrap()
            .unwrap();

        assert_eq!(teardown.closed_producers.len(), 1);
        assert_eq!(teardown.closed_transports.len(), 1);
        assert_eq!(fx.registry.producer_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_transport_close_cascades() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        let b = fx.join("b").await;
        let video = fx.produce(&a, MediaKind::Video).await;
        fx.consume(&b, &video).await.unwrap();

        let transport = fx.registry.transport(&a, TransportRole::Producing).unwrap();
        let teardown = fx.registry.transport_closed(transport.id()).unwrap();
        assert_eq!(teardown.closed_video_producers(), vec![video]);
        assert_eq!(teardown.closed_consumers.len(), 1);
        assert!(fx
            .registry
            .transport(&a, TransportRole::Producing)
            .is_err());
        // peer stays registered
        assert!(fx.registry.contains_peer(&a));
    }

    #[tokio::test]
    async fn test_stale_transport_producer_rejected() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        let old = fx.registry.transport(&a, TransportRole::Producing).unwrap();
        let producer = old
            .transport()
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        let replacement = fx.engine.create_webrtc_transport().await.unwrap();
        fx.registry
            .attach_transport(
                &a,
                TransportRole::Producing,
                Arc::new(TransportHandle::new(
                    a.clone(),
                    TransportRole::Producing,
                    replacement,
                )),
            )
            .unwrap();

        let handle = Arc::new(ProducerHandle::new(a.clone(), old.id().clone(), producer));
        assert!(matches!(
            fx.registry.add_producer(&a, handle),
            Err(Error::TransportNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_video_selection_policies() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        let b = fx.join("b").await;

        assert!(fx
            .registry
            .select_video_producer(SelectionPolicy::FirstRegistered)
            .is_none());

        fx.produce(&b, MediaKind::Audio).await;
        let b_video = fx.produce(&b, MediaKind::Video).await;
        let a_video = fx.produce(&a, MediaKind::Video).await;

        // peers in join order first
        assert_eq!(
            fx.registry
                .select_video_producer(SelectionPolicy::FirstRegistered),
            Some(a_video.clone())
        );
        assert_eq!(
            fx.registry.select_video_producer(SelectionPolicy::Latest),
            Some(a_video)
        );

        fx.registry.unregister(&a);
        assert_eq!(
            fx.registry
                .select_video_producer(SelectionPolicy::FirstRegistered),
            Some(b_video)
        );
    }

    #[tokio::test]
    async fn test_kind_counts_and_listing() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        let b = fx.join("b").await;
        fx.produce(&a, MediaKind::Video).await;
        fx.produce(&a, MediaKind::Audio).await;
        fx.produce(&b, MediaKind::Video).await;

        assert_eq!(fx.registry.kind_counts(), (1, 2));

        let others = fx.registry.list_producers_excluding(&b);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].peer_id, a);
        assert_eq!(others[0].producers[0].kind, MediaKind::Video);
        assert_eq!(others[0].producers[1].kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_snapshot_flag_flips_once() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        assert!(fx.registry.mark_snapshot_sent(&a));
        assert!(!fx.registry.mark_snapshot_sent(&a));
        assert!(!fx.registry.mark_snapshot_sent(&PeerId::from("ghost")));
    }

    #[tokio::test]
    async fn test_find_consumer_checks_owner() {
        let fx = Fixture::new();
        let a = fx.join("a").await;
        let b = fx.join("b").await;
        let video = fx.produce(&a, MediaKind::Video).await;
        let consumer = fx.consume(&b, &video).await.unwrap();

        assert!(fx.registry.find_consumer(&b, &consumer).is_ok());
        assert!(matches!(
            fx.registry.find_consumer(&a, &consumer),
            Err(Error::ConsumerNotFound(_))
        ));

        assert!(fx.registry.remove_consumer(&consumer).is_some());
        assert!(fx.registry.remove_consumer(&consumer).is_none());
    }
}

//! Topology notifications fanned out to connected peers

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stagecast_core::config::AnnouncePolicy;
use stagecast_core::MediaKind;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::types::{PeerId, ProducerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerDescriptor {
    pub id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerProducers {
    pub peer_id: PeerId,
    pub producers: Vec<ProducerDescriptor>,
}

/// Server-initiated events, serialized as `{"event": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PeerEvent {
    #[serde(rename_all = "camelCase")]
    ConnectionSuccess { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producers: Vec<ProducerDescriptor>,
        peer_id: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { peer_id: PeerId },
    RoomJoined(Vec<PeerProducers>),
}

impl PeerEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectionSuccess { .. } => "connectionSuccess",
            Self::NewProducer { .. } => "newProducer",
            Self::ProducerClosed { .. } => "producerClosed",
            Self::RoomJoined(_) => "roomJoined",
        }
    }
}

/// Whether a peer's producer set is ready to be announced
#[must_use]
pub fn is_announceable(policy: AnnouncePolicy, producers: &[ProducerDescriptor]) -> bool {
    match policy {
        AnnouncePolicy::EveryProducer => !producers.is_empty(),
        AnnouncePolicy::AudioAndVideo => {
            producers.len() >= 2
                && producers.iter().any(|p| p.kind == MediaKind::Audio)
                && producers.iter().any(|p| p.kind == MediaKind::Video)
        }
    }
}

/// Per-peer outbound queues
pub struct TopologyBroadcaster {
    outbound: DashMap<PeerId, mpsc::UnboundedSender<PeerEvent>>,
    policy: AnnouncePolicy,
}

impl TopologyBroadcaster {
    #[must_use]
    pub fn new(policy: AnnouncePolicy) -> Self {
        Self {
            outbound: DashMap::new(),
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> AnnouncePolicy {
        self.policy
    }

    /// Open the outbound queue for a peer; the receiver feeds its writer task
    pub fn attach(&self, peer_id: PeerId) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound.insert(peer_id, tx);
        rx
    }

    pub fn detach(&self, peer_id: &PeerId) {
        self.outbound.remove(peer_id);
    }

    #[must_use]
    pub fn connected(&self) -> usize {
        self.outbound.len()
    }

    pub fn send_to(&self, peer_id: &PeerId, event: PeerEvent) -> bool {
        let Some(tx) = self.outbound.get(peer_id) else {
            debug!(peer_id = %peer_id, event = event.name(), "Dropping event for detached peer");
            return false;
        };

        if tx.send(event).is_err() {
            debug!(peer_id = %peer_id, "Outbound queue closed");
            return false;
        }
        true
    }

    /// Deliver to every attached peer except `origin`; returns deliveries
    pub fn broadcast_except(&self, origin: &PeerId, event: &PeerEvent) -> usize {
        let mut delivered = 0;
        for entry in &self.outbound {
            if entry.key() == origin {
                continue;
            }
            if entry.value().send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(peer_id = %entry.key(), event = event.name(), "Skipping closed queue");
            }
        }
        delivered
    }

    /// Announce a peer's producers if the policy allows; returns whether it did
    pub fn producer_added(&self, peer_id: &PeerId, producers: Vec<ProducerDescriptor>) -> bool {
        if !is_announceable(self.policy, &producers) {
            debug!(
                peer_id = %peer_id,
                producers = producers.len(),
                "Withholding newProducer until announce policy is met"
            );
            return false;
        }

        let count = producers.len();
        let delivered = self.broadcast_except(
            peer_id,
            &PeerEvent::NewProducer {
                producers,
                peer_id: peer_id.clone(),
            },
        );
        info!(peer_id = %peer_id, producers = count, delivered, "Announced producers");
        true
    }

    /// Tell everyone else that a peer's producers are gone
    pub fn peer_left(&self, peer_id: &PeerId) -> usize {
        self.broadcast_except(
            peer_id,
            &PeerEvent::ProducerClosed {
                peer_id: peer_id.clone(),
            },
        )
    }

    /// Send the `roomJoined` snapshot, keeping only announceable peers
    pub fn snapshot(&self, peer_id: &PeerId, others: Vec<PeerProducers>) -> bool {
        let peers: Vec<PeerProducers> = others
            .into_iter()
            .filter(|p| is_announceable(self.policy, &p.producers))
            .collect();
        debug!(peer_id = %peer_id, peers = peers.len(), "Sending room snapshot");
        self.send_to(peer_id, PeerEvent::RoomJoined(peers))
    }
}

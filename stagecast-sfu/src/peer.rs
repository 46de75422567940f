use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use std::sync::Arc;

use crate::handle::{TransportHandle, TransportRole};
use crate::types::{ConsumerId, PeerId, ProducerId};

/// Per-connection state
///
/// Handles themselves live in the registry indices; a session only keeps
/// ids, in the order they were created.
#[derive(Debug)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub joined_at: DateTime<Utc>,
    pub producing_transport: Option<Arc<TransportHandle>>,
    pub consuming_transport: Option<Arc<TransportHandle>>,
    pub producers: IndexSet<ProducerId>,
    pub consumers: IndexSet<ConsumerId>,
    /// Whether the one-time `roomJoined` snapshot went out
    pub snapshot_sent: bool,
}

impl PeerSession {
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            joined_at: Utc::now(),
            producing_transport: None,
            consuming_transport: None,
            producers: IndexSet::new(),
            consumers: IndexSet::new(),
            snapshot_sent: false,
        }
    }

    #[must_use]
    pub fn transport(&self, role: TransportRole) -> Option<&Arc<TransportHandle>> {
        match role {
            TransportRole::Producing => self.producing_transport.as_ref(),
            TransportRole::Consuming => self.consuming_transport.as_ref(),
        }
    }

    pub fn transport_slot(&mut self, role: TransportRole) -> &mut Option<Arc<TransportHandle>> {
        match role {
            TransportRole::Producing => &mut self.producing_transport,
            TransportRole::Consuming => &mut self.consuming_transport,
        }
    }

    /// Role of the transport with `id`, if this peer owns it
    #[must_use]
    pub fn role_of(&self, id: &crate::types::TransportId) -> Option<TransportRole> {
        [TransportRole::Producing, TransportRole::Consuming]
            .into_iter()
            .find(|role| self.transport(*role).is_some_and(|t| t.id() == id))
    }
}

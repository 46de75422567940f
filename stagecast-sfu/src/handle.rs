//! Registry-side wrappers around engine objects
//!
//! Each handle records who owns the engine object and which transport it
//! lives on, so the registry can cascade closes without asking the engine.

use stagecast_core::{MediaKind, Result};
use std::sync::Arc;

use crate::engine::{Consumer, Producer, WebRtcTransport};
use crate::types::{ConsumerId, PeerId, ProducerId, TransportId};

/// Direction of a peer's WebRTC transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportRole {
    /// Carries the peer's outbound media (`sender: true`)
    Producing,
    /// Carries media the peer receives
    Consuming,
}

impl TransportRole {
    #[must_use]
    pub const fn from_sender(sender: bool) -> Self {
        if sender {
            Self::Producing
        } else {
            Self::Consuming
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Producing => "producing",
            Self::Consuming => "consuming",
        }
    }
}

impl std::fmt::Display for TransportRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct TransportHandle {
    id: TransportId,
    role: TransportRole,
    owner: PeerId,
    inner: Arc<dyn WebRtcTransport>,
}

impl TransportHandle {
    pub fn new(owner: PeerId, role: TransportRole, inner: Arc<dyn WebRtcTransport>) -> Self {
        Self {
            id: inner.id(),
            role,
            owner,
            inner,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TransportId {
        &self.id
    }

    #[must_use]
    pub const fn role(&self) -> TransportRole {
        self.role
    }

    #[must_use]
    pub const fn owner(&self) -> &PeerId {
        &self.owner
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn WebRtcTransport> {
        &self.inner
    }

    pub fn close(&self) {
        self.inner.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

pub struct ProducerHandle {
    id: ProducerId,
    kind: MediaKind,
    owner: PeerId,
    transport_id: TransportId,
    inner: Arc<dyn Producer>,
}

impl ProducerHandle {
    pub fn new(owner: PeerId, transport_id: TransportId, inner: Arc<dyn Producer>) -> Self {
        Self {
            id: inner.id(),
            kind: inner.kind(),
            owner,
            transport_id,
            inner,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ProducerId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub const fn owner(&self) -> &PeerId {
        &self.owner
    }

    #[must_use]
    pub const fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    pub fn close(&self) {
        self.inner.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

pub struct ConsumerHandle {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    owner: PeerId,
    transport_id: TransportId,
    inner: Arc<dyn Consumer>,
}

impl ConsumerHandle {
    pub fn new(owner: PeerId, transport_id: TransportId, inner: Arc<dyn Consumer>) -> Self {
        Self {
            id: inner.id(),
            producer_id: inner.producer_id(),
            kind: inner.kind(),
            owner,
            transport_id,
            inner,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ConsumerId {
        &self.id
    }

    #[must_use]
    pub const fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub const fn owner(&self) -> &PeerId {
        &self.owner
    }

    #[must_use]
    pub const fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    #[must_use]
    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        &self.inner
    }

    pub async fn resume(&self) -> Result<()> {
        self.inner.resume().await
    }

    pub fn close(&self) {
        self.inner.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("id", &self.id)
            .field("producer_id", &self.producer_id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

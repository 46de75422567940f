//! Stagecast session and topology layer
//!
//! Tracks which peer owns which media objects inside a single SFU router and
//! tells peers about each other's producers. Media itself never passes
//! through here: the engine behind [`MediaEngine`] does ICE, DTLS and RTP.
//!
//! ## Architecture
//!
//! - **`MediaEngine`**: boundary to the engine (transports, producers, consumers)
//! - **`LocalEngine`**: in-process engine that negotiates but moves no media
//! - **`SessionRegistry`**: peers and the handles they own, with cascading teardown
//! - **`TopologyBroadcaster`**: per-peer event queues and announce policy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stagecast_sfu::{LocalEngine, SessionRegistry, TopologyBroadcaster, PeerId};
//!
//! let engine = LocalEngine::new(&config.media);
//! let registry = SessionRegistry::new();
//! let broadcaster = TopologyBroadcaster::new(config.signaling.announce_policy);
//!
//! let peer = PeerId::generate();
//! registry.register(peer.clone());
//! let events = broadcaster.attach(peer.clone());
//! ```

pub mod engine;
pub mod rtp;

mod broadcaster;
mod handle;
mod local_engine;
mod peer;
mod registry;
mod types;

pub use broadcaster::{
    is_announceable, PeerEvent, PeerProducers, ProducerDescriptor, TopologyBroadcaster,
};
pub use engine::{
    ConsumeOptions, Consumer, EngineEvent, MediaEngine, PlainTransport, Producer, WebRtcTransport,
};
pub use handle::{ConsumerHandle, ProducerHandle, TransportHandle, TransportRole};
pub use local_engine::{EngineStats, LocalEngine};
pub use peer::PeerSession;
pub use registry::{ProducerAdded, SessionRegistry, Teardown};
pub use stagecast_core::MediaKind;
pub use types::{ConsumerId, PeerId, ProducerId, TransportId};

//! Transport-agnostic implementation layer
//!
//! The HTTP layer only moves frames; all signaling logic lives here.

pub mod coordinator;
pub mod signaling;

pub use coordinator::Coordinator;
pub use signaling::SignalingSession;

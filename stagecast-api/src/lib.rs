//! Signaling API for stagecast
//!
//! JSON-over-websocket signaling at `/ws`, plus health and status routes.

pub mod http;
pub mod impls;
pub mod protocol;

pub use http::{create_router, AppState};
pub use impls::{Coordinator, SignalingSession};

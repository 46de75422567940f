//! HLS transcode bridge
//!
//! Taps one video producer through a plain RTP transport, describes the
//! stream in an SDP file and runs an external transcoder that turns it into
//! a rolling HLS playlist.

pub mod artifacts;
pub mod bridge;
pub mod error;
pub mod process;
pub mod sdp;

pub use bridge::{hls_args, BridgeState, BridgeStatus, TranscodeBridge};
pub use error::{BridgeError, Result};

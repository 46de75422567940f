//! Shared configuration, logging and error types for the stagecast workspace

pub mod config;
pub mod error;
pub mod logging;
pub mod models;

pub use config::Config;
pub use error::{Error, ErrorCode, Result};
pub use models::MediaKind;

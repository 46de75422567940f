use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::MediaKind;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
    pub transcode: TranscodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Media engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// IP the engine listens on for WebRTC transports
    pub listen_ip: String,
    /// IP advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    /// Lowest RTC port handed out to transports
    pub rtc_min_port: u16,
    /// Highest RTC port handed out to transports
    pub rtc_max_port: u16,
    /// Router codecs, fixed for the lifetime of the process
    pub codecs: Vec<CodecConfig>,
    /// Delay before the process exits once the engine worker has died
    pub fatal_exit_delay_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let mut vp8_parameters = serde_json::Map::new();
        vp8_parameters.insert(
            "x-google-start-bitrate".to_string(),
            serde_json::Value::from(1000),
        );

        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: Some("127.0.0.1".to_string()),
            rtc_min_port: 2000,
            rtc_max_port: 2020,
            codecs: vec![
                CodecConfig {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: serde_json::Map::new(),
                },
                CodecConfig {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                    parameters: vp8_parameters,
                },
            ],
            fatal_exit_delay_ms: 2000,
        }
    }
}

/// One router codec entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecConfig {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// When a peer's producers are announced to the other peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncePolicy {
    /// Hold the announcement until the peer has both an audio and a video producer.
    /// Peers that only ever produce one kind are never announced.
    #[default]
    AudioAndVideo,
    /// Announce after every successful produce
    EveryProducer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub announce_policy: AnnouncePolicy,
    /// Maximum inbound websocket frame size in bytes
    pub max_message_size: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            announce_policy: AnnouncePolicy::default(),
            max_message_size: 64 * 1024,
        }
    }
}

/// Which video producer the transcode bridge taps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// First video producer in peer join order
    #[default]
    FirstRegistered,
    /// Most recently produced video producer
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub enabled: bool,
    /// Transcoder executable
    pub program: String,
    /// Argument list replacing the built-in HLS arguments when non-empty.
    /// `{sdp}`, `{manifest}` and `{output_dir}` are substituted.
    pub args: Vec<String>,
    /// Directory receiving the SDP file, manifest and segments
    pub output_dir: String,
    pub sdp_file: String,
    pub manifest_file: String,
    /// Local IP of the plain transport
    pub listen_ip: String,
    /// Address the transcoder reads RTP on
    pub rtp_address: String,
    pub rtp_port: u16,
    /// Target segment duration in seconds
    pub hls_time: u32,
    /// Number of segments kept in the manifest
    pub hls_list_size: u32,
    pub stop_grace_period_ms: u64,
    pub selection: SelectionPolicy,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "ffmpeg".to_string(),
            args: Vec::new(),
            output_dir: "./public/hls".to_string(),
            sdp_file: "video.sdp".to_string(),
            manifest_file: "stream.m3u8".to_string(),
            listen_ip: "127.0.0.1".to_string(),
            rtp_address: "127.0.0.1".to_string(),
            rtp_port: 5004,
            hls_time: 2,
            hls_list_size: 10,
            stop_grace_period_ms: 3000,
            selection: SelectionPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // STAGECAST_SERVER__HTTP_PORT, STAGECAST_TRANSCODE__RTP_PORT, ...
        builder = builder.add_source(
            Environment::with_prefix("STAGECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration for values the server cannot start with.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media.rtc_min_port > self.media.rtc_max_port {
            errors.push(format!(
                "media.rtc_min_port ({}) is greater than media.rtc_max_port ({})",
                self.media.rtc_min_port, self.media.rtc_max_port
            ));
        }

        if self.media.codecs.is_empty() {
            errors.push("media.codecs must list at least one codec".to_string());
        }

        for codec in &self.media.codecs {
            let prefix = format!("{}/", codec.kind.as_str());
            if !codec.mime_type.to_lowercase().starts_with(&prefix) {
                errors.push(format!(
                    "codec {} does not match its kind {}",
                    codec.mime_type, codec.kind
                ));
            }
            if codec.clock_rate == 0 {
                errors.push(format!("codec {} has a zero clock rate", codec.mime_type));
            }
        }

        if self.transcode.enabled {
            if self.transcode.program.trim().is_empty() {
                errors.push("transcode.program must not be empty".to_string());
            }
            if self.transcode.rtp_port == 0 {
                errors.push("transcode.rtp_port must not be 0".to_string());
            }
            if self.transcode.hls_time == 0 {
                errors.push("transcode.hls_time must be at least 1".to_string());
            }
        }

        if self.signaling.max_message_size == 0 {
            errors.push("signaling.max_message_size must not be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_address(), "0.0.0.0:3001");
        assert_eq!(config.media.codecs.len(), 2);
        assert_eq!(config.transcode.rtp_port, 5004);
        assert_eq!(config.signaling.announce_policy, AnnouncePolicy::AudioAndVideo);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.media.rtc_min_port = 3000;
        config.media.rtc_max_port = 2000;
        config.media.codecs[0].mime_type = "video/opus".to_string();
        config.transcode.rtp_port = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_disabled_transcode_skips_checks() {
        let mut config = Config::default();
        config.transcode.enabled = false;
        config.transcode.program = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  http_port: 4000\nsignaling:\n  announce_policy: every_producer\ntranscode:\n  selection: latest\n  rtp_port: 6000"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.http_port, 4000);
        assert_eq!(config.signaling.announce_policy, AnnouncePolicy::EveryProducer);
        assert_eq!(config.transcode.selection, SelectionPolicy::Latest);
        assert_eq!(config.transcode.rtp_port, 6000);
        // untouched sections keep their defaults
        assert_eq!(config.transcode.manifest_file, "stream.m3u8");
    }
}

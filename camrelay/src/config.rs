//! Relay configuration
//!
//! Loaded from TOML. Every section falls back to its defaults, so a config
//! file only needs the keys it changes.

use crate::runtime::SessionBuilder;
use crate::session::SessionSettings;
use camrelay_core::{
    derive_endpoint, ConnectionConfig, RelayError, DEFAULT_SEND_QUEUE, DEFAULT_WS_PATH,
};
use camrelay_media::{EncodingFormat, FfmpegConfig, DEFAULT_CHUNK_INTERVAL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Where chunks are streamed to
    pub endpoint: EndpointConfig,
    /// Capture device
    pub capture: CaptureConfig,
    /// Chunk encoder
    pub encoder: EncoderConfig,
    /// Returned frames
    pub display: DisplayConfig,
    /// Logging
    pub logging: LoggingConfig,
}

/// Endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Page the endpoint is relative to; its scheme picks ws or wss
    pub page_url: String,
    /// Endpoint path relative to the page
    pub ws_path: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Chunks buffered for the socket before new ones are dropped
    pub send_queue: usize,
    /// Open the connection at startup instead of on the first start
    pub connect_on_startup: bool,
}

/// Which capture implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Camera through an ffmpeg subprocess
    Ffmpeg,
    /// Generated chunks, no hardware
    Synthetic,
}

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture implementation
    pub backend: CaptureBackend,
    /// ffmpeg executable
    pub ffmpeg_binary: String,
    /// ffmpeg input format: "v4l2", "avfoundation", "dshow"
    pub input_format: String,
    /// Capture device
    pub device: String,
    /// Frames per second
    pub framerate: u32,
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// Encoding formats in preference order
    pub preferred_formats: Vec<String>,
    /// Chunk size of the synthetic backend
    pub synthetic_chunk_size: usize,
}

/// Encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Interval between chunks in milliseconds
    pub chunk_interval_ms: u64,
    /// Target bitrate in kbit/s
    pub bitrate_kbps: u32,
}

/// Display settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// File the latest returned frame is written to; empty disables
    pub output_path: String,
    /// Upper bound on frames presented per second
    pub max_fps: u32,
}

/// Logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            page_url: "http://localhost:8888/".into(),
            ws_path: DEFAULT_WS_PATH.into(),
            connect_timeout_ms: 10_000,
            send_queue: DEFAULT_SEND_QUEUE,
            connect_on_startup: true,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let ffmpeg = FfmpegConfig::default();
        Self {
            backend: CaptureBackend::Ffmpeg,
            ffmpeg_binary: ffmpeg.binary,
            input_format: ffmpeg.input_format,
            device: ffmpeg.device,
            framerate: ffmpeg.framerate,
            width: ffmpeg.width,
            height: ffmpeg.height,
            preferred_formats: EncodingFormat::default_preferences()
                .iter()
                .map(EncodingFormat::mime_type)
                .collect(),
            synthetic_chunk_size: 4096,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: DEFAULT_CHUNK_INTERVAL.as_millis() as u64,
            bitrate_kbps: FfmpegConfig::default().bitrate_kbps,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            output_path: String::new(),
            max_fps: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl RelayConfig {
    /// Load from a TOML file, falling back to defaults
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, RelayError> {
        toml::from_str(text).map_err(|e| RelayError::Configuration {
            message: e.to_string(),
        })
    }

    /// Render as TOML text
    pub fn to_toml_string(&self) -> Result<String, RelayError> {
        toml::to_string_pretty(self).map_err(|e| RelayError::Configuration {
            message: e.to_string(),
        })
    }

    /// Write default config to a file
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default()
            .to_toml_string()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        std::fs::write(path, text)
    }

    /// Check every section
    pub fn validate(&self) -> Result<(), RelayError> {
        self.endpoint_url()?;
        if self.endpoint.connect_timeout_ms == 0 {
            return Err(invalid("endpoint.connect_timeout_ms must be greater than zero"));
        }
        if self.endpoint.send_queue == 0 {
            return Err(invalid("endpoint.send_queue must be greater than zero"));
        }
        if self.encoder.chunk_interval_ms == 0 {
            return Err(invalid("encoder.chunk_interval_ms must be greater than zero"));
        }
        if self.encoder.bitrate_kbps == 0 {
            return Err(invalid("encoder.bitrate_kbps must be greater than zero"));
        }
        if self.display.max_fps == 0 {
            return Err(invalid("display.max_fps must be greater than zero"));
        }
        if self.capture.synthetic_chunk_size == 0 {
            return Err(invalid("capture.synthetic_chunk_size must be greater than zero"));
        }
        if self.preferences()?.is_empty() {
            return Err(invalid("capture.preferred_formats must not be empty"));
        }
        if self.capture.backend == CaptureBackend::Ffmpeg {
            self.ffmpeg_config().validate()?;
        }
        Ok(())
    }

    /// Endpoint URL derived from the page URL
    pub fn endpoint_url(&self) -> Result<String, RelayError> {
        derive_endpoint(&self.endpoint.page_url, &self.endpoint.ws_path)
    }

    /// Encoding formats in preference order
    pub fn preferences(&self) -> Result<Vec<EncodingFormat>, RelayError> {
        self.capture
            .preferred_formats
            .iter()
            .map(|mime| EncodingFormat::parse(mime).map_err(RelayError::from))
            .collect()
    }

    /// ffmpeg settings from the capture and encoder sections
    pub fn ffmpeg_config(&self) -> FfmpegConfig {
        FfmpegConfig {
            binary: self.capture.ffmpeg_binary.clone(),
            input_format: self.capture.input_format.clone(),
            device: self.capture.device.clone(),
            framerate: self.capture.framerate,
            width: self.capture.width,
            height: self.capture.height,
            bitrate_kbps: self.encoder.bitrate_kbps,
            ..FfmpegConfig::default()
        }
    }

    /// Transport settings
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            send_queue: self.endpoint.send_queue,
            ..ConnectionConfig::with_timeout(Duration::from_millis(self.endpoint.connect_timeout_ms))
        }
    }

    /// Session settings
    pub fn session_settings(&self) -> Result<SessionSettings, RelayError> {
        Ok(SessionSettings {
            endpoint: self.endpoint_url()?,
            chunk_interval: Duration::from_millis(self.encoder.chunk_interval_ms),
            connect_on_startup: self.endpoint.connect_on_startup,
        })
    }

    /// Frame output file, if enabled
    pub fn output_path(&self) -> Option<PathBuf> {
        let path = self.display.output_path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }

    /// Session builder with the configured capture backend and transport
    pub fn session_builder(&self) -> Result<SessionBuilder, RelayError> {
        self.validate()?;
        let builder = SessionBuilder::new(self.session_settings()?)
            .preferences(self.preferences()?)
            .connection_config(self.connection_config());
        Ok(match self.capture.backend {
            CaptureBackend::Ffmpeg => builder.ffmpeg(self.ffmpeg_config()),
            CaptureBackend::Synthetic => builder.synthetic(self.capture.synthetic_chunk_size),
        })
    }
}

fn invalid(message: &str) -> RelayError {
    RelayError::Configuration {
        message: message.to_string(),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = RelayConfig::default().to_toml_string().unwrap();
        assert!(text.contains("[endpoint]"));
        assert!(text.contains("chunk_interval_ms = 100"));
        assert!(text.contains("video/webm;codecs=vp9"));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            [endpoint]
            page_url = "https://cam.example.com/app/"

            [capture]
            backend = "synthetic"
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.backend, CaptureBackend::Synthetic);
        assert_eq!(config.encoder.chunk_interval_ms, 100);
        assert_eq!(
            config.endpoint_url().unwrap(),
            "wss://cam.example.com/app/ws/video"
        );
        config.validate().unwrap();
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = RelayConfig::default();
        config.encoder.chunk_interval_ms = 0;
        assert_eq!(config.validate().unwrap_err().error_code(), "INVALID_CONFIGURATION");

        let mut config = RelayConfig::default();
        config.endpoint.page_url = "ftp://cam.example.com/".into();
        assert_eq!(config.validate().unwrap_err().error_code(), "INVALID_ENDPOINT");

        let mut config = RelayConfig::default();
        config.capture.preferred_formats = vec!["video/mp4".into()];
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.endpoint.send_queue = 0;
        assert_eq!(config.validate().unwrap_err().error_code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn settings_follow_config() {
        let mut config = RelayConfig::default();
        config.encoder.chunk_interval_ms = 250;
        config.endpoint.connect_on_startup = false;
        config.display.output_path = "  ".into();
        config.endpoint.send_queue = 3;

        let settings = config.session_settings().unwrap();
        assert_eq!(settings.endpoint, "ws://localhost:8888/ws/video");
        assert_eq!(settings.chunk_interval, Duration::from_millis(250));
        assert!(!settings.connect_on_startup);
        assert_eq!(config.output_path(), None);
        assert_eq!(config.ffmpeg_config().device, "/dev/video0");
        assert_eq!(config.connection_config().send_queue, 3);
    }
}

//! Runtime configuration.
//!
//! Every field has a default, so running without a config file works. A TOML
//! file can override any subset; command-line flags override the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::screen::viewer::GraphicsProtocol;
use crate::transport::StreamEndpoint;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskcastConfig {
    pub network: NetworkConfig,
    pub screen: ScreenConfig,
    pub audio: AudioConfig,
    pub viewer: ViewerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Publisher host a viewer connects to. Ignored when hosting.
    pub host: String,
    /// Video port; audio uses `port + 1`.
    pub port: u16,
    /// Messages queued per subscriber before the publisher starts dropping.
    pub publisher_hwm: usize,
    /// Messages buffered on the receiving side before the socket stops being read.
    pub subscriber_queue: usize,
    /// Delay between dial attempts while the publisher is unreachable.
    pub reconnect_interval_ms: u64,
    /// Pause between tearing down a session and starting its replacement.
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Convert frames to luminance before encoding.
    pub grayscale: bool,
    /// JPEG quality (1-100).
    pub jpeg_quality: u8,
    /// Downscale captures wider than this, preserving aspect ratio.
    pub max_width: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// Upper bound on one blocking chunk read, so stop requests are noticed.
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// "auto", "sixel", "kitty", "iterm2" or "halfblocks".
    pub graphics: GraphicsProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "trace", "debug", "info", "warn" or "error". `RUST_LOG` takes precedence.
    pub level: String,
    /// Log file used by the terminal viewer. Publishers log to stderr.
    pub file: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5555,
            publisher_hwm: 8,
            subscriber_queue: 16,
            reconnect_interval_ms: 100,
            reconnect_delay_ms: 1000,
        }
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            grayscale: false,
            jpeg_quality: 95,
            max_width: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_timeout_ms: 200,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: "deskcast.log".into(),
        }
    }
}

impl DeskcastConfig {
    /// Load from `path` if given. A missing file yields defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn endpoint(&self) -> Result<StreamEndpoint> {
        Ok(StreamEndpoint::new(&self.network.host, self.network.port)?)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.network.reconnect_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.network.reconnect_delay_ms)
    }

    pub fn audio_read_timeout(&self) -> Duration {
        Duration::from_millis(self.audio.read_timeout_ms.max(10))
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.screen.jpeg_quality.clamp(1, 100)
    }
}

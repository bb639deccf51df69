//! Bridge configuration
//!
//! Loaded from TOML; every field has a default matching the shipped
//! backend, so an empty file (or no file) is a valid configuration.
//! Duration knobs are integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const SOCKET_SUBDIR: &str = "culvert";
const SOCKET_NAME: &str = "backend.sock";

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Unix socket the backend listens on
    pub socket_path: PathBuf,
    /// Delay before a scheduled reconnection attempt
    pub reconnect_delay_ms: u64,
    /// How long a sent message may wait for its delivery ack
    pub delivery_deadline_ms: u64,
    /// Upward event channel capacity
    pub event_buffer: usize,
    /// Admission window for text messages
    pub message_limit: RateLimit,
    /// Admission window for file transfers
    pub file_limit: RateLimit,
    /// Mesh tunnel process settings
    pub tunnel: TunnelConfig,
    /// Backend process to spawn, when the bridge owns its lifecycle
    pub backend: Option<BackendConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            reconnect_delay_ms: 5000,
            delivery_deadline_ms: 10_000,
            event_buffer: 64,
            message_limit: RateLimit {
                max_actions: 30,
                window_ms: 60_000,
            },
            file_limit: RateLimit {
                max_actions: 10,
                window_ms: 60_000,
            },
            tunnel: TunnelConfig::default(),
            backend: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Parse directly from TOML content (for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Default config location: `<config dir>/bridge.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "culvert", "culvert")
            .map(|dirs| dirs.config_dir().join("bridge.toml"))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn delivery_deadline(&self) -> Duration {
        Duration::from_millis(self.delivery_deadline_ms)
    }
}

/// Sliding-window admission settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    /// Maximum admitted actions inside the window
    pub max_actions: u32,
    /// Window size in milliseconds
    pub window_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_actions: 30,
            window_ms: 60_000,
        }
    }
}

impl RateLimit {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Mesh tunnel process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Mesh daemon binary
    pub binary: PathBuf,
    /// Tun device node opened and handed to the daemon
    pub tun_device: PathBuf,
    /// Virtual interface to watch for link-up
    pub interface: String,
    /// Local SOCKS proxy port the daemon exposes
    pub proxy_port: u16,
    /// Subnet routed into the tunnel
    pub subnet: String,
    /// Give up waiting for link-up after this long
    pub establish_timeout_ms: u64,
    /// Poll interval while waiting for link-up
    pub poll_interval_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("mesh-tunnel"),
            tun_device: PathBuf::from("/dev/net/tun"),
            interface: "tun0".to_string(),
            proxy_port: 9001,
            subnet: "200::/7".to_string(),
            establish_timeout_ms: 15_000,
            poll_interval_ms: 200,
        }
    }
}

impl TunnelConfig {
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_millis(self.establish_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Backend process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable to spawn
    pub command: PathBuf,
    /// Arguments passed to it
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory (inherits ours when unset)
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Default socket path: `$XDG_RUNTIME_DIR/culvert/backend.sock`, falling
/// back to `/tmp/culvert/backend.sock` when the runtime dir is unset.
pub fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| PathBuf::from("/tmp").join(SOCKET_SUBDIR).join(SOCKET_NAME),
        |runtime_dir| {
            PathBuf::from(runtime_dir)
                .join(SOCKET_SUBDIR)
                .join(SOCKET_NAME)
        },
    )
}

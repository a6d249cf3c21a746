use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{TransportError, TransportResult};

/// TCP keep-alive settings applied when a session's socket is built.
///
/// Probe timings are platform-dependent; `enabled` is honored everywhere,
/// the idle/interval values where the platform lets the runtime set them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub idle_secs: u32,
    pub interval_secs: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            enabled: true,
            idle_secs: 30,
            interval_secs: 5,
        }
    }
}

/// Transport options for a server or client.
///
/// Constructed explicitly and handed to the peer; there is no process-wide
/// configuration. Defaults favor short framed messages: Nagle off,
/// keep-alive on, small socket buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Disable Nagle's algorithm on every session socket.
    pub no_delay: bool,
    pub keep_alive: KeepAliveConfig,
    pub send_buffer_size: u32,
    pub receive_buffer_size: u32,
    /// Server-side admission limit; connects beyond it are rejected through
    /// the handshake byte.
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
    /// Listen backlog for the server socket.
    pub backlog: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            no_delay: true,
            keep_alive: KeepAliveConfig::default(),
            send_buffer_size: 512,
            receive_buffer_size: 512,
            max_connections: 1024,
            connect_timeout_ms: 5000,
            backlog: 1024,
        }
    }
}

impl TransportConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> TransportResult<TransportConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| {
                TransportError::InvalidAddress(format!(
                    "config file path: {}",
                    path.as_ref().to_string_lossy()
                ))
            })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

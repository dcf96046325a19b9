use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Storage path value that selects the purely in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Version string announced in the handshake and by `@@version`.
pub const DEFAULT_SERVER_VERSION: &str = "8.0.32-zerodb";

/// Persisted server configuration.
///
/// Every field has a default, so a partial JSON document (or no file at all)
/// yields a usable configuration:
///
/// ```json
/// {
///   "host": "127.0.0.1",
///   "port": 3306,
///   "max_connections": 10,
///   "idle_timeout_seconds": 300,
///   "storage_path": ":memory:",
///   "release_delay_seconds": 30
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// TCP port; 0 lets the OS choose
    pub port: u16,
    /// Concurrency ceiling; sockets beyond it are closed right after accept
    pub max_connections: usize,
    /// Seconds without a statement before the engine counts as idle
    pub idle_timeout_seconds: u64,
    /// Data directory, or `:memory:`
    pub storage_path: String,
    /// Minimum seconds between a reactivation and the next idle release
    pub release_delay_seconds: u64,
    /// Buffer pool capacity in pages
    pub buffer_pool_pages: usize,
    /// Version string announced in the handshake
    pub server_version: String,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            max_connections: 10,
            idle_timeout_seconds: 300,
            storage_path: IN_MEMORY.to_string(),
            release_delay_seconds: 30,
            buffer_pool_pages: 100,
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Loads a JSON configuration file. A missing file gives the defaults;
    /// keys absent from the file keep their default values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let cfg: ServerConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Immutable snapshot consumed by the server and the governor.
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_connections: self.max_connections.max(1),
            idle_threshold: Duration::from_secs(self.idle_timeout_seconds),
            release_delay: Duration::from_secs(self.release_delay_seconds),
            tick: Duration::from_secs(1),
        }
    }
}

/// Resource limits fixed at server start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_connections: usize,
    pub idle_threshold: Duration,
    pub release_delay: Duration,
    /// Governor polling interval
    pub tick: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.listen_addr(), "127.0.0.1:3306");
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"port": 3407, "max_connections": 2}"#).unwrap();
        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.port, 3407);
        assert_eq!(cfg.max_connections, 2);
        assert_eq!(cfg.storage_path, IN_MEMORY);
        assert_eq!(cfg.idle_timeout_seconds, 300);
    }

    #[test]
    fn limits_never_allow_zero_connections() {
        let cfg = ServerConfig { max_connections: 0, ..Default::default() };
        let limits = cfg.limits();
        assert_eq!(limits.max_connections, 1);
        assert_eq!(limits.idle_threshold, Duration::from_secs(300));
        assert_eq!(limits.release_delay, Duration::from_secs(30));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }
}

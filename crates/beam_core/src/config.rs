//! Configuration for the registry and for node agents.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default port of the GPMD name registry.
pub const DEFAULT_GPMD_PORT: u16 = 2613;

/// Ports an agent tries, in order, until one binds.
pub const DEFAULT_AGENT_PORTS: [u16; 20] = [
    26130, 26131, 26132, 26133, 26134, 26135, 26136, 26137, 26138, 26139, 9190, 9191, 9192,
    9193, 9194, 9195, 9196, 9197, 9198, 9199,
];

/// Default depth of a routine's message queue.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10;

/// Largest agent frame accepted from a peer (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Configuration for the GPMD name registry service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpmdConfig {
    /// Interface to bind. Empty means all interfaces.
    pub host: String,

    /// Port to bind.
    pub port: u16,

    /// Idle limit for a client connection between two requests.
    #[serde(with = "duration_serde")]
    pub io_timeout: Duration,
}

impl Default for GpmdConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_GPMD_PORT,
            io_timeout: Duration::from_secs(10),
        }
    }
}

impl GpmdConfig {
    /// `host:port` to bind, with an empty host meaning every interface.
    pub fn bind_address(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        format!("{host}:{}", self.port)
    }
}

/// Configuration for a node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host of the local registry this node registers with.
    pub gpmd_host: String,

    /// Registry port. Also used to reach a remote node's own registry.
    pub gpmd_port: u16,

    /// Listening ports tried in order. `0` asks the OS for any free port.
    pub candidate_ports: Vec<u16>,

    /// Depth of each routine's bounded queue.
    pub mailbox_capacity: usize,

    /// Timeout for dialing a peer or the registry.
    #[serde(with = "duration_serde")]
    pub dial_timeout: Duration,

    /// Timeout for one request/response exchange.
    #[serde(with = "duration_serde")]
    pub io_timeout: Duration,

    /// Largest frame accepted from a peer.
    pub max_frame_len: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gpmd_host: "127.0.0.1".to_string(),
            gpmd_port: DEFAULT_GPMD_PORT,
            candidate_ports: DEFAULT_AGENT_PORTS.to_vec(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            dial_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl AgentConfig {
    /// `host:port` of the local registry.
    pub fn gpmd_address(&self) -> String {
        format!("{}:{}", self.gpmd_host, self.gpmd_port)
    }
}

/// The on-disk configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    pub gpmd: GpmdConfig,
    pub agent: AgentConfig,
}

impl BeamConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<BeamConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BeamConfig::default();
        assert_eq!(config.gpmd.port, 2613);
        assert_eq!(config.agent.gpmd_port, 2613);
        assert_eq!(config.agent.candidate_ports.len(), 20);
        assert_eq!(config.agent.candidate_ports[0], 26130);
        assert_eq!(config.agent.candidate_ports[19], 9199);
        assert_eq!(config.agent.mailbox_capacity, 10);
        assert_eq!(config.agent.gpmd_address(), "127.0.0.1:2613");
    }

    #[test]
    fn test_bind_address_empty_host() {
        let config = GpmdConfig {
            host: String::new(),
            ..GpmdConfig::default()
        };
        assert_eq!(config.bind_address(), "0.0.0.0:2613");
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{ "agent": { "gpmd_port": 1989 } }"#;
        let config: BeamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.agent.gpmd_port, 1989);
        assert_eq!(config.agent.gpmd_host, "127.0.0.1");
        assert_eq!(config.gpmd.port, 2613);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("beam.json");

        let mut saved = BeamConfig::default();
        saved.agent.candidate_ports = vec![0];
        saved.agent.io_timeout = Duration::from_secs(3);
        saved.save_to_file(&path).unwrap();

        let loaded = BeamConfig::load_or_default(&path);
        assert_eq!(loaded.agent.candidate_ports, vec![0]);
        assert_eq!(loaded.agent.io_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beam.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = BeamConfig::load_or_default(&path);
        assert_eq!(config.gpmd.port, 2613);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BeamConfig::load_or_default(&dir.path().join("absent.json"));
        assert_eq!(config.agent.mailbox_capacity, DEFAULT_MAILBOX_CAPACITY);
    }
}

//! Node configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for an overlay node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Interface the listener binds to.
    pub listen_host: IpAddr,

    /// Hop budget given to packets this node originates.
    pub max_ttl: u32,

    /// How long a processed packet id is remembered for duplicate suppression.
    #[serde(with = "duration_serde")]
    pub seen_ttl: Duration,

    /// How often expired packet ids are pruned.
    #[serde(with = "duration_serde")]
    pub prune_interval: Duration,

    /// Timeout for establishing an outbound connection.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Buffered events per subscriber before the slowest one starts lagging.
    pub event_capacity: usize,

    /// Largest single frame accepted from a peer.
    pub max_frame_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_ttl: 255,
            seen_ttl: Duration::from_secs(600),
            prune_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 1024,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
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
                Ok(data) => match serde_json::from_str::<NodeConfig>(&data) {
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
        let config = NodeConfig::default();
        assert!(config.listen_host.is_unspecified());
        assert_eq!(config.max_ttl, 255);
        assert_eq!(config.seen_ttl, Duration::from_secs(600));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_json_shape() {
        let json = serde_json::to_value(NodeConfig::default()).unwrap();
        assert_eq!(json["listen_host"], "0.0.0.0");
        assert_eq!(json["seen_ttl"], 600);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: NodeConfig = serde_json::from_str(r#"{"max_ttl": 8}"#).unwrap();
        assert_eq!(config.max_ttl, 8);
        assert_eq!(config.event_capacity, NodeConfig::default().event_capacity);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("overlay.json");

        let mut original = NodeConfig::default();
        original.max_ttl = 16;
        original.listen_host = "127.0.0.1".parse().unwrap();
        original.save_to_file(&path).unwrap();

        let loaded = NodeConfig::load_or_default(&path);
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_config_load_missing_or_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(NodeConfig::load_or_default(&missing), NodeConfig::default());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert_eq!(NodeConfig::load_or_default(&corrupt), NodeConfig::default());
    }
}

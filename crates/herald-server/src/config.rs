//! Server configuration: TOML file model and CLI-friendly parsing.
//!
//! Resolution order is defaults → TOML file → env vars → CLI flags;
//! the last two are applied in `main` on top of whatever this module
//! loaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::DEFAULT_ROUTING_CONFIG;

/// How engines replicate state across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    /// One node, no replication.
    Single,
    /// UDP gossip membership between peers.
    Gossip,
    /// Shared key/value store with TTL'd liveness keys.
    KeyStore,
}

/// Parses a cluster mode name from a CLI or TOML string.
pub fn parse_cluster_mode(input: &str) -> Result<ClusterMode, String> {
    match input.to_ascii_lowercase().as_str() {
        "single" => Ok(ClusterMode::Single),
        "gossip" => Ok(ClusterMode::Gossip),
        "keystore" => Ok(ClusterMode::KeyStore),
        _ => Err(format!(
            "unknown cluster mode '{input}'. valid options: single, gossip, keystore"
        )),
    }
}

/// Cluster section of the TOML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSection {
    /// single, gossip, or keystore
    pub mode: String,
    /// bind address for the gossip UDP socket
    pub gossip_bind: String,
    /// peer addresses to join through at startup
    pub seeds: Vec<String>,
    /// peers (including self) that must be visible before startup
    /// proceeds without degrading
    pub quorum: usize,
    /// TTL on keystore liveness keys, in seconds
    pub liveness_ttl_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            mode: "single".to_string(),
            gossip_bind: "0.0.0.0:9094".to_string(),
            seeds: Vec::new(),
            quorum: 1,
            liveness_ttl_secs: 10,
        }
    }
}

/// Full server configuration as loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeraldConfig {
    /// address the metrics endpoint binds to
    pub bind: String,
    /// port for prometheus metrics HTTP endpoint (0 = disabled)
    pub metrics_port: u16,
    /// directory for persisted tenant configurations. empty = in-memory
    pub data_dir: String,
    /// tenant ids served by this node
    pub tenants: Vec<i64>,
    /// seconds between tenant reconcile passes
    pub reconcile_interval_secs: u64,
    /// seconds startup waits for cluster quorum before degrading
    pub settle_timeout_secs: u64,
    /// concurrent receiver-test deliveries
    pub max_test_workers: usize,
    /// overall deadline for one receiver-test batch, in seconds
    pub test_timeout_secs: u64,
    /// routing configuration applied to tenants with nothing stored,
    /// as raw JSON
    pub default_routing_config: String,
    pub cluster: ClusterSection,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            metrics_port: 0,
            data_dir: String::new(),
            tenants: Vec::new(),
            reconcile_interval_secs: 60,
            settle_timeout_secs: 30,
            max_test_workers: 10,
            test_timeout_secs: 15,
            default_routing_config: DEFAULT_ROUTING_CONFIG.to_string(),
            cluster: ClusterSection::default(),
        }
    }
}

impl HeraldConfig {
    /// Loads configuration from a TOML file. Unknown keys are an
    /// error so typos do not silently fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("failed to parse config file '{}': {e}", path.display()))
    }

    /// Serializes this config as TOML, for `--config-template`.
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    pub fn metrics_port(&self) -> Option<u16> {
        (self.metrics_port != 0).then_some(self.metrics_port)
    }

    pub fn data_dir_path(&self) -> Option<PathBuf> {
        (!self.data_dir.is_empty()).then(|| PathBuf::from(&self.data_dir))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs.max(1))
    }
}

//! Configuration management for GhostMesh.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
#[cfg(feature = "toml")]
use std::path::Path;

/// Largest hop budget a packet may carry on the wire.
pub const MAX_HOP_BUDGET: u8 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Relay and runtime tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    /// Display name advertised to neighbours
    pub node_name: String,
    /// Capacity of the packet id deduplication ring
    pub cache_capacity: usize,
    /// Hop budget stamped on locally originated packets
    pub default_hop_count: u8,
    /// Hop budget of the outer packet when tunnelling to a gateway
    pub tunnel_hop_count: u8,
    /// Seconds between KEEP_ALIVE broadcasts, 0 disables them
    pub keep_alive_interval_secs: u64,
    /// Seconds between TOPOLOGY_UPDATE route summaries, 0 disables them
    pub topology_interval_secs: u64,
    /// Seconds between background gateway record sweeps
    pub gateway_prune_interval_secs: u64,
    /// Bounded queue depth of each per-transport ingress worker
    pub ingress_queue_depth: usize,
    /// Drop packets that carry no verifiable signature
    pub require_signatures: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_name: "ghost".to_string(),
            cache_capacity: 2000,
            default_hop_count: 3,
            tunnel_hop_count: 3,
            keep_alive_interval_secs: 5,
            topology_interval_secs: 30,
            gateway_prune_interval_secs: 60,
            ingress_queue_depth: 256,
            require_signatures: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Salt mixed into the daily broadcast key. Every node that should read
    /// broadcast traffic must share it. The default is public, so anyone
    /// running this software can read broadcasts sealed under it.
    pub fallback_salt: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            fallback_salt: "ghostmesh-broadcast-v1".to_string(),
        }
    }
}

impl Config {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject values the relay engine cannot operate with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.mesh.cache_capacity == 0 {
            return Err(CoreError::Config(
                "mesh.cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.mesh.default_hop_count > MAX_HOP_BUDGET
            || self.mesh.tunnel_hop_count > MAX_HOP_BUDGET
        {
            return Err(CoreError::Config(format!(
                "hop budgets must not exceed {}",
                MAX_HOP_BUDGET
            )));
        }
        if self.mesh.ingress_queue_depth == 0 {
            return Err(CoreError::Config(
                "mesh.ingress_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.security.fallback_salt.is_empty() {
            return Err(CoreError::Config(
                "security.fallback_salt must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

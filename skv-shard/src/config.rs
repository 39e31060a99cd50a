//! # Shard Configuration
//!
//! JSON description of the shard table and the pool settings used for every
//! RESP backend in it.
//!
//! ```json
//! {
//!   "groups": [["10.0.0.1:6379", "10.0.0.2:6379"], ["10.0.0.3:6379"]],
//!   "pool": { "max_idle": 4, "max_total": 8, "read_timeout_ms": 500 },
//!   "parallel_writes": true
//! }
//! ```
//!
//! Group order is part of the data layout: reordering or resizing `groups`
//! moves keys between backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use skv_client::{ConnectionPool, PoolConfig};
use skv_common::{ShardError, ShardResult};
use thiserror::Error;
use tracing::info;

use crate::client::{ClientOptions, ShardedClient};
use crate::strategy::ShardMap;

/// Failure while loading or checking a `ShardConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid shard config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid shard config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ShardError {
    fn from(err: ConfigError) -> Self {
        ShardError::Config(err.to_string())
    }
}

fn default_max_idle() -> usize {
    8
}

fn default_max_total() -> usize {
    16
}

/// Connection pool limits applied to each backend address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_idle: default_max_idle(),
            max_total: default_max_total(),
            read_timeout_ms: None,
            write_timeout_ms: None,
            connect_timeout_ms: None,
        }
    }
}

/// Shard table plus client options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Ordered groups of mirror addresses.
    pub groups: Vec<Vec<String>>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub parallel_writes: bool,
}

impl ShardConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ShardConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Checks the shape of the table and the pool limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::Invalid("at least one group is required".into()));
        }
        for (index, group) in self.groups.iter().enumerate() {
            if group.is_empty() {
                return Err(ConfigError::Invalid(format!("group {index} has no backends")));
            }
            if let Some(addr) = group.iter().find(|addr| addr.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "group {index} has a blank address {addr:?}"
                )));
            }
        }
        if self.pool.max_total == 0 {
            return Err(ConfigError::Invalid("pool.max_total must be > 0".into()));
        }
        if self.pool.max_idle > self.pool.max_total {
            return Err(ConfigError::Invalid(
                "pool.max_idle must not exceed pool.max_total".into(),
            ));
        }
        let timeouts = [
            ("read_timeout_ms", self.pool.read_timeout_ms),
            ("write_timeout_ms", self.pool.write_timeout_ms),
            ("connect_timeout_ms", self.pool.connect_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == Some(0)) {
            return Err(ConfigError::Invalid(format!(
                "pool.{name} must be > 0; omit it to disable the timeout"
            )));
        }
        Ok(())
    }

    /// Pool configuration for one backend address.
    pub fn pool_config(&self, addr: &str) -> PoolConfig {
        PoolConfig {
            addr: addr.to_string(),
            max_idle: self.pool.max_idle,
            max_total: self.pool.max_total,
            read_timeout: self.pool.read_timeout_ms.map(Duration::from_millis),
            write_timeout: self.pool.write_timeout_ms.map(Duration::from_millis),
            connect_timeout: self.pool.connect_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Client options carried by this config.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            parallel_writes: self.parallel_writes,
        }
    }
}

/// Builds a RESP-backed sharded client from a config.
///
/// Each distinct address gets one pool; an address listed in several groups
/// is the same backend in all of them. No connection is opened here.
pub fn connect_sharded(config: &ShardConfig) -> ShardResult<ShardedClient<ConnectionPool>> {
    config.validate()?;
    let mut pools: HashMap<&str, Arc<ConnectionPool>> = HashMap::new();
    let groups: Vec<Vec<Arc<ConnectionPool>>> = config
        .groups
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|addr| {
                    Arc::clone(
                        pools
                            .entry(addr.as_str())
                            .or_insert_with(|| Arc::new(ConnectionPool::new(config.pool_config(addr)))),
                    )
                })
                .collect()
        })
        .collect();

    let map = ShardMap::new(groups)?;
    info!(
        groups = map.group_count(),
        backends = map.backend_count(),
        parallel_writes = config.parallel_writes,
        "sharded client configured"
    );
    Ok(ShardedClient::with_options(map, config.client_options()))
}

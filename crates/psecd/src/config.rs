//! Daemon configuration.
//!
//! Loaded from a YAML file; every field has a default so a partial (or
//! missing) file is fine. Default location: /etc/sonic/psecd.yaml

use crate::limit::ViolationMode;
use crate::types::{
    NodeRole, AGING_PERIOD_MAX, AGING_PERIOD_MIN, HOLD_TIME_MAX, HOLD_TIME_MIN, LIMIT_MAX,
    LIMIT_MIN, MAC_TABLE_FULL_GUARD_SECS, POOL_CAPACITY_DEFAULT, VIOLATE_LIMIT_MAX,
    VIOLATE_LIMIT_MIN, ZOMBIE_HOLD_SECS,
};
use psec_types::NodeId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/psecd.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Engine core settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stack-wide MAC pool size
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Aging/hold tick in milliseconds; one tick counts as one second
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_zombie_hold")]
    pub zombie_hold_secs: u32,

    #[serde(default = "default_mac_table_full_guard")]
    pub mac_table_full_guard_secs: u64,

    #[serde(default)]
    pub role: NodeRole,

    #[serde(default = "default_local_node")]
    pub local_node: NodeId,
}

/// Stack topology and relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u8,

    #[serde(default = "default_ports_per_node")]
    pub ports_per_node: u16,

    /// Frames buffered towards the primary before new ones are dropped
    #[serde(default = "default_relay_queue_depth")]
    pub relay_queue_depth: usize,
}

/// Learn frame rate limiting on the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: u32,

    /// Drop repeats of the same (port, VLAN, MAC) within this window
    #[serde(default = "default_filter_secs")]
    pub filter_secs: u64,
}

/// Defaults for the limit-control policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    #[serde(default = "default_limit")]
    pub default_limit: u32,

    #[serde(default)]
    pub default_violation_mode: ViolationMode,

    #[serde(default = "default_violate_limit")]
    pub default_violate_limit: u32,

    #[serde(default = "default_aging_enabled")]
    pub aging_enabled: bool,

    #[serde(default = "default_aging_period")]
    pub aging_period_secs: u32,

    #[serde(default = "default_hold_time")]
    pub hold_time_secs: u32,
}

/// Complete psecd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PsecConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub stack: StackConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub limit: LimitConfig,
}

fn default_pool_capacity() -> usize {
    POOL_CAPACITY_DEFAULT
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_zombie_hold() -> u32 {
    ZOMBIE_HOLD_SECS
}

fn default_mac_table_full_guard() -> u64 {
    MAC_TABLE_FULL_GUARD_SECS
}

fn default_local_node() -> NodeId {
    NodeId::FIRST
}

fn default_max_nodes() -> u8 {
    NodeId::MAX
}

fn default_ports_per_node() -> u16 {
    64
}

fn default_relay_queue_depth() -> usize {
    64
}

fn default_burst() -> u32 {
    40
}

fn default_refill_per_sec() -> u32 {
    20
}

fn default_filter_secs() -> u64 {
    2
}

fn default_limit() -> u32 {
    4
}

fn default_violate_limit() -> u32 {
    1
}

fn default_aging_enabled() -> bool {
    true
}

fn default_aging_period() -> u32 {
    3600
}

fn default_hold_time() -> u32 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            tick_interval_ms: default_tick_interval(),
            zombie_hold_secs: default_zombie_hold(),
            mac_table_full_guard_secs: default_mac_table_full_guard(),
            role: NodeRole::default(),
            local_node: default_local_node(),
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
            ports_per_node: default_ports_per_node(),
            relay_queue_depth: default_relay_queue_depth(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            refill_per_sec: default_refill_per_sec(),
            filter_secs: default_filter_secs(),
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_violation_mode: ViolationMode::default(),
            default_violate_limit: default_violate_limit(),
            aging_enabled: default_aging_enabled(),
            aging_period_secs: default_aging_period(),
            hold_time_secs: default_hold_time(),
        }
    }
}

impl PsecConfig {
    pub fn from_yaml(content: &str, origin: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content, &path.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.engine.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.engine.pool_capacity == 0 {
            return invalid("engine.pool_capacity must be > 0".into());
        }
        if self.engine.tick_interval_ms == 0 {
            return invalid("engine.tick_interval_ms must be > 0".into());
        }
        if self.engine.zombie_hold_secs == 0 {
            return invalid("engine.zombie_hold_secs must be > 0".into());
        }
        if self.stack.max_nodes < NodeId::MIN || self.stack.max_nodes > NodeId::MAX {
            return invalid(format!(
                "stack.max_nodes must be {}-{}",
                NodeId::MIN,
                NodeId::MAX
            ));
        }
        if self.engine.local_node.as_u8() > self.stack.max_nodes {
            return invalid("engine.local_node exceeds stack.max_nodes".into());
        }
        if self.stack.ports_per_node == 0 {
            return invalid("stack.ports_per_node must be > 0".into());
        }
        if self.stack.relay_queue_depth == 0 {
            return invalid("stack.relay_queue_depth must be > 0".into());
        }
        if self.rate_limit.burst == 0 || self.rate_limit.refill_per_sec == 0 {
            return invalid("rate_limit.burst and rate_limit.refill_per_sec must be > 0".into());
        }
        if !(LIMIT_MIN..=LIMIT_MAX).contains(&self.limit.default_limit) {
            return invalid(format!("limit.default_limit must be {LIMIT_MIN}-{LIMIT_MAX}"));
        }
        if !(VIOLATE_LIMIT_MIN..=VIOLATE_LIMIT_MAX).contains(&self.limit.default_violate_limit) {
            return invalid(format!(
                "limit.default_violate_limit must be {VIOLATE_LIMIT_MIN}-{VIOLATE_LIMIT_MAX}"
            ));
        }
        if !(AGING_PERIOD_MIN..=AGING_PERIOD_MAX).contains(&self.limit.aging_period_secs) {
            return invalid(format!(
                "limit.aging_period_secs must be {AGING_PERIOD_MIN}-{AGING_PERIOD_MAX}"
            ));
        }
        if !(HOLD_TIME_MIN..=HOLD_TIME_MAX).contains(&self.limit.hold_time_secs) {
            return invalid(format!(
                "limit.hold_time_secs must be {HOLD_TIME_MIN}-{HOLD_TIME_MAX}"
            ));
        }
        Ok(())
    }
}

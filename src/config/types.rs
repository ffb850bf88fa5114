use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::pool::PoolConfig;
use crate::sched::SchedulerConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub target: TargetConfig,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    pub auth: AuthConfig,
}

const fn default_port() -> u16 {
    22
}

/// Authentication configuration.
///
/// Sensitive fields (`password`, `passphrase`) are wrapped in [`Zeroizing`]
/// so they are erased from memory when the config is dropped.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Key {
        path: String,
        #[serde(default)]
        passphrase: Option<Zeroizing<String>>,
    },
    Password {
        password: Zeroizing<String>,
    },
}

/// Connection pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Maximum concurrent connections to the target
    #[serde(default = "default_max_connection")]
    pub max_connection: usize,

    /// Transient connect failures retried before giving up
    #[serde(default = "default_connection_retry")]
    pub connection_retry: u32,

    /// Delay between connect attempts, in milliseconds
    #[serde(default = "default_connection_retry_delay_ms")]
    pub connection_retry_delay_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connection: default_max_connection(),
            connection_retry: default_connection_retry(),
            connection_retry_delay_ms: default_connection_retry_delay_ms(),
        }
    }
}

impl PoolSettings {
    /// Create a `PoolConfig` from these settings
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connection: self.max_connection,
            connection_retry: self.connection_retry,
            connection_retry_delay_ms: self.connection_retry_delay_ms,
        }
    }
}

const fn default_max_connection() -> usize {
    4
}

const fn default_connection_retry() -> u32 {
    5
}

const fn default_connection_retry_delay_ms() -> u64 {
    1000
}

/// Scheduler settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    /// Delay before a transiently failed order is dispatched again, in
    /// milliseconds
    #[serde(default = "default_exec_retry_delay_ms")]
    pub exec_retry_delay_ms: u64,

    /// Override of the running-order ceiling (default: `max_connection * 2`)
    #[serde(default)]
    pub max_running: Option<usize>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            exec_retry_delay_ms: default_exec_retry_delay_ms(),
            max_running: None,
        }
    }
}

impl SchedulerSettings {
    /// Create a `SchedulerConfig` from these settings
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            exec_retry_delay_ms: self.exec_retry_delay_ms,
            max_running: self.max_running,
        }
    }
}

const fn default_exec_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Read/write buffer size for file transfers, in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connection_timeout_seconds: default_connection_timeout(),
            command_timeout_seconds: default_command_timeout(),
            max_output_bytes: default_max_output_bytes(),
            chunk_size: default_chunk_size(),
        }
    }
}

const fn default_connection_timeout() -> u64 {
    10
}

const fn default_command_timeout() -> u64 {
    300
}

const fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

const fn default_chunk_size() -> usize {
    64 * 1024
}

//! Configuration recognized by the core (spec.md §6 table).
//!
//! Every struct here is a plain `serde`-deserializable value; the crate
//! takes no position on the source format (TOML, JSON, env) the way it
//! takes no position on a logging backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_max_size() -> usize {
    10
}
fn default_initial_size() -> usize {
    1
}
fn default_max_idle() -> usize {
    5
}
fn default_checkout_timeout_ms() -> u64 {
    5_000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_initial_size")]
    pub initial_size: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            initial_size: default_initial_size(),
            max_idle: default_max_idle(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl PoolConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_health_interval_ms() -> u64 {
    10_000
}
fn default_health_timeout_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_lag_threshold_ms() -> u64 {
    2_000
}
fn default_sticky_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagConfig {
    #[serde(default = "default_lag_threshold_ms")]
    pub threshold_ms: u64,
    #[serde(default = "default_sticky_ms")]
    pub sticky_default_ms: u64,
}

impl Default for LagConfig {
    fn default() -> Self {
        Self {
            threshold_ms: default_lag_threshold_ms(),
            sticky_default_ms: default_sticky_ms(),
        }
    }
}

impl LagConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    pub fn sticky_default(&self) -> Duration {
        Duration::from_millis(self.sticky_default_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbStrategy {
    RoundRobin,
    Random,
    LeastConnections,
}

impl Default for LbStrategy {
    fn default() -> Self {
        LbStrategy::RoundRobin
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LbConfig {
    #[serde(default)]
    pub strategy: LbStrategy,
}

fn default_optimistic_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimisticConfig {
    #[serde(default = "default_optimistic_retries")]
    pub default_retries: u32,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            default_retries: default_optimistic_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScatterConfig {
    #[serde(default)]
    pub allow_partial: bool,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl ScatterConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxConfig {
    #[serde(default)]
    pub default_isolation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrmConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub lag: LagConfig,
    #[serde(default)]
    pub lb: LbConfig,
    #[serde(default)]
    pub tx: TxConfig,
    #[serde(default)]
    pub optimistic: OptimisticConfig,
    #[serde(default)]
    pub scatter: ScatterConfig,
}

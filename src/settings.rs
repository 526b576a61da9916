use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct RpcSettings {
    /// Hard per-request timeout for the shared HTTP client.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Base retry count per endpoint, before priority multipliers.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum calls per JSON-RPC batch envelope.
    #[serde(default = "default_batch_chunk_size")]
    pub batch_chunk_size: usize,
    /// Maximum calls per aggregate3 request.
    #[serde(default = "default_multicall_chunk_size")]
    pub multicall_chunk_size: usize,
    /// Connection-pool bound for the shared HTTP client.
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    /// Probe round-trips above this mark an endpoint unhealthy.
    #[serde(default = "default_health_probe_threshold_seconds")]
    pub health_probe_threshold_seconds: u64,
    /// Endpoint candidates tried when resolving a working endpoint.
    #[serde(default = "default_max_probe_endpoints")]
    pub max_probe_endpoints: usize,
}

fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_batch_chunk_size() -> usize {
    100
}
fn default_multicall_chunk_size() -> usize {
    200
}
fn default_max_idle_per_host() -> usize {
    20
}
fn default_health_probe_threshold_seconds() -> u64 {
    10
}
fn default_max_probe_endpoints() -> usize {
    5
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout_seconds(),
            max_retries: default_max_retries(),
            batch_chunk_size: default_batch_chunk_size(),
            multicall_chunk_size: default_multicall_chunk_size(),
            max_idle_per_host: default_max_idle_per_host(),
            health_probe_threshold_seconds: default_health_probe_threshold_seconds(),
            max_probe_endpoints: default_max_probe_endpoints(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PerformanceSettings {
    /// Total wall-clock budget for one run.
    #[serde(default = "default_time_budget_seconds")]
    pub time_budget_seconds: u64,
    /// Past this elapsed time no new network tasks are submitted
    /// (8 minutes of the 9-minute default budget).
    #[serde(default = "default_safety_threshold_seconds")]
    pub safety_threshold_seconds: u64,
    /// Worker pool shared across networks, before strategy clamps.
    #[serde(default = "default_total_workers")]
    pub total_workers: usize,
    /// Per-network worker bound for the per-asset fallback strategy.
    #[serde(default = "default_asset_workers")]
    pub asset_workers: usize,
    /// Whole-network failures tolerated before the run stops submitting.
    #[serde(default = "default_max_network_failures")]
    pub max_network_failures: usize,
    /// Base wall-clock bound for one network's fetch, before priority and
    /// strategy multipliers.
    #[serde(default = "default_network_fetch_timeout_seconds")]
    pub network_fetch_timeout_seconds: u64,
}

fn default_time_budget_seconds() -> u64 {
    540
}
fn default_safety_threshold_seconds() -> u64 {
    480
}
fn default_total_workers() -> usize {
    12
}
fn default_asset_workers() -> usize {
    20
}
fn default_max_network_failures() -> usize {
    5
}
fn default_network_fetch_timeout_seconds() -> u64 {
    120
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            time_budget_seconds: default_time_budget_seconds(),
            safety_threshold_seconds: default_safety_threshold_seconds(),
            total_workers: default_total_workers(),
            asset_workers: default_asset_workers(),
            max_network_failures: default_max_network_failures(),
            network_fetch_timeout_seconds: default_network_fetch_timeout_seconds(),
        }
    }
}

/// Library configuration, layered from `Config.toml` (optional) and
/// `RESERVE_LENS_*` environment variables.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .add_source(Environment::with_prefix("RESERVE_LENS").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.request_timeout_seconds)
    }

    pub fn health_probe_threshold(&self) -> Duration {
        Duration::from_secs(self.rpc.health_probe_threshold_seconds)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.performance.time_budget_seconds)
    }

    pub fn safety_threshold(&self) -> Duration {
        Duration::from_secs(self.performance.safety_threshold_seconds)
    }

    pub fn network_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.network_fetch_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let settings = Settings::default();
        assert_eq!(settings.rpc.request_timeout_seconds, 30);
        assert_eq!(settings.rpc.max_retries, 3);
        assert_eq!(settings.performance.time_budget_seconds, 540);
        assert_eq!(settings.performance.safety_threshold_seconds, 480);
        assert!(settings.safety_threshold() < settings.time_budget());
    }

    #[test]
    fn test_empty_config_deserializes() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.performance.asset_workers, 20);
        assert_eq!(settings.rpc.batch_chunk_size, 100);
    }
}

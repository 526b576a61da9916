// src/health_monitor.rs
//
// Per-endpoint liveness and error-history tracking. Health is advisory: it
// only changes the order endpoints are tried in, it never removes one.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::networks::NetworkProfile;
use crate::rpc_client::RpcTransport;

/// Health record for one HTTP endpoint. Created on first use, mutated after
/// every call, never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub url: String,
    pub healthy: bool,
    /// Round-trip time of the most recent probe or call.
    #[serde(skip)]
    pub last_latency: Option<Duration>,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl EndpointHealth {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            healthy: true,
            last_latency: None,
            success_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            last_error: None,
            last_checked: None,
        }
    }

    /// Historical success ratio; endpoints with no history count as perfect
    /// so fresh fallbacks get a fair first try.
    pub fn success_ratio(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }
}

/// Tracks endpoint health across all networks for the lifetime of the
/// process. Shared across workers behind a mutex; lock scope is kept to
/// map reads/writes, never held across I/O.
pub struct HealthMonitor {
    endpoints: Mutex<HashMap<String, EndpointHealth>>,
    /// Probe round-trips above this mark the endpoint unhealthy.
    slow_response_threshold: Duration,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl HealthMonitor {
    pub fn new(slow_response_threshold: Duration) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            slow_response_threshold,
        }
    }

    /// Issues one lightweight `eth_chainId` probe against `url` and updates
    /// its health record.
    pub async fn check_endpoint(
        &self,
        transport: &dyn RpcTransport,
        url: &str,
    ) -> EndpointHealth {
        let start = Instant::now();
        let result = transport.call(url, "eth_chainId", json!([])).await;
        let latency = start.elapsed();

        let mut guard = self.endpoints.lock().unwrap();
        let health = guard
            .entry(url.to_string())
            .or_insert_with(|| EndpointHealth::new(url));
        health.last_checked = Some(Utc::now());
        health.last_latency = Some(latency);

        match result {
            Ok(_) => {
                health.success_count += 1;
                health.consecutive_failures = 0;
                health.last_error = None;
                if latency > self.slow_response_threshold {
                    health.healthy = false;
                    health.last_error = Some(format!("slow response: {:?}", latency));
                    warn!("Endpoint {} unhealthy: probe took {:?}", url, latency);
                } else {
                    health.healthy = true;
                    debug!("Endpoint {} healthy ({:?})", url, latency);
                }
            }
            Err(e) => {
                health.healthy = false;
                health.error_count += 1;
                health.consecutive_failures += 1;
                health.last_error = Some(e.to_string());
                warn!("Endpoint {} failed health probe: {}", url, e);
            }
        }
        health.clone()
    }

    /// Records the outcome of a real call (not a probe) against an endpoint.
    pub fn record_outcome(&self, url: &str, success: bool, error: Option<&str>) {
        let mut guard = self.endpoints.lock().unwrap();
        let health = guard
            .entry(url.to_string())
            .or_insert_with(|| EndpointHealth::new(url));
        if success {
            health.success_count += 1;
            health.consecutive_failures = 0;
            health.healthy = true;
        } else {
            health.error_count += 1;
            health.consecutive_failures += 1;
            health.last_error = error.map(|e| e.to_string());
        }
    }

    /// Orders a network's endpoints for the retry policy: healthy primary
    /// first, then healthy fallbacks by historical success ratio. If nothing
    /// is known-healthy, the full configured list is returned as a last
    /// resort, since a degraded endpoint is still better than none.
    pub async fn rank_endpoints(
        &self,
        transport: &dyn RpcTransport,
        profile: &NetworkProfile,
    ) -> Vec<String> {
        let primary = self.check_endpoint(transport, &profile.rpc).await;

        let mut fallbacks = Vec::with_capacity(profile.rpc_fallback.len());
        for url in &profile.rpc_fallback {
            fallbacks.push(self.check_endpoint(transport, url).await);
        }

        let mut ranked = Vec::new();
        if primary.healthy {
            ranked.push(primary.url.clone());
        }
        let mut healthy_fallbacks: Vec<&EndpointHealth> =
            fallbacks.iter().filter(|h| h.healthy).collect();
        healthy_fallbacks.sort_by(|a, b| {
            b.success_ratio()
                .partial_cmp(&a.success_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.extend(healthy_fallbacks.iter().map(|h| h.url.clone()));

        if ranked.is_empty() {
            warn!(
                "No healthy endpoints for {}; falling back to the full configured list",
                profile.name
            );
            return profile.all_endpoints();
        }
        ranked
    }

    /// Point-in-time copy of every endpoint record, for the run report.
    pub fn snapshot(&self) -> Vec<EndpointHealth> {
        let guard = self.endpoints.lock().unwrap();
        let mut records: Vec<EndpointHealth> = guard.values().cloned().collect();
        records.sort_by(|a, b| a.url.cmp(&b.url));
        records
    }
}

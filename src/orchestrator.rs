//! # Fetch Orchestrator
//!
//! Drives concurrent per-network fetches under a global wall-clock budget.
//!
//! ## Overview
//!
//! For every eligible network the orchestrator:
//! - ranks its endpoints through the `HealthMonitor` and resolves a working
//!   one with a cheap `eth_blockNumber` probe,
//! - fetches the asset registry list,
//! - runs the `BatchAggregationClient` strategy ladder with the timeout and
//!   retry budget the `NetworkPrioritizer` assigns,
//! - reports timing and outcome back to the prioritizer for future runs.
//!
//! Per network the fetch moves through
//! `pending → selecting-endpoint → aggregating → decoded` (or `failed`).
//! Network failures are isolated: a network that fails is simply absent
//! from the result mapping.
//!
//! ## Budget
//!
//! The run loop submits one task per eligible network, collecting results
//! as they complete. Once elapsed time crosses the safety threshold
//! (8 minutes of the default 9-minute budget) no further tasks are
//! submitted; already-started tasks are allowed to finish. Cancellation is
//! cooperative, never preemptive.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reserve_lens::orchestrator::FetchOrchestrator;
//! use reserve_lens::networks::active_networks;
//! use reserve_lens::settings::Settings;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let orchestrator = FetchOrchestrator::new(Settings::default())?;
//! let outcome = orchestrator.run(&active_networks()).await;
//! for (network, assets) in &outcome.assets {
//!     println!("{}: {} assets", network, assets.len());
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use ethers::types::Address;
use indexmap::IndexMap;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::abi::{decode_address_array, encode_no_args, selectors};
use crate::batch_fetcher::{BatchAggregationClient, FetchStrategy};
use crate::health_monitor::{EndpointHealth, HealthMonitor};
use crate::network_prioritizer::{NetworkPrioritizer, NetworkStats, StrategyMode};
use crate::networks::NetworkProfile;
use crate::retry::{call_with_fallback, RetryPolicy};
use crate::rpc_client::{eth_call_params, result_bytes, HttpTransport, RpcTransport};
use crate::settings::Settings;
use crate::types::AssetRecord;

/// Process-wide time budget for one run. Checked cooperatively between
/// task submissions, never enforced preemptively.
#[derive(Debug, Clone)]
pub struct FetchBudget {
    started: tokio::time::Instant,
    total: Duration,
    safety_threshold: Duration,
}

impl FetchBudget {
    pub fn new(total: Duration, safety_threshold: Duration) -> Self {
        Self {
            started: tokio::time::Instant::now(),
            total,
            safety_threshold,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    /// True once no new network tasks should be submitted.
    pub fn safety_exceeded(&self) -> bool {
        self.elapsed() >= self.safety_threshold
    }
}

/// Lifecycle of one network's fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NetworkFetchState {
    Pending,
    SelectingEndpoint,
    Aggregating,
    Decoded,
    Failed,
}

/// Final per-network outcome for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkOutcome {
    pub network_key: String,
    pub network_name: String,
    pub state: NetworkFetchState,
    pub strategy: Option<FetchStrategy>,
    pub asset_count: usize,
    pub elapsed_secs: f64,
    pub error: Option<String>,
}

/// Per-run performance and health summary handed to observability
/// collaborators next to the asset mapping.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub final_strategy_mode: StrategyMode,
    pub networks: Vec<NetworkOutcome>,
    pub endpoint_health: Vec<EndpointHealth>,
    pub network_stats: Vec<NetworkStats>,
    pub aggregated_count: usize,
    pub batched_count: usize,
    pub per_asset_count: usize,
}

/// Everything one run produces.
pub struct RunOutcome {
    /// Network key → decoded asset records, in completion order. A network
    /// that fully failed is absent.
    pub assets: IndexMap<String, Vec<AssetRecord>>,
    pub report: FetchReport,
}

struct TaskResult {
    key: String,
    name: String,
    state: NetworkFetchState,
    strategy: Option<FetchStrategy>,
    records: Vec<AssetRecord>,
    elapsed: Duration,
    error: Option<String>,
}

/// Owns the shared transport, health monitor, and prioritizer, and drives
/// the run loop. All shared state is explicit and injected into workers,
/// not process-wide singletons.
pub struct FetchOrchestrator {
    transport: Arc<dyn RpcTransport>,
    monitor: Arc<HealthMonitor>,
    prioritizer: Arc<NetworkPrioritizer>,
    settings: Arc<Settings>,
    client: Arc<BatchAggregationClient>,
}

impl FetchOrchestrator {
    /// Builds an orchestrator with the production HTTP transport.
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let transport: Arc<dyn RpcTransport> = Arc::new(HttpTransport::new(
            settings.request_timeout(),
            settings.rpc.max_idle_per_host,
        )?);
        Ok(Self::with_components(
            transport,
            Arc::new(HealthMonitor::new(settings.health_probe_threshold())),
            Arc::new(NetworkPrioritizer::default()),
            settings,
        ))
    }

    /// Full component injection, used by tests and by consumers that share
    /// a monitor/prioritizer across runs.
    pub fn with_components(
        transport: Arc<dyn RpcTransport>,
        monitor: Arc<HealthMonitor>,
        prioritizer: Arc<NetworkPrioritizer>,
        settings: Arc<Settings>,
    ) -> Self {
        let client = Arc::new(BatchAggregationClient::new(
            Arc::clone(&transport),
            Arc::clone(&monitor),
            Arc::clone(&settings),
        ));
        Self {
            transport,
            monitor,
            prioritizer,
            settings,
            client,
        }
    }

    /// Runs one fetch across `networks`, returning whatever subset
    /// succeeded plus the run report.
    pub async fn run(&self, networks: &[NetworkProfile]) -> RunOutcome {
        let started_at = Utc::now();
        let budget = FetchBudget::new(
            self.settings.time_budget(),
            self.settings.safety_threshold(),
        );

        let eligible: Vec<NetworkProfile> =
            networks.iter().filter(|n| n.active).cloned().collect();
        let keys: Vec<String> = eligible.iter().map(|n| n.key.clone()).collect();

        let mut strategy = self
            .prioritizer
            .select_strategy(budget.elapsed(), budget.total());
        let allocation = self
            .prioritizer
            .allocate_workers(strategy.max_workers, &keys);
        info!(
            "🎯 Run start: {} networks, {:?} strategy, {} workers",
            eligible.len(),
            strategy.mode,
            strategy.max_workers
        );

        // Submission order follows priority; the semaphore is the
        // network-level worker pool.
        let mut queue: Vec<NetworkProfile> = self
            .prioritizer
            .prioritized(&keys)
            .into_iter()
            .filter_map(|p| eligible.iter().find(|n| n.key == p.network_key).cloned())
            .collect();
        queue.reverse(); // pop() takes the highest-priority network first

        let pool = Arc::new(Semaphore::new(strategy.max_workers.max(1)));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut outcomes: Vec<NetworkOutcome> = Vec::new();
        let mut assets: IndexMap<String, Vec<AssetRecord>> = IndexMap::new();
        let mut failures = 0usize;

        while !queue.is_empty() || !tasks.is_empty() {
            // Submit while there is room, budget, and failure headroom.
            while !queue.is_empty() {
                if budget.safety_exceeded() {
                    warn!(
                        "⏳ Safety threshold reached after {:.0?}; {} networks not submitted",
                        budget.elapsed(),
                        queue.len()
                    );
                    queue.clear();
                    break;
                }
                if failures >= self.settings.performance.max_network_failures {
                    warn!(
                        "🛑 {} network failures; stopping submission to prevent a cascade",
                        failures
                    );
                    queue.clear();
                    break;
                }

                strategy = self
                    .prioritizer
                    .select_strategy(budget.elapsed(), budget.total());
                if strategy.mode == StrategyMode::CriticalOnly {
                    let next_key = queue.last().expect("queue non-empty").key.clone();
                    let critical: Vec<String> = self
                        .prioritizer
                        .critical(&keys)
                        .into_iter()
                        .map(|p| p.network_key)
                        .collect();
                    if !critical.contains(&next_key) {
                        let skipped = queue.pop().expect("queue non-empty");
                        info!(
                            "⏭️  Skipping {} under critical-only strategy",
                            skipped.name
                        );
                        continue;
                    }
                }

                let Ok(permit) = Arc::clone(&pool).try_acquire_owned() else {
                    break; // pool full; wait for a completion
                };
                let profile = queue.pop().expect("queue non-empty");

                let retries = self.prioritizer.calculate_retries(
                    &profile.key,
                    self.settings.rpc.max_retries,
                    &strategy,
                );
                let network_timeout = self.prioritizer.calculate_timeout(
                    &profile.key,
                    self.settings.network_fetch_timeout(),
                    &strategy,
                );
                let asset_workers = self
                    .settings
                    .performance
                    .asset_workers
                    .min(allocation.get(&profile.key).copied().unwrap_or(1) * 4)
                    .max(1);

                let transport = Arc::clone(&self.transport);
                let monitor = Arc::clone(&self.monitor);
                let client = Arc::clone(&self.client);
                let settings = Arc::clone(&self.settings);
                tasks.spawn(async move {
                    let _permit = permit;
                    fetch_network(
                        transport, monitor, client, settings, profile, retries,
                        network_timeout, asset_workers,
                    )
                    .await
                });
            }

            // Collect one completion; results merge keyed by network, no
            // cross-network ordering guaranteed.
            let Some(joined) = tasks.join_next().await else {
                continue;
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("Network task panicked: {}", e);
                    failures += 1;
                    continue;
                }
            };

            self.prioritizer.record_performance(
                &result.key,
                result.elapsed,
                result.state == NetworkFetchState::Decoded,
            );
            if result.state == NetworkFetchState::Decoded {
                info!(
                    "✅ {}: {} assets via {:?} in {:.2?}",
                    result.name,
                    result.records.len(),
                    result.strategy,
                    result.elapsed
                );
                assets.insert(result.key.clone(), result.records.clone());
            } else {
                warn!(
                    "❌ {}: {}",
                    result.name,
                    result.error.as_deref().unwrap_or("no data returned")
                );
                failures += 1;
            }
            outcomes.push(NetworkOutcome {
                network_key: result.key,
                network_name: result.name,
                state: result.state,
                strategy: result.strategy,
                asset_count: result.records.len(),
                elapsed_secs: result.elapsed.as_secs_f64(),
                error: result.error,
            });
        }

        let count_by = |wanted: FetchStrategy| {
            outcomes
                .iter()
                .filter(|o| o.strategy == Some(wanted))
                .count()
        };
        let aggregated_count = count_by(FetchStrategy::Aggregated);
        let batched_count = count_by(FetchStrategy::Batched);
        let per_asset_count = count_by(FetchStrategy::PerAsset);
        let report = FetchReport {
            started_at,
            elapsed_secs: budget.elapsed().as_secs_f64(),
            final_strategy_mode: strategy.mode,
            aggregated_count,
            batched_count,
            per_asset_count,
            networks: outcomes,
            endpoint_health: self.monitor.snapshot(),
            network_stats: self.prioritizer.stats(&keys),
        };
        info!(
            "🏁 Run complete: {}/{} networks in {:.1}s",
            assets.len(),
            eligible.len(),
            report.elapsed_secs
        );
        RunOutcome { assets, report }
    }
}

/// One network's full fetch: endpoint selection, registry list, strategy
/// ladder. Isolated so a failure here never touches sibling networks.
#[allow(clippy::too_many_arguments)]
async fn fetch_network(
    transport: Arc<dyn RpcTransport>,
    monitor: Arc<HealthMonitor>,
    client: Arc<BatchAggregationClient>,
    settings: Arc<Settings>,
    profile: NetworkProfile,
    retries: u32,
    network_timeout: Duration,
    asset_workers: usize,
) -> TaskResult {
    let start = Instant::now();
    let fail = |state: NetworkFetchState, error: String, start: Instant| TaskResult {
        key: profile.key.clone(),
        name: profile.name.clone(),
        state,
        strategy: None,
        records: Vec::new(),
        elapsed: start.elapsed(),
        error: Some(error),
    };

    let fetch = async {
        log::debug!("{}: pending -> selecting-endpoint", profile.name);
        let ranked = monitor.rank_endpoints(transport.as_ref(), &profile).await;
        let endpoints = match resolve_working_endpoint(
            transport.as_ref(),
            &ranked,
            settings.rpc.max_probe_endpoints,
        )
        .await
        {
            Some(endpoints) => endpoints,
            None => {
                return fail(
                    NetworkFetchState::Failed,
                    "no working endpoint".to_string(),
                    start,
                )
            }
        };

        let policy = RetryPolicy::default().with_max_retries(retries);

        let reserves = match fetch_reserves_list(
            transport.as_ref(),
            &monitor,
            &endpoints,
            profile.registry,
            &policy,
        )
        .await
        {
            Ok(reserves) if !reserves.is_empty() => reserves,
            Ok(_) => {
                return fail(
                    NetworkFetchState::Failed,
                    "registry returned no assets".to_string(),
                    start,
                )
            }
            Err(e) => return fail(NetworkFetchState::Failed, e, start),
        };
        info!("🎯 {}: {} assets registered", profile.name, reserves.len());

        log::debug!("{}: selecting-endpoint -> aggregating", profile.name);
        match client
            .fetch_network_assets(&profile, &endpoints, &reserves, &policy, asset_workers)
            .await
        {
            Ok((records, strategy)) => TaskResult {
                key: profile.key.clone(),
                name: profile.name.clone(),
                state: NetworkFetchState::Decoded,
                strategy: Some(strategy),
                records,
                elapsed: start.elapsed(),
                error: None,
            },
            Err(e) => fail(NetworkFetchState::Failed, e.to_string(), start),
        }
    };

    match tokio::time::timeout(network_timeout, fetch).await {
        Ok(result) => result,
        Err(_) => fail(
            NetworkFetchState::Failed,
            format!("network fetch timed out after {:?}", network_timeout),
            start,
        ),
    }
}

/// Probes ranked endpoints with `eth_blockNumber` (at most `max_probes`)
/// and reorders the list so the first responder leads.
async fn resolve_working_endpoint(
    transport: &dyn RpcTransport,
    ranked: &[String],
    max_probes: usize,
) -> Option<Vec<String>> {
    for url in ranked.iter().take(max_probes.max(1)) {
        if transport
            .call(url, "eth_blockNumber", serde_json::json!([]))
            .await
            .is_ok()
        {
            let mut ordered = vec![url.clone()];
            ordered.extend(ranked.iter().filter(|u| *u != url).cloned());
            return Some(ordered);
        }
    }
    None
}

async fn fetch_reserves_list(
    transport: &dyn RpcTransport,
    monitor: &HealthMonitor,
    endpoints: &[String],
    registry: Address,
    policy: &RetryPolicy,
) -> Result<Vec<Address>, String> {
    let params = eth_call_params(registry, &encode_no_args(*selectors::GET_RESERVES_LIST));
    let (value, endpoint) = call_with_fallback(
        transport,
        endpoints,
        "eth_call",
        params,
        policy,
        Some(monitor),
    )
    .await
    .map_err(|e| format!("registry list call failed: {}", e))?;

    let raw = result_bytes(&endpoint, &value).map_err(|e| e.to_string())?;
    decode_address_array(&raw).map_err(|e| format!("registry list undecodable: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_safety_threshold() {
        let budget = FetchBudget::new(Duration::from_secs(540), Duration::from_secs(480));
        assert!(!budget.safety_exceeded());
        tokio::time::advance(Duration::from_secs(481)).await;
        assert!(budget.safety_exceeded());
        assert!(budget.elapsed() >= Duration::from_secs(481));
    }
}

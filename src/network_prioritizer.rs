// src/network_prioritizer.rs
//
// Tier/weight-based network prioritization and resource allocation.
// Decides per-network timeouts, retry budgets, and worker counts, and picks
// the global execution strategy under time pressure.

use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Network importance tiers; lower value = more important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum NetworkTier {
    /// Must succeed.
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
}

impl NetworkTier {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Static priority configuration for one network. Mutated only by re-tuning,
/// never by fetch results.
#[derive(Debug, Clone, Serialize)]
pub struct PriorityProfile {
    pub network_key: String,
    pub tier: NetworkTier,
    /// Higher weight = larger resource share.
    pub weight: f64,
    pub timeout_multiplier: f64,
    pub retry_multiplier: u32,
    /// Worker floor guaranteed to critical-tier networks.
    pub dedicated_workers: usize,
}

impl PriorityProfile {
    /// Priority score; lower is higher priority.
    pub fn score(&self) -> f64 {
        self.tier.as_u8() as f64 + 1.0 / self.weight.max(0.1)
    }
}

/// Global execution mode derived from elapsed/total budget pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyMode {
    /// Plenty of time: all networks, maximum workers.
    Comprehensive,
    /// Moderate pressure: all networks, reduced workers and budgets.
    Prioritized,
    /// High pressure: critical tier only, minimum everything.
    CriticalOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStrategy {
    pub mode: StrategyMode,
    pub max_workers: usize,
    pub timeout_multiplier: f64,
    pub retry_multiplier: f64,
}

#[derive(Default)]
struct PerformanceHistory {
    /// Rolling per-network fetch durations, last 20 kept.
    times: HashMap<String, Vec<f64>>,
    successes: HashMap<String, u64>,
    failures: HashMap<String, u64>,
}

const HISTORY_WINDOW: usize = 20;
const TIMEOUT_CAP: Duration = Duration::from_secs(300);

/// Per-network statistics snapshot for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub network_key: String,
    pub tier: NetworkTier,
    pub weight: f64,
    pub average_time_secs: Option<f64>,
    pub failure_rate: f64,
    pub total_attempts: u64,
}

/// Owns the priority table and the rolling performance history. Shared
/// across fetch workers behind the history mutex.
pub struct NetworkPrioritizer {
    profiles: HashMap<String, PriorityProfile>,
    history: Mutex<PerformanceHistory>,
}

fn priority(
    key: &str,
    tier: NetworkTier,
    weight: f64,
    timeout_multiplier: f64,
    retry_multiplier: u32,
    dedicated_workers: usize,
) -> (String, PriorityProfile) {
    (
        key.to_string(),
        PriorityProfile {
            network_key: key.to_string(),
            tier,
            weight,
            timeout_multiplier,
            retry_multiplier,
            dedicated_workers,
        },
    )
}

impl Default for NetworkPrioritizer {
    fn default() -> Self {
        use NetworkTier::*;
        let profiles = HashMap::from([
            priority("ethereum", Critical, 3.0, 2.0, 3, 3),
            priority("polygon", Critical, 2.5, 1.8, 3, 2),
            priority("arbitrum", Critical, 2.5, 1.8, 3, 2),
            priority("optimism", High, 2.0, 1.5, 2, 2),
            priority("avalanche", High, 2.0, 1.5, 2, 2),
            priority("base", High, 1.8, 1.4, 2, 1),
            priority("bnb", Medium, 1.5, 1.2, 2, 1),
            priority("gnosis", Medium, 1.3, 1.2, 2, 1),
            priority("scroll", Medium, 1.2, 1.1, 1, 1),
            priority("metis", Low, 1.0, 1.0, 1, 1),
            priority("celo", Low, 1.0, 1.0, 1, 1),
            priority("linea", Low, 0.8, 0.9, 1, 1),
            priority("zksync", Low, 0.8, 0.9, 1, 1),
        ]);
        Self {
            profiles,
            history: Mutex::new(PerformanceHistory::default()),
        }
    }
}

impl NetworkPrioritizer {
    pub fn with_profiles(profiles: Vec<PriorityProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.network_key.clone(), p))
                .collect(),
            history: Mutex::new(PerformanceHistory::default()),
        }
    }

    /// Profile for a network; unknown networks get a conservative low-tier
    /// default rather than an error.
    pub fn profile_for(&self, network_key: &str) -> PriorityProfile {
        self.profiles.get(network_key).cloned().unwrap_or_else(|| {
            PriorityProfile {
                network_key: network_key.to_string(),
                tier: NetworkTier::Low,
                weight: 0.5,
                timeout_multiplier: 0.8,
                retry_multiplier: 1,
                dedicated_workers: 1,
            }
        })
    }

    /// Network keys sorted by priority score, highest priority first.
    pub fn prioritized(&self, network_keys: &[String]) -> Vec<PriorityProfile> {
        let mut profiles: Vec<PriorityProfile> = network_keys
            .iter()
            .map(|key| self.profile_for(key))
            .collect();
        profiles.sort_by(|a, b| {
            a.score()
                .partial_cmp(&b.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        profiles
    }

    /// Critical-tier subset, in priority order.
    pub fn critical(&self, network_keys: &[String]) -> Vec<PriorityProfile> {
        self.prioritized(network_keys)
            .into_iter()
            .filter(|p| p.tier == NetworkTier::Critical)
            .collect()
    }

    /// Distributes `total_workers` proportionally to weight. Critical
    /// networks are floored at their dedicated worker count, every included
    /// network gets at least one worker, and the total is never exceeded;
    /// once the budget runs out, remaining networks are left unallocated.
    pub fn allocate_workers(
        &self,
        total_workers: usize,
        network_keys: &[String],
    ) -> HashMap<String, usize> {
        let prioritized = self.prioritized(network_keys);
        let total_weight: f64 = prioritized.iter().map(|p| p.weight).sum();
        if total_weight <= 0.0 || total_workers == 0 {
            return HashMap::new();
        }

        let mut allocation = HashMap::new();
        let mut allocated = 0usize;
        for profile in &prioritized {
            let proportion = profile.weight / total_weight;
            let mut workers = ((total_workers as f64 * proportion) as usize).max(1);
            if profile.tier == NetworkTier::Critical {
                workers = workers.max(profile.dedicated_workers);
            }
            if allocated + workers > total_workers {
                workers = total_workers - allocated;
            }
            if workers == 0 {
                break;
            }
            allocation.insert(profile.network_key.clone(), workers);
            allocated += workers;
            if allocated >= total_workers {
                break;
            }
        }
        debug!(
            "Allocated {}/{} workers across {} networks",
            allocated,
            total_workers,
            allocation.len()
        );
        allocation
    }

    /// Picks the execution strategy from time pressure. The prioritized band
    /// runs up to 75% of budget so a run three-quarters through still
    /// covers every network before the critical-only clamp.
    pub fn select_strategy(&self, elapsed: Duration, total_budget: Duration) -> ExecutionStrategy {
        let pressure = if total_budget.is_zero() {
            1.0
        } else {
            elapsed.as_secs_f64() / total_budget.as_secs_f64()
        };

        let strategy = if pressure < 0.3 {
            ExecutionStrategy {
                mode: StrategyMode::Comprehensive,
                max_workers: 12,
                timeout_multiplier: 1.0,
                retry_multiplier: 1.0,
            }
        } else if pressure < 0.75 {
            ExecutionStrategy {
                mode: StrategyMode::Prioritized,
                max_workers: 8,
                timeout_multiplier: 0.8,
                retry_multiplier: 0.8,
            }
        } else {
            ExecutionStrategy {
                mode: StrategyMode::CriticalOnly,
                max_workers: 6,
                timeout_multiplier: 0.6,
                retry_multiplier: 0.5,
            }
        };
        info!(
            "⏱️  Time pressure {:.0}% -> {:?} strategy ({} workers)",
            pressure * 100.0,
            strategy.mode,
            strategy.max_workers
        );
        strategy
    }

    /// Effective timeout: base × profile multiplier × strategy multiplier,
    /// raised 50% when the rolling average fetch time crowds the timeout
    /// (above 80% of it), capped at 5 minutes.
    pub fn calculate_timeout(
        &self,
        network_key: &str,
        base: Duration,
        strategy: &ExecutionStrategy,
    ) -> Duration {
        let profile = self.profile_for(network_key);
        let mut timeout =
            base.mul_f64(profile.timeout_multiplier * strategy.timeout_multiplier);

        if let Some(avg) = self.average_time(network_key) {
            if avg > timeout.as_secs_f64() * 0.8 {
                timeout = timeout.mul_f64(1.5);
            }
        }
        timeout.min(TIMEOUT_CAP)
    }

    /// Effective retry count: base × profile multiplier × strategy
    /// multiplier, nudged down above 50% failure rate and up below 10%,
    /// clamped to [1, 5].
    pub fn calculate_retries(
        &self,
        network_key: &str,
        base: u32,
        strategy: &ExecutionStrategy,
    ) -> u32 {
        let profile = self.profile_for(network_key);
        let scaled =
            (base * profile.retry_multiplier) as f64 * strategy.retry_multiplier;
        let mut retries = scaled.round() as i64;

        let failure_rate = self.failure_rate(network_key);
        if failure_rate > 0.5 {
            retries -= 1;
        } else if failure_rate < 0.1 && self.total_attempts(network_key) > 0 {
            retries += 1;
        }
        retries.clamp(1, 5) as u32
    }

    /// Records one network fetch outcome for future scheduling decisions.
    pub fn record_performance(&self, network_key: &str, elapsed: Duration, success: bool) {
        let mut history = self.history.lock().unwrap();
        let times = history.times.entry(network_key.to_string()).or_default();
        times.push(elapsed.as_secs_f64());
        if times.len() > HISTORY_WINDOW {
            let excess = times.len() - HISTORY_WINDOW;
            times.drain(..excess);
        }
        if success {
            *history.successes.entry(network_key.to_string()).or_default() += 1;
        } else {
            *history.failures.entry(network_key.to_string()).or_default() += 1;
        }
    }

    pub fn failure_rate(&self, network_key: &str) -> f64 {
        let history = self.history.lock().unwrap();
        let successes = history.successes.get(network_key).copied().unwrap_or(0);
        let failures = history.failures.get(network_key).copied().unwrap_or(0);
        let total = successes + failures;
        if total == 0 {
            return 0.0;
        }
        failures as f64 / total as f64
    }

    fn total_attempts(&self, network_key: &str) -> u64 {
        let history = self.history.lock().unwrap();
        history.successes.get(network_key).copied().unwrap_or(0)
            + history.failures.get(network_key).copied().unwrap_or(0)
    }

    pub fn average_time(&self, network_key: &str) -> Option<f64> {
        let history = self.history.lock().unwrap();
        let times = history.times.get(network_key)?;
        if times.is_empty() {
            return None;
        }
        Some(times.iter().sum::<f64>() / times.len() as f64)
    }

    /// Per-network stats for the run report.
    pub fn stats(&self, network_keys: &[String]) -> Vec<NetworkStats> {
        network_keys
            .iter()
            .map(|key| {
                let profile = self.profile_for(key);
                NetworkStats {
                    network_key: key.clone(),
                    tier: profile.tier,
                    weight: profile.weight,
                    average_time_secs: self.average_time(key),
                    failure_rate: self.failure_rate(key),
                    total_attempts: self.total_attempts(key),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_score_ordering() {
        let prioritizer = NetworkPrioritizer::default();
        let ordered = prioritizer.prioritized(&keys(&["zksync", "ethereum", "bnb", "optimism"]));
        let order: Vec<&str> = ordered.iter().map(|p| p.network_key.as_str()).collect();
        assert_eq!(order, vec!["ethereum", "optimism", "bnb", "zksync"]);
    }

    #[test]
    fn test_unknown_network_gets_low_default() {
        let prioritizer = NetworkPrioritizer::default();
        let profile = prioritizer.profile_for("somechain");
        assert_eq!(profile.tier, NetworkTier::Low);
        assert!((profile.weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_allocate_workers_respects_total_and_minimum() {
        let prioritizer = NetworkPrioritizer::default();
        let all = keys(&[
            "ethereum",
            "polygon",
            "arbitrum",
            "optimism",
            "avalanche",
            "base",
            "bnb",
            "gnosis",
            "scroll",
            "metis",
        ]);
        for total in [4usize, 8, 12, 24] {
            let allocation = prioritizer.allocate_workers(total, &all);
            let sum: usize = allocation.values().sum();
            assert!(sum <= total, "allocated {} > total {}", sum, total);
            assert!(allocation.values().all(|w| *w >= 1));
        }
    }

    #[test]
    fn test_allocate_workers_critical_floor() {
        let prioritizer = NetworkPrioritizer::default();
        let allocation =
            prioritizer.allocate_workers(12, &keys(&["ethereum", "polygon", "metis"]));
        assert!(allocation["ethereum"] >= 3);
        assert!(allocation["polygon"] >= 2);
    }

    #[test]
    fn test_select_strategy_thresholds() {
        let prioritizer = NetworkPrioritizer::default();
        let total = Duration::from_secs(540);

        let s = prioritizer.select_strategy(Duration::ZERO, total);
        assert_eq!(s.mode, StrategyMode::Comprehensive);
        assert_eq!(s.max_workers, 12);

        let s = prioritizer.select_strategy(Duration::from_secs(400), total);
        assert_eq!(s.mode, StrategyMode::Prioritized);
        assert_eq!(s.max_workers, 8);

        let s = prioritizer.select_strategy(Duration::from_secs(500), total);
        assert_eq!(s.mode, StrategyMode::CriticalOnly);
        assert_eq!(s.max_workers, 6);
        assert!((s.retry_multiplier - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_timeout_raised_for_slow_networks() {
        let prioritizer = NetworkPrioritizer::default();
        let strategy = prioritizer.select_strategy(Duration::ZERO, Duration::from_secs(540));
        let base = Duration::from_secs(30);

        let fresh = prioritizer.calculate_timeout("metis", base, &strategy);
        assert_eq!(fresh, Duration::from_secs(30)); // 1.0 × 1.0

        // Rolling average above 80% of the timeout triggers the 1.5× bump.
        for _ in 0..5 {
            prioritizer.record_performance("metis", Duration::from_secs(29), true);
        }
        let raised = prioritizer.calculate_timeout("metis", base, &strategy);
        assert_eq!(raised, Duration::from_secs(45));
    }

    #[test]
    fn test_retries_follow_failure_rate() {
        let prioritizer = NetworkPrioritizer::default();
        let strategy = prioritizer.select_strategy(Duration::ZERO, Duration::from_secs(540));

        // gnosis: retry_multiplier 2, base 1 -> 2 retries, no history.
        assert_eq!(prioritizer.calculate_retries("gnosis", 1, &strategy), 2);

        // Mostly failures -> one fewer.
        for _ in 0..8 {
            prioritizer.record_performance("gnosis", Duration::from_secs(1), false);
        }
        prioritizer.record_performance("gnosis", Duration::from_secs(1), true);
        assert_eq!(prioritizer.calculate_retries("gnosis", 1, &strategy), 1);

        // Healthy network -> one extra.
        for _ in 0..10 {
            prioritizer.record_performance("base", Duration::from_secs(1), true);
        }
        assert_eq!(prioritizer.calculate_retries("base", 1, &strategy), 3);
    }
}

// src/retry.rs
//
// Executes one logical RPC call against a primary endpoint and an ordered
// list of fallbacks, with error-kind-specific backoff. Moves to the next
// endpoint only after exhausting the retry budget on the current one.

use log::{debug, warn};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::health_monitor::HealthMonitor;
use crate::rpc_client::{BatchCall, RpcError, RpcErrorKind, RpcTransport};

/// Backoff caps and retry budget for one logical call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per endpoint before falling through to the next one.
    pub max_retries: u32,
    /// Ceiling for rate-limit waits (server Retry-After included).
    pub rate_limit_cap: Duration,
    /// Ceiling for server-error and transport backoff.
    pub server_error_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            rate_limit_cap: Duration::from_secs(60),
            server_error_cap: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Attempt budget on one endpoint for a given error kind. Rate limits
    /// get a reduced budget so the call moves to the next endpoint sooner;
    /// invalid requests get exactly one attempt.
    fn attempts_for(&self, kind: RpcErrorKind) -> u32 {
        match kind {
            RpcErrorKind::InvalidRequest => 1,
            RpcErrorKind::RateLimited => self.max_retries.saturating_sub(1).max(1),
            _ => self.max_retries.max(1),
        }
    }

    /// Backoff delay before retry number `attempt` (1-based) on the same
    /// endpoint, for the given failure.
    fn delay_for(&self, error: &RpcError, attempt: u32) -> Duration {
        match error.kind {
            RpcErrorKind::RateLimited => match error.retry_after {
                Some(hint) => hint.min(self.rate_limit_cap),
                None => exponential_delay(attempt, self.rate_limit_cap),
            },
            RpcErrorKind::ServerError | RpcErrorKind::Transport => {
                exponential_delay(attempt, self.server_error_cap)
            }
            // Unknown / invalid-response errors back off briefly.
            _ => exponential_delay(attempt, Duration::from_secs(5)),
        }
    }
}

/// Exponential sequence (1s, 2s, 4s, ...) plus up to one second of jitter,
/// capped.
fn exponential_delay(attempt: u32, cap: Duration) -> Duration {
    let base = ExponentialBackoff::from_millis(2)
        .factor(500)
        .max_delay(cap)
        .nth(attempt.saturating_sub(1) as usize)
        .unwrap_or(cap);
    (base + jitter(Duration::from_secs(1))).min(cap)
}

/// Terminal failure after every endpoint's retry budget is spent.
#[derive(Debug, Error)]
#[error("all {endpoints_tried} endpoints exhausted: {last_error}")]
pub struct EndpointsExhausted {
    pub endpoints_tried: usize,
    #[source]
    pub last_error: RpcError,
}

/// Runs `operation` against each endpoint in order, retrying per the policy,
/// and returns the first success together with the endpoint that served it.
///
/// Health accounting is per endpoint, not per attempt: one failure is
/// recorded when an endpoint's budget is exhausted, one success when it
/// serves the call.
pub async fn execute_with_fallback<T, F, Fut>(
    endpoints: &[String],
    policy: &RetryPolicy,
    monitor: Option<&HealthMonitor>,
    operation: F,
) -> Result<(T, String), EndpointsExhausted>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut last_error: Option<RpcError> = None;

    for (endpoint_index, endpoint) in endpoints.iter().enumerate() {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation(endpoint.clone()).await {
                Ok(value) => {
                    if attempt > 1 || endpoint_index > 0 {
                        debug!(
                            "Call succeeded on attempt {} via {}",
                            attempt, endpoint
                        );
                    }
                    if let Some(monitor) = monitor {
                        monitor.record_outcome(endpoint, true, None);
                    }
                    return Ok((value, endpoint.clone()));
                }
                Err(error) => {
                    let budget = policy.attempts_for(error.kind);
                    if attempt >= budget {
                        warn!(
                            "Endpoint {} exhausted after {} attempt(s): {}",
                            endpoint, attempt, error
                        );
                        if let Some(monitor) = monitor {
                            monitor.record_outcome(endpoint, false, Some(&error.to_string()));
                        }
                        last_error = Some(error);
                        break;
                    }
                    let delay = policy.delay_for(&error, attempt);
                    debug!(
                        "Retrying {} in {:?} (attempt {}/{}): {}",
                        endpoint, delay, attempt, budget, error
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        if endpoint_index + 1 < endpoints.len() {
            debug!("Falling through to next endpoint after {}", endpoint);
        }
    }

    Err(EndpointsExhausted {
        endpoints_tried: endpoints.len(),
        last_error: last_error.unwrap_or_else(|| {
            RpcError::new(RpcErrorKind::Unknown, "<none>", "no endpoints configured")
        }),
    })
}

/// Single JSON-RPC call through the fallback ladder.
pub async fn call_with_fallback(
    transport: &dyn RpcTransport,
    endpoints: &[String],
    method: &str,
    params: Value,
    policy: &RetryPolicy,
    monitor: Option<&HealthMonitor>,
) -> Result<(Value, String), EndpointsExhausted> {
    execute_with_fallback(endpoints, policy, monitor, |endpoint| {
        let params = params.clone();
        async move { transport.call(&endpoint, method, params).await }
    })
    .await
}

/// Batch envelope through the fallback ladder.
pub async fn call_batch_with_fallback(
    transport: &dyn RpcTransport,
    endpoints: &[String],
    calls: &[BatchCall],
    policy: &RetryPolicy,
    monitor: Option<&HealthMonitor>,
) -> Result<(Vec<Option<Value>>, String), EndpointsExhausted> {
    execute_with_fallback(endpoints, policy, monitor, |endpoint| async move {
        transport.call_batch(&endpoint, calls).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingPrimary {
        primary_calls: AtomicU32,
        fallback_calls: AtomicU32,
    }

    #[async_trait]
    impl RpcTransport for FailingPrimary {
        async fn call(
            &self,
            endpoint: &str,
            _method: &str,
            _params: Value,
        ) -> Result<Value, RpcError> {
            if endpoint.contains("primary") {
                self.primary_calls.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::new(RpcErrorKind::Transport, endpoint, "refused"))
            } else {
                self.fallback_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("0xfa11bacc"))
            }
        }

        async fn call_batch(
            &self,
            endpoint: &str,
            calls: &[BatchCall],
        ) -> Result<Vec<Option<Value>>, RpcError> {
            let _ = endpoint;
            Ok(vec![None; calls.len()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_primary_exhaustion() {
        let transport = FailingPrimary {
            primary_calls: AtomicU32::new(0),
            fallback_calls: AtomicU32::new(0),
        };
        let monitor = HealthMonitor::default();
        let endpoints = vec![
            "https://primary.example".to_string(),
            "https://fallback.example".to_string(),
        ];
        let policy = RetryPolicy::default().with_max_retries(2);

        let (value, served_by) = call_with_fallback(
            &transport,
            &endpoints,
            "eth_blockNumber",
            json!([]),
            &policy,
            Some(&monitor),
        )
        .await
        .unwrap();

        assert_eq!(value, json!("0xfa11bacc"));
        assert_eq!(served_by, "https://fallback.example");
        assert_eq!(transport.primary_calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.fallback_calls.load(Ordering::SeqCst), 1);

        // Exactly one failure against the primary, one success for the
        // fallback, regardless of per-endpoint attempts.
        let snapshot = monitor.snapshot();
        let primary = snapshot
            .iter()
            .find(|h| h.url.contains("primary"))
            .unwrap();
        assert_eq!(primary.error_count, 1);
        let fallback = snapshot
            .iter()
            .find(|h| h.url.contains("fallback"))
            .unwrap();
        assert_eq!(fallback.success_count, 1);
    }

    struct RateLimitedOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RpcTransport for RateLimitedOnce {
        async fn call(
            &self,
            endpoint: &str,
            _method: &str,
            _params: Value,
        ) -> Result<Value, RpcError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RpcError::rate_limited(
                    endpoint,
                    Some(Duration::from_secs(7)),
                ))
            } else {
                Ok(json!("0x1"))
            }
        }

        async fn call_batch(
            &self,
            endpoint: &str,
            calls: &[BatchCall],
        ) -> Result<Vec<Option<Value>>, RpcError> {
            let _ = endpoint;
            Ok(vec![None; calls.len()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honors_retry_after() {
        let transport = RateLimitedOnce {
            calls: AtomicU32::new(0),
        };
        let endpoints = vec!["https://limited.example".to_string()];
        let policy = RetryPolicy::default().with_max_retries(3);

        let start = tokio::time::Instant::now();
        let (value, _) = call_with_fallback(
            &transport,
            &endpoints,
            "eth_call",
            json!([]),
            &policy,
            None,
        )
        .await
        .unwrap();

        assert_eq!(value, json!("0x1"));
        // Waited at least the server-provided hint before the second try.
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    struct AlwaysInvalid {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RpcTransport for AlwaysInvalid {
        async fn call(
            &self,
            endpoint: &str,
            _method: &str,
            _params: Value,
        ) -> Result<Value, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RpcError::new(
                RpcErrorKind::InvalidRequest,
                endpoint,
                "bad params",
            ))
        }

        async fn call_batch(
            &self,
            endpoint: &str,
            calls: &[BatchCall],
        ) -> Result<Vec<Option<Value>>, RpcError> {
            let _ = endpoint;
            Ok(vec![None; calls.len()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_never_retried() {
        let transport = AlwaysInvalid {
            calls: AtomicU32::new(0),
        };
        let endpoints = vec![
            "https://a.example".to_string(),
            "https://b.example".to_string(),
        ];
        let policy = RetryPolicy::default().with_max_retries(5);

        let err = call_with_fallback(
            &transport,
            &endpoints,
            "eth_call",
            json!([]),
            &policy,
            None,
        )
        .await
        .unwrap_err();

        // One attempt per endpoint, no retries, aggregate keeps last cause.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.endpoints_tried, 2);
        assert_eq!(err.last_error.kind, RpcErrorKind::InvalidRequest);
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let cap = Duration::from_secs(10);
        for attempt in 1..12 {
            assert!(exponential_delay(attempt, cap) <= cap);
        }
        assert!(exponential_delay(1, cap) >= Duration::from_secs(1));
    }
}

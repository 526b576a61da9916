//! # Batch Aggregation Client
//!
//! Turns N independent per-asset read calls into as few RPC round trips as
//! possible. Strategies are attempted in order, returning on first success:
//!
//! 1. **Aggregated**: one `aggregate3` multicall carrying every per-asset
//!    call (symbol + registry struct + provider struct).
//! 2. **Batched**: three JSON-RPC batch envelopes (symbols, registry
//!    configuration, provider market data), chunked to the provider limit.
//! 3. **PerAsset**: fully independent parallel calls through a bounded
//!    worker pool: maximum compatibility at maximum RPC cost.
//!
//! Partial success is returned rather than discarded: a strategy succeeds
//! as soon as it decodes at least one complete asset.

use anyhow::{anyhow, Result};
use ethers::types::Address;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::abi::{encode_address_arg, encode_no_args, selectors};
use crate::health_monitor::HealthMonitor;
use crate::multicall::{chunk_calls, Aggregate3Codec};
use crate::networks::NetworkProfile;
use crate::reserve_codec::{
    decode_provider_data, decode_reserve_struct, decode_symbol, merge_market_data,
    placeholder_symbol, ProviderReserveData, ReserveStructData,
};
use crate::retry::{call_batch_with_fallback, call_with_fallback, RetryPolicy};
use crate::rpc_client::{eth_call_params, result_bytes, BatchCall, RpcTransport};
use crate::settings::Settings;
use crate::types::{AssetRecord, CallDescriptor};

/// Which strategy ultimately produced a network's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FetchStrategy {
    Aggregated,
    Batched,
    PerAsset,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no assets registered for {network}")]
    NoAssets { network: String },
    #[error("all fetch strategies failed for {network}: {detail}")]
    AllStrategiesFailed { network: String, detail: String },
}

const CALLS_PER_ASSET: usize = 3;

/// Per-network fetch engine; shared components are injected by the
/// orchestrator.
pub struct BatchAggregationClient {
    transport: Arc<dyn RpcTransport>,
    monitor: Arc<HealthMonitor>,
    settings: Arc<Settings>,
}

impl BatchAggregationClient {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        monitor: Arc<HealthMonitor>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            transport,
            monitor,
            settings,
        }
    }

    /// Fetches records for every asset of one network, degrading through
    /// the strategy ladder. `endpoints` is the ranked list the retry policy
    /// walks for every underlying call; `asset_workers` bounds the
    /// per-asset pool of strategy 3 (scaled by the caller from the
    /// network's worker allocation).
    pub async fn fetch_network_assets(
        &self,
        profile: &NetworkProfile,
        endpoints: &[String],
        assets: &[Address],
        policy: &RetryPolicy,
        asset_workers: usize,
    ) -> Result<(Vec<AssetRecord>, FetchStrategy), FetchError> {
        if assets.is_empty() {
            return Err(FetchError::NoAssets {
                network: profile.key.clone(),
            });
        }

        let mut last_failure = String::new();

        if let Some(aggregation) = profile.aggregation_contract {
            info!(
                "🚀 {}: trying aggregated multicall for {} assets...",
                profile.name,
                assets.len()
            );
            let start = Instant::now();
            match self
                .fetch_aggregated(profile, endpoints, assets, policy, aggregation)
                .await
            {
                Ok(records) => {
                    info!(
                        "✅ {}: aggregated multicall decoded {}/{} assets in {:.2?}",
                        profile.name,
                        records.len(),
                        assets.len(),
                        start.elapsed()
                    );
                    return Ok((records, FetchStrategy::Aggregated));
                }
                Err(e) => {
                    warn!("⚠️  {}: aggregated multicall failed: {}", profile.name, e);
                    last_failure = e.to_string();
                }
            }
        } else {
            debug!(
                "{}: no aggregation contract configured, skipping multicall",
                profile.name
            );
        }

        info!("⚡ {}: trying JSON-RPC batch envelopes...", profile.name);
        let start = Instant::now();
        match self
            .fetch_batched(profile, endpoints, assets, policy)
            .await
        {
            Ok(records) => {
                info!(
                    "✅ {}: batch envelopes decoded {}/{} assets in {:.2?}",
                    profile.name,
                    records.len(),
                    assets.len(),
                    start.elapsed()
                );
                return Ok((records, FetchStrategy::Batched));
            }
            Err(e) => {
                warn!("⚠️  {}: batch envelopes failed: {}", profile.name, e);
                last_failure = e.to_string();
            }
        }

        info!("🔄 {}: falling back to per-asset calls...", profile.name);
        let start = Instant::now();
        match self
            .fetch_per_asset(profile, endpoints, assets, policy, asset_workers)
            .await
        {
            Ok(records) => {
                info!(
                    "✅ {}: per-asset calls decoded {}/{} assets in {:.2?}",
                    profile.name,
                    records.len(),
                    assets.len(),
                    start.elapsed()
                );
                Ok((records, FetchStrategy::PerAsset))
            }
            Err(e) => {
                warn!("❌ {}: all fetch strategies failed: {}", profile.name, e);
                if last_failure.is_empty() {
                    last_failure = e.to_string();
                }
                Err(FetchError::AllStrategiesFailed {
                    network: profile.key.clone(),
                    detail: last_failure,
                })
            }
        }
    }

    /// Strategy 1: everything in one aggregate3 call (chunked only when the
    /// call count exceeds the provider ceiling).
    async fn fetch_aggregated(
        &self,
        profile: &NetworkProfile,
        endpoints: &[String],
        assets: &[Address],
        policy: &RetryPolicy,
        aggregation: Address,
    ) -> Result<Vec<AssetRecord>> {
        let calls: Vec<CallDescriptor> = assets
            .iter()
            .flat_map(|asset| {
                [
                    CallDescriptor::new(*asset, encode_no_args(*selectors::SYMBOL)),
                    CallDescriptor::new(
                        profile.registry,
                        encode_address_arg(*selectors::GET_RESERVE_DATA, *asset),
                    ),
                    CallDescriptor::new(
                        profile.data_provider,
                        encode_address_arg(*selectors::GET_RESERVE_DATA, *asset),
                    ),
                ]
            })
            .collect();

        let mut outcomes = Vec::with_capacity(calls.len());
        for chunk in chunk_calls(&calls, self.settings.rpc.multicall_chunk_size) {
            let calldata = Aggregate3Codec::encode(chunk);
            let params = eth_call_params(aggregation, &calldata);
            let (value, endpoint) = call_with_fallback(
                self.transport.as_ref(),
                endpoints,
                "eth_call",
                params,
                policy,
                Some(&self.monitor),
            )
            .await
            .map_err(|e| anyhow!("aggregate3 chunk failed: {}", e))?;

            let raw = result_bytes(&endpoint, &value)
                .map_err(|e| anyhow!("aggregate3 result unreadable: {}", e))?;
            outcomes.extend(Aggregate3Codec::decode(&raw, chunk.len()));
        }

        let mut records = Vec::new();
        for (i, asset) in assets.iter().enumerate() {
            let base = i * CALLS_PER_ASSET;
            let entry = |offset: usize| {
                let outcome = &outcomes[base + offset];
                outcome.success.then_some(outcome.return_data.as_slice())
            };
            if let Some(record) =
                merge_asset(*asset, entry(0), entry(1), entry(2), false)
            {
                records.push(record);
            }
        }

        if records.is_empty() {
            return Err(anyhow!("no asset decoded from aggregated response"));
        }
        Ok(records)
    }

    /// Strategy 2: three batch envelopes, grouped by target contract and
    /// chunked to the provider's batch-size limit.
    async fn fetch_batched(
        &self,
        profile: &NetworkProfile,
        endpoints: &[String],
        assets: &[Address],
        policy: &RetryPolicy,
    ) -> Result<Vec<AssetRecord>> {
        let symbol_calls: Vec<BatchCall> = assets
            .iter()
            .map(|asset| {
                BatchCall::new(
                    "eth_call",
                    eth_call_params(*asset, &encode_no_args(*selectors::SYMBOL)),
                )
            })
            .collect();
        let registry_calls: Vec<BatchCall> = assets
            .iter()
            .map(|asset| {
                BatchCall::new(
                    "eth_call",
                    eth_call_params(
                        profile.registry,
                        &encode_address_arg(*selectors::GET_RESERVE_DATA, *asset),
                    ),
                )
            })
            .collect();
        let provider_calls: Vec<BatchCall> = assets
            .iter()
            .map(|asset| {
                BatchCall::new(
                    "eth_call",
                    eth_call_params(
                        profile.data_provider,
                        &encode_address_arg(*selectors::GET_RESERVE_DATA, *asset),
                    ),
                )
            })
            .collect();

        let symbols = self.run_batch_group(endpoints, &symbol_calls, policy).await?;
        let registry = self.run_batch_group(endpoints, &registry_calls, policy).await?;
        let provider = self.run_batch_group(endpoints, &provider_calls, policy).await?;

        // Uppercase SYMBOL() retry for the assets whose lowercase call
        // produced nothing decodable.
        let mut symbol_bytes: Vec<Option<Vec<u8>>> = symbols
            .iter()
            .map(|v| v.as_ref().and_then(|v| result_bytes("batch", v).ok()))
            .collect();
        let retry_indices: Vec<usize> = (0..assets.len())
            .filter(|&i| {
                symbol_bytes[i]
                    .as_deref()
                    .map_or(true, |b| decode_symbol(b, assets[i]).is_err())
            })
            .collect();
        if !retry_indices.is_empty() {
            debug!(
                "{}: retrying {} symbols via SYMBOL()",
                profile.name,
                retry_indices.len()
            );
            let fallback_calls: Vec<BatchCall> = retry_indices
                .iter()
                .map(|&i| {
                    BatchCall::new(
                        "eth_call",
                        eth_call_params(
                            assets[i],
                            &encode_no_args(*selectors::SYMBOL_UPPERCASE),
                        ),
                    )
                })
                .collect();
            if let Ok(fallback) = self
                .run_batch_group(endpoints, &fallback_calls, policy)
                .await
            {
                for (slot, value) in retry_indices.iter().zip(fallback) {
                    if let Some(bytes) =
                        value.as_ref().and_then(|v| result_bytes("batch", v).ok())
                    {
                        symbol_bytes[*slot] = Some(bytes);
                    }
                }
            }
        }

        let registry_bytes: Vec<Option<Vec<u8>>> = registry
            .iter()
            .map(|v| v.as_ref().and_then(|v| result_bytes("batch", v).ok()))
            .collect();
        let provider_bytes: Vec<Option<Vec<u8>>> = provider
            .iter()
            .map(|v| v.as_ref().and_then(|v| result_bytes("batch", v).ok()))
            .collect();

        let mut records = Vec::new();
        for (i, asset) in assets.iter().enumerate() {
            if let Some(record) = merge_asset(
                *asset,
                symbol_bytes[i].as_deref(),
                registry_bytes[i].as_deref(),
                provider_bytes[i].as_deref(),
                false,
            ) {
                records.push(record);
            }
        }

        if records.is_empty() {
            return Err(anyhow!("no asset decoded from batch responses"));
        }
        Ok(records)
    }

    /// Runs one call group as chunked batch envelopes, mapping results back
    /// positionally (ids are assigned per chunk by the transport).
    async fn run_batch_group(
        &self,
        endpoints: &[String],
        calls: &[BatchCall],
        policy: &RetryPolicy,
    ) -> Result<Vec<Option<serde_json::Value>>> {
        let mut results = Vec::with_capacity(calls.len());
        for chunk in calls.chunks(self.settings.rpc.batch_chunk_size.max(1)) {
            let (chunk_results, _) = call_batch_with_fallback(
                self.transport.as_ref(),
                endpoints,
                chunk,
                policy,
                Some(&self.monitor),
            )
            .await
            .map_err(|e| anyhow!("batch envelope failed: {}", e))?;
            results.extend(chunk_results);
        }
        Ok(results)
    }

    /// Strategy 3: independent calls per asset through a bounded worker
    /// pool. Symbol failures degrade to a placeholder instead of dropping
    /// the asset.
    async fn fetch_per_asset(
        &self,
        profile: &NetworkProfile,
        endpoints: &[String],
        assets: &[Address],
        policy: &RetryPolicy,
        asset_workers: usize,
    ) -> Result<Vec<AssetRecord>> {
        let semaphore = Arc::new(Semaphore::new(asset_workers.max(1)));

        let fetches = assets.iter().map(|asset| {
            let semaphore = Arc::clone(&semaphore);
            let asset = *asset;
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                self.fetch_single_asset(profile, endpoints, asset, policy)
                    .await
            }
        });

        let records: Vec<AssetRecord> = futures::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect();

        if records.is_empty() {
            return Err(anyhow!("no asset decoded via per-asset calls"));
        }
        Ok(records)
    }

    async fn fetch_single_asset(
        &self,
        profile: &NetworkProfile,
        endpoints: &[String],
        asset: Address,
        policy: &RetryPolicy,
    ) -> Option<AssetRecord> {
        // Registry struct is the one hard requirement per asset.
        let registry_params = eth_call_params(
            profile.registry,
            &encode_address_arg(*selectors::GET_RESERVE_DATA, asset),
        );
        let registry_bytes = match call_with_fallback(
            self.transport.as_ref(),
            endpoints,
            "eth_call",
            registry_params,
            policy,
            Some(&self.monitor),
        )
        .await
        {
            Ok((value, endpoint)) => result_bytes(&endpoint, &value).ok()?,
            Err(e) => {
                debug!("Asset {:?} registry call failed: {}", asset, e);
                return None;
            }
        };

        let symbol_bytes = self
            .fetch_symbol_bytes(endpoints, asset, policy)
            .await;

        let provider_params = eth_call_params(
            profile.data_provider,
            &encode_address_arg(*selectors::GET_RESERVE_DATA, asset),
        );
        let provider_bytes = match call_with_fallback(
            self.transport.as_ref(),
            endpoints,
            "eth_call",
            provider_params,
            policy,
            Some(&self.monitor),
        )
        .await
        {
            Ok((value, endpoint)) => result_bytes(&endpoint, &value).ok(),
            Err(_) => None,
        };

        merge_asset(
            asset,
            symbol_bytes.as_deref(),
            Some(&registry_bytes),
            provider_bytes.as_deref(),
            true,
        )
    }

    /// symbol() with an uppercase SYMBOL() retry.
    async fn fetch_symbol_bytes(
        &self,
        endpoints: &[String],
        asset: Address,
        policy: &RetryPolicy,
    ) -> Option<Vec<u8>> {
        for selector in [*selectors::SYMBOL, *selectors::SYMBOL_UPPERCASE] {
            let params = eth_call_params(asset, &encode_no_args(selector));
            if let Ok((value, endpoint)) = call_with_fallback(
                self.transport.as_ref(),
                endpoints,
                "eth_call",
                params,
                policy,
                Some(&self.monitor),
            )
            .await
            {
                if let Ok(bytes) = result_bytes(&endpoint, &value) {
                    if decode_symbol(&bytes, asset).is_ok() {
                        return Some(bytes);
                    }
                }
            }
        }
        None
    }
}

/// Merges the three per-asset responses into a record.
///
/// The registry struct (configuration + rates) and a decodable symbol are
/// required; provider totals are merged when present. With
/// `allow_placeholder`, a missing symbol degrades to an address-derived
/// placeholder instead of dropping the asset.
fn merge_asset(
    asset: Address,
    symbol_bytes: Option<&[u8]>,
    registry_bytes: Option<&[u8]>,
    provider_bytes: Option<&[u8]>,
    allow_placeholder: bool,
) -> Option<AssetRecord> {
    let registry: ReserveStructData = match registry_bytes.map(decode_reserve_struct) {
        Some(Ok(decoded)) => decoded,
        _ => {
            debug!("Asset {:?} dropped: registry struct undecodable", asset);
            return None;
        }
    };

    let symbol = match symbol_bytes.map(|b| decode_symbol(b, asset)) {
        Some(Ok(symbol)) => symbol,
        _ if allow_placeholder => placeholder_symbol(asset),
        _ => {
            debug!("Asset {:?} dropped: symbol undecodable", asset);
            return None;
        }
    };

    let provider: Option<ProviderReserveData> =
        provider_bytes.and_then(|b| decode_provider_data(b).ok());

    Some(AssetRecord {
        asset_address: asset,
        symbol,
        market: merge_market_data(&registry, provider.as_ref()),
        configuration: registry.configuration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiWriter;
    use ethers::types::U256;

    fn symbol_response(text: &str) -> Vec<u8> {
        let mut w = AbiWriter::new();
        w.push_usize(32);
        w.push_usize(text.len());
        w.push_padded_bytes(text.as_bytes());
        w.finish().to_vec()
    }

    fn registry_response() -> Vec<u8> {
        let mut w = AbiWriter::new();
        w.push_u256(U256::from(8000u64) | (U256::from(8250u64) << 16)); // ltv + lt
        for _ in 1..15 {
            w.push_u256(U256::zero());
        }
        w.finish().to_vec()
    }

    fn provider_response(total: u64) -> Vec<u8> {
        let mut w = AbiWriter::new();
        w.push_u256(U256::zero());
        w.push_u256(U256::zero());
        w.push_u256(U256::from(total));
        for _ in 3..12 {
            w.push_u256(U256::zero());
        }
        w.finish().to_vec()
    }

    #[test]
    fn test_merge_asset_complete() {
        let asset = Address::from_low_u64_be(9);
        let record = merge_asset(
            asset,
            Some(&symbol_response("WETH")),
            Some(&registry_response()),
            Some(&provider_response(777)),
            false,
        )
        .unwrap();
        assert_eq!(record.symbol, "WETH");
        assert!((record.configuration.loan_to_value - 0.80).abs() < 1e-9);
        assert_eq!(record.market.total_supplied, "777");
    }

    #[test]
    fn test_merge_asset_requires_registry_struct() {
        let asset = Address::from_low_u64_be(9);
        assert!(merge_asset(
            asset,
            Some(&symbol_response("WETH")),
            None,
            Some(&provider_response(1)),
            true,
        )
        .is_none());

        // Truncated registry struct is a decode failure, not a guess.
        assert!(merge_asset(
            asset,
            Some(&symbol_response("WETH")),
            Some(&registry_response()[..64]),
            None,
            true,
        )
        .is_none());
    }

    #[test]
    fn test_merge_asset_symbol_rules() {
        let asset = Address::from_low_u64_be(0xabcd);

        // Strict mode drops the asset without a symbol.
        assert!(merge_asset(asset, None, Some(&registry_response()), None, false).is_none());

        // Placeholder mode keeps it with a derived ticker.
        let record =
            merge_asset(asset, None, Some(&registry_response()), None, true).unwrap();
        assert_eq!(record.symbol, "TOKEN_0000ABCD");
        // No provider data: totals default to zero, registry rates kept.
        assert_eq!(record.market.total_supplied, "0");
    }
}

//! # Reserve Lens
//!
//! A resilient Rust library for batched retrieval of lending-protocol
//! reserve data across EVM networks. Given many independent networks, each
//! reachable through several unreliable HTTP JSON-RPC endpoints, it
//! retrieves a structured record for every asset in an on-chain registry
//! using the minimum number of round trips, tolerating endpoint outages,
//! rate limiting, and a hard wall-clock budget.
//!
//! ## Overview
//!
//! The crate layers four concerns:
//!
//! ### Codec Layer
//! Encodes contract read-calls into wire calldata and decodes raw return
//! values into typed records: dynamic address arrays, token symbols, the
//! packed reserve-configuration bitmap, and the single-call multicall
//! aggregation format.
//!
//! ### Resilience Layer
//! Tracks per-endpoint health, ranks endpoints per network, and executes
//! every logical call through a retry/fallback ladder with
//! error-kind-specific backoff.
//!
//! ### Allocation Layer
//! Assigns each network a priority tier and weight, derives timeout
//! multipliers, retry budgets, and worker allocations, and selects a global
//! execution strategy as the time budget drains.
//!
//! ### Orchestration Layer
//! Runs concurrent per-network fetches under the global deadline, degrading
//! per network from one aggregated multicall, to JSON-RPC batch envelopes,
//! to independent per-asset calls, and merges whatever succeeded.

// Codec Layer
/// Bounds-checked ABI cursor primitives and selectors
pub mod abi;
/// Reserve record decoding (bitmap, structs, symbols)
pub mod reserve_codec;
/// Single-call multicall aggregation codec
pub mod multicall;

// Core Types
/// Shared data records (AssetRecord, CallDescriptor, ...)
pub mod types;
/// Built-in network registry
pub mod networks;

// Resilience Layer
/// JSON-RPC transport and error taxonomy
pub mod rpc_client;
/// Retry/fallback execution policy
pub mod retry;
/// Endpoint health tracking and ranking
pub mod health_monitor;

// Allocation Layer
/// Network prioritization and resource allocation
pub mod network_prioritizer;

// Orchestration Layer
/// Three-tier batch aggregation client
pub mod batch_fetcher;
/// Top-level fetch orchestrator
pub mod orchestrator;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use batch_fetcher::{BatchAggregationClient, FetchStrategy};
pub use health_monitor::HealthMonitor;
pub use network_prioritizer::NetworkPrioritizer;
pub use networks::NetworkProfile;
pub use orchestrator::{FetchOrchestrator, FetchReport, RunOutcome};
pub use settings::Settings;
pub use types::AssetRecord;

// src/types.rs
//
// Core data records shared across the codec, batch client, and orchestrator.

use ethers::types::{Address, Bytes};
use serde::{Deserialize, Serialize};

/// Decoded reserve configuration, unpacked from the 256-bit bitmap.
///
/// Basis-point fields (`loan_to_value`, `liquidation_threshold`,
/// `liquidation_bonus`, `reserve_factor`, `liquidation_protocol_fee`) are
/// already divided down to fractional values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveConfiguration {
    pub loan_to_value: f64,
    pub liquidation_threshold: f64,
    pub liquidation_bonus: f64,
    pub decimals: u8,
    pub active: bool,
    pub frozen: bool,
    pub borrowing_enabled: bool,
    pub stable_borrowing_enabled: bool,
    pub paused: bool,
    pub borrowable_in_isolation: bool,
    pub siloed_borrowing: bool,
    pub flashloan_enabled: bool,
    pub reserve_factor: f64,
    pub borrow_cap: u64,
    pub supply_cap: u64,
    pub liquidation_protocol_fee: f64,
    pub emode_category: u8,
    pub unbacked_mint_cap: u64,
    pub debt_ceiling: u64,
}

/// Decoded market-side state for one reserve: rates and indices converted
/// from RAY (1e27) fixed point, plus raw supply/borrow totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub liquidity_rate: f64,
    pub variable_borrow_rate: f64,
    pub liquidity_index: f64,
    pub variable_borrow_index: f64,
    /// Total supplied, in the asset's base units (stringified uint256).
    pub total_supplied: String,
    /// Total borrowed at variable rate, in base units (stringified uint256).
    pub total_borrowed: String,
    pub last_update_timestamp: u64,
}

/// One fully decoded asset: registry configuration merged with market data.
/// Immutable once constructed; owned by its network's result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub asset_address: Address,
    pub symbol: String,
    pub configuration: ReserveConfiguration,
    pub market: MarketData,
}

/// A single encoded read call awaiting execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescriptor {
    /// Target contract address.
    pub target: Address,
    /// Selector plus encoded argument bytes.
    pub call_data: Bytes,
}

impl CallDescriptor {
    pub fn new(target: Address, call_data: Bytes) -> Self {
        Self { target, call_data }
    }
}

/// Per-call outcome of one aggregation attempt, aligned positionally with
/// the originating descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationOutcome {
    pub success: bool,
    pub return_data: Vec<u8>,
}

impl AggregationOutcome {
    pub fn failed() -> Self {
        Self {
            success: false,
            return_data: Vec::new(),
        }
    }
}

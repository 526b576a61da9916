// src/reserve_codec.rs
//
// Decoders for the reserve record shapes returned by the registry and
// market-data contracts: the packed configuration bitmap, the 15-word
// registry struct, the 12-word market-data-provider struct, and token
// symbols with per-network corrections.

use ethers::types::{Address, U256};
use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::abi::{self, AbiReader, DecodeError, WORD};
use crate::types::{MarketData, ReserveConfiguration};

/// RAY fixed-point scale (1e27) used by on-chain rates and indices.
pub const RAY: f64 = 1e27;

/// Registry `getReserveData` returns a 15-word struct.
const RESERVE_STRUCT_WORDS: usize = 15;
/// Provider `getReserveData` returns a 12-word struct.
const PROVIDER_STRUCT_WORDS: usize = 12;

/// Rates, indices, and timestamp decoded from the registry struct alongside
/// the configuration bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveStructData {
    pub configuration: ReserveConfiguration,
    pub liquidity_rate: f64,
    pub variable_borrow_rate: f64,
    pub liquidity_index: f64,
    pub variable_borrow_index: f64,
    pub last_update_timestamp: u64,
}

/// Supply/borrow totals and rate fields from the market-data provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReserveData {
    pub total_supplied: U256,
    pub total_stable_debt: U256,
    pub total_variable_debt: U256,
    pub liquidity_rate: f64,
    pub variable_borrow_rate: f64,
    pub liquidity_index: f64,
    pub variable_borrow_index: f64,
    pub last_update_timestamp: u64,
}

fn bits(value: U256, start: usize, width: usize) -> u64 {
    debug_assert!(width <= 64);
    let mask = if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    ((value >> start).low_u64()) & mask
}

fn bps(raw: u64) -> f64 {
    raw as f64 / 10_000.0
}

/// Unpacks the 256-bit reserve configuration bitmap.
///
/// The liquidation bonus keeps the on-chain asymmetry: the raw basis-point
/// value is offset by 1.0 only when it is non-zero.
pub fn decode_configuration(config: U256) -> ReserveConfiguration {
    let liquidation_bonus_raw = bits(config, 32, 16);
    ReserveConfiguration {
        loan_to_value: bps(bits(config, 0, 16)),
        liquidation_threshold: bps(bits(config, 16, 16)),
        liquidation_bonus: if liquidation_bonus_raw > 0 {
            bps(liquidation_bonus_raw) - 1.0
        } else {
            0.0
        },
        decimals: bits(config, 48, 8) as u8,
        active: bits(config, 56, 1) != 0,
        frozen: bits(config, 57, 1) != 0,
        borrowing_enabled: bits(config, 58, 1) != 0,
        stable_borrowing_enabled: bits(config, 59, 1) != 0,
        paused: bits(config, 60, 1) != 0,
        borrowable_in_isolation: bits(config, 61, 1) != 0,
        siloed_borrowing: bits(config, 62, 1) != 0,
        flashloan_enabled: bits(config, 63, 1) != 0,
        reserve_factor: bps(bits(config, 64, 16)),
        borrow_cap: bits(config, 80, 16),
        supply_cap: bits(config, 96, 16),
        liquidation_protocol_fee: bps(bits(config, 112, 16)),
        emode_category: bits(config, 128, 8) as u8,
        unbacked_mint_cap: bits(config, 136, 40),
        debt_ceiling: bits(config, 176, 40),
    }
}

/// Lossy U256 → f64, good to ~18 significant digits. Rates and indices stay
/// well within that after the RAY division.
pub fn u256_to_f64_lossy(v: U256) -> f64 {
    if v.is_zero() {
        return 0.0;
    }
    let s = v.to_string();
    let len = s.len();
    let take = if len >= 18 { 18 } else { len };
    let (mantissa_str, _rest) = s.split_at(take);
    let mantissa = mantissa_str.parse::<f64>().unwrap_or(0.0);
    let exp10 = (len - take) as i32;
    mantissa * 10f64.powi(exp10)
}

/// Converts a RAY-scaled fixed-point value to a plain decimal.
pub fn ray_to_f64(v: U256) -> f64 {
    u256_to_f64_lossy(v) / RAY
}

/// Decodes the registry contract's 15-word reserve struct:
/// configuration, liquidityIndex, currentLiquidityRate, variableBorrowIndex,
/// currentVariableBorrowRate, currentStableBorrowRate, lastUpdateTimestamp,
/// id, and four addresses plus treasury/unbacked tail words.
pub fn decode_reserve_struct(data: &[u8]) -> Result<ReserveStructData, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    let reader = AbiReader::new(data);
    if reader.len() < RESERVE_STRUCT_WORDS * WORD {
        return Err(DecodeError::Truncated {
            offset: 0,
            needed: RESERVE_STRUCT_WORDS * WORD,
            available: reader.len(),
        });
    }

    let configuration = decode_configuration(reader.u256_at(0)?);
    Ok(ReserveStructData {
        configuration,
        liquidity_index: ray_to_f64(reader.u256_at(WORD)?),
        liquidity_rate: ray_to_f64(reader.u256_at(2 * WORD)?),
        variable_borrow_index: ray_to_f64(reader.u256_at(3 * WORD)?),
        variable_borrow_rate: ray_to_f64(reader.u256_at(4 * WORD)?),
        last_update_timestamp: reader.u256_at(6 * WORD)?.low_u64(),
    })
}

/// Decodes the market-data provider's 12-word reserve struct:
/// unbacked, accruedToTreasury, totalSupplied, totalStableDebt,
/// totalVariableDebt, liquidityRate, variableBorrowRate, stableBorrowRate,
/// averageStableRate, liquidityIndex, variableBorrowIndex, lastUpdate.
pub fn decode_provider_data(data: &[u8]) -> Result<ProviderReserveData, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    let reader = AbiReader::new(data);
    if reader.len() < PROVIDER_STRUCT_WORDS * WORD {
        return Err(DecodeError::Truncated {
            offset: 0,
            needed: PROVIDER_STRUCT_WORDS * WORD,
            available: reader.len(),
        });
    }

    Ok(ProviderReserveData {
        total_supplied: reader.u256_at(2 * WORD)?,
        total_stable_debt: reader.u256_at(3 * WORD)?,
        total_variable_debt: reader.u256_at(4 * WORD)?,
        liquidity_rate: ray_to_f64(reader.u256_at(5 * WORD)?),
        variable_borrow_rate: ray_to_f64(reader.u256_at(6 * WORD)?),
        liquidity_index: ray_to_f64(reader.u256_at(9 * WORD)?),
        variable_borrow_index: ray_to_f64(reader.u256_at(10 * WORD)?),
        last_update_timestamp: reader.u256_at(11 * WORD)?.low_u64(),
    })
}

/// Merges registry-struct and provider-struct decodes into the market half
/// of an `AssetRecord`. Provider totals win for supply/borrow; the registry
/// struct supplies rates when the provider entry is absent.
pub fn merge_market_data(
    registry: &ReserveStructData,
    provider: Option<&ProviderReserveData>,
) -> MarketData {
    match provider {
        Some(p) => MarketData {
            liquidity_rate: p.liquidity_rate,
            variable_borrow_rate: p.variable_borrow_rate,
            liquidity_index: p.liquidity_index,
            variable_borrow_index: p.variable_borrow_index,
            total_supplied: p.total_supplied.to_string(),
            total_borrowed: p.total_variable_debt.to_string(),
            last_update_timestamp: p.last_update_timestamp,
        },
        None => MarketData {
            liquidity_rate: registry.liquidity_rate,
            variable_borrow_rate: registry.variable_borrow_rate,
            liquidity_index: registry.liquidity_index,
            variable_borrow_index: registry.variable_borrow_index,
            total_supplied: "0".to_string(),
            total_borrowed: "0".to_string(),
            last_update_timestamp: registry.last_update_timestamp,
        },
    }
}

/// Bridged USDC deployments that report the same "USDC" ticker as the native
/// token on their network; remapped to "USDC.e" so downstream reports can
/// tell them apart.
static BRIDGED_USDC: Lazy<HashMap<Address, &'static str>> = Lazy::new(|| {
    [
        // Polygon
        ("0x2791bca1f2de4661ed88a30c99a7a9449aa84174", "USDC.e"),
        // Arbitrum
        ("0xff970a61a04b1ca14834a43f5de4533ebddb5cc8", "USDC.e"),
        // Optimism
        ("0x7f5c764cbc14f9669b88837ca1490cca17c31607", "USDC.e"),
    ]
    .iter()
    .filter_map(|(addr, sym)| addr.parse().ok().map(|a: Address| (a, *sym)))
    .collect()
});

/// Unicode tether variants seen in the wild; normalized to the plain ticker.
fn normalize_ticker(symbol: &str) -> &str {
    match symbol {
        "USD₮0" | "USDt₮" | "USD₮" | "USDt" | "USD0" => "USDT",
        other => other,
    }
}

/// Decodes a token symbol response and applies the correction table.
pub fn decode_symbol(data: &[u8], asset: Address) -> Result<String, DecodeError> {
    let raw = abi::decode_string(data)?;
    let normalized = normalize_ticker(&raw);

    if normalized == "USDC" {
        if let Some(corrected) = BRIDGED_USDC.get(&asset) {
            log::debug!(
                "Symbol correction: {:?} reported 'USDC', remapped to '{}'",
                asset,
                corrected
            );
            return Ok((*corrected).to_string());
        }
    }

    Ok(normalized.to_string())
}

/// Placeholder symbol for assets whose symbol call failed entirely, derived
/// from the contract address tail so records stay distinguishable.
pub fn placeholder_symbol(asset: Address) -> String {
    let tail = &asset.as_bytes()[16..];
    format!("TOKEN_{}", hex::encode_upper(tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::AbiWriter;
    use std::str::FromStr;

    fn pack(fields: &[(usize, usize, u64)]) -> U256 {
        let mut config = U256::zero();
        for (start, width, value) in fields {
            assert!(*value < (1u64 << *width) || *width == 64);
            config = config | (U256::from(*value) << *start);
        }
        config
    }

    #[test]
    fn test_configuration_round_trip() {
        let config = pack(&[
            (0, 16, 8000),    // ltv 0.80
            (16, 16, 8250),   // liquidation threshold 0.825
            (32, 16, 10500),  // liquidation bonus 1.05 -> 0.05
            (48, 8, 6),       // decimals
            (56, 1, 1),       // active
            (58, 1, 1),       // borrowing enabled
            (63, 1, 1),       // flashloan enabled
            (64, 16, 1000),   // reserve factor 0.10
            (80, 16, 9000),   // borrow cap
            (96, 16, 10000),  // supply cap
            (112, 16, 1000),  // liquidation protocol fee 0.10
            (128, 8, 1),      // e-mode category
            (136, 40, 12345), // unbacked mint cap
            (176, 40, 67890), // debt ceiling
        ]);

        let decoded = decode_configuration(config);
        assert!((decoded.loan_to_value - 0.80).abs() < 1e-9);
        assert!((decoded.liquidation_threshold - 0.825).abs() < 1e-9);
        assert!((decoded.liquidation_bonus - 0.05).abs() < 1e-9);
        assert_eq!(decoded.decimals, 6);
        assert!(decoded.active);
        assert!(!decoded.frozen);
        assert!(decoded.borrowing_enabled);
        assert!(!decoded.stable_borrowing_enabled);
        assert!(!decoded.paused);
        assert!(decoded.flashloan_enabled);
        assert!((decoded.reserve_factor - 0.10).abs() < 1e-9);
        assert_eq!(decoded.borrow_cap, 9000);
        assert_eq!(decoded.supply_cap, 10000);
        assert!((decoded.liquidation_protocol_fee - 0.10).abs() < 1e-9);
        assert_eq!(decoded.emode_category, 1);
        assert_eq!(decoded.unbacked_mint_cap, 12345);
        assert_eq!(decoded.debt_ceiling, 67890);
    }

    #[test]
    fn test_liquidation_bonus_zero_stays_zero() {
        // Zero raw bonus must not become -1.0.
        let decoded = decode_configuration(U256::zero());
        assert_eq!(decoded.liquidation_bonus, 0.0);

        let decoded = decode_configuration(pack(&[(32, 16, 1)]));
        assert!((decoded.liquidation_bonus - (0.0001 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_decode_reserve_struct() {
        let mut w = AbiWriter::new();
        w.push_u256(pack(&[(0, 16, 7500), (48, 8, 18), (56, 1, 1)])); // configuration
        w.push_u256(U256::from(10).pow(U256::from(27))); // liquidityIndex = 1.0 RAY
        w.push_u256(U256::from(10).pow(U256::from(27)) / 20); // liquidityRate = 0.05
        w.push_u256(U256::from(10).pow(U256::from(27))); // variableBorrowIndex
        w.push_u256(U256::from(10).pow(U256::from(27)) / 10); // variableBorrowRate = 0.1
        w.push_u256(U256::zero()); // stable rate
        w.push_usize(1_700_000_000); // lastUpdateTimestamp
        for _ in 7..15 {
            w.push_u256(U256::zero());
        }

        let decoded = decode_reserve_struct(&w.finish()).unwrap();
        assert!((decoded.configuration.loan_to_value - 0.75).abs() < 1e-9);
        assert_eq!(decoded.configuration.decimals, 18);
        assert!(decoded.configuration.active);
        assert!((decoded.liquidity_index - 1.0).abs() < 1e-9);
        assert!((decoded.liquidity_rate - 0.05).abs() < 1e-9);
        assert!((decoded.variable_borrow_rate - 0.10).abs() < 1e-9);
        assert_eq!(decoded.last_update_timestamp, 1_700_000_000);
    }

    #[test]
    fn test_decode_reserve_struct_truncated() {
        let mut w = AbiWriter::new();
        for _ in 0..14 {
            w.push_u256(U256::zero());
        }
        assert!(matches!(
            decode_reserve_struct(&w.finish()),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_provider_data() {
        let mut w = AbiWriter::new();
        w.push_u256(U256::zero()); // unbacked
        w.push_u256(U256::zero()); // accruedToTreasury
        w.push_u256(U256::from(1_000_000u64)); // totalSupplied
        w.push_u256(U256::from(1_000u64)); // totalStableDebt
        w.push_u256(U256::from(250_000u64)); // totalVariableDebt
        w.push_u256(U256::from(10).pow(U256::from(27)) / 50); // liquidityRate = 0.02
        w.push_u256(U256::from(10).pow(U256::from(27)) / 25); // variableBorrowRate = 0.04
        w.push_u256(U256::zero()); // stableBorrowRate
        w.push_u256(U256::zero()); // averageStableRate
        w.push_u256(U256::from(10).pow(U256::from(27))); // liquidityIndex
        w.push_u256(U256::from(10).pow(U256::from(27))); // variableBorrowIndex
        w.push_usize(1_700_000_123); // lastUpdate

        let decoded = decode_provider_data(&w.finish()).unwrap();
        assert_eq!(decoded.total_supplied, U256::from(1_000_000u64));
        assert_eq!(decoded.total_variable_debt, U256::from(250_000u64));
        assert!((decoded.liquidity_rate - 0.02).abs() < 1e-9);
        assert!((decoded.variable_borrow_rate - 0.04).abs() < 1e-9);
        assert_eq!(decoded.last_update_timestamp, 1_700_000_123);
    }

    #[test]
    fn test_symbol_correction_bridged_usdc() {
        let bridged = Address::from_str("0xff970a61a04b1ca14834a43f5de4533ebddb5cc8").unwrap();
        let native = Address::from_str("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();

        let mut w = AbiWriter::new();
        w.push_usize(32);
        w.push_usize(4);
        w.push_padded_bytes(b"USDC");
        let data = w.finish();

        assert_eq!(decode_symbol(&data, bridged).unwrap(), "USDC.e");
        assert_eq!(decode_symbol(&data, native).unwrap(), "USDC");
    }

    #[test]
    fn test_symbol_tether_variants_normalized() {
        let asset = Address::from_low_u64_be(7);
        let variant = "USD₮0".as_bytes();
        let mut w = AbiWriter::new();
        w.push_usize(32);
        w.push_usize(variant.len());
        w.push_padded_bytes(variant);
        assert_eq!(decode_symbol(&w.finish(), asset).unwrap(), "USDT");
    }

    #[test]
    fn test_placeholder_symbol() {
        let asset = Address::from_str("0x00000000000000000000000000000000deadbeef").unwrap();
        assert_eq!(placeholder_symbol(asset), "TOKEN_DEADBEEF");
    }

    #[test]
    fn test_ray_conversion() {
        assert_eq!(ray_to_f64(U256::zero()), 0.0);
        let one_ray = U256::from(10).pow(U256::from(27));
        assert!((ray_to_f64(one_ray) - 1.0).abs() < 1e-12);
        assert!((ray_to_f64(one_ray * 3 / 2) - 1.5).abs() < 1e-12);
    }
}

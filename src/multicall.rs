// src/multicall.rs

use ethers::types::{Address, Bytes};
use log::debug;

use crate::abi::{padded_len, AbiReader, AbiWriter, WORD};
use crate::types::{AggregationOutcome, CallDescriptor};

/// `aggregate3((address,bool,bytes)[])`
pub const AGGREGATE3_SELECTOR: [u8; 4] = [0x82, 0xad, 0x56, 0xcb];

/// Canonical aggregation-contract deployment shared by most networks.
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

/// Codec for the single-call multicall aggregation format.
///
/// Wraps N independent read calls into one `aggregate3` request against a
/// helper contract and unwraps the per-entry `(bool success, bytes)` results.
/// Encoding computes each variable-length element's offset from the
/// cumulative padded length of the preceding elements; decoding fails closed,
/// turning any malformed offset or truncated length into a failed entry
/// instead of an error for the whole batch.
///
/// Execution is the caller's concern; this module never touches the wire.
pub struct Aggregate3Codec;

impl Aggregate3Codec {
    /// Encodes calldata for one `aggregate3` request. Every entry is sent
    /// with `allowFailure = true` so a single reverting read cannot take
    /// down the batch.
    pub fn encode(calls: &[CallDescriptor]) -> Bytes {
        let mut w = AbiWriter::with_selector(AGGREGATE3_SELECTOR);
        w.push_usize(WORD); // offset to the Call3[] parameter
        w.push_usize(calls.len());

        // Element offsets are relative to the start of the array data area,
        // which begins with the offset words themselves.
        let mut element_offset = calls.len() * WORD;
        for call in calls {
            w.push_usize(element_offset);
            // address + bool + bytes-offset + bytes-length + padded payload
            element_offset += 4 * WORD + padded_len(call.call_data.len());
        }

        for call in calls {
            w.push_address(call.target);
            w.push_bool(true);
            w.push_usize(3 * WORD); // offset of `bytes` within the Call3 tuple
            w.push_usize(call.call_data.len());
            w.push_padded_bytes(&call.call_data);
        }

        let encoded = w.finish();
        debug!(
            "Encoded aggregate3 batch: {} calls, {} bytes calldata",
            calls.len(),
            encoded.len()
        );
        encoded
    }

    /// Decodes an `aggregate3` response into one outcome per expected call.
    ///
    /// Positional: outcome `i` belongs to call `i`. A malformed outer frame
    /// yields `expected` failed entries; a malformed single entry yields a
    /// failed entry in its slot only.
    pub fn decode(data: &[u8], expected: usize) -> Vec<AggregationOutcome> {
        let mut outcomes = vec![AggregationOutcome::failed(); expected];
        let reader = AbiReader::new(data);

        let array_offset = match reader.usize_at(0) {
            Ok(v) => v,
            Err(_) => return outcomes,
        };
        let length = match reader.usize_at(array_offset) {
            Ok(v) => v,
            Err(_) => return outcomes,
        };
        if length != expected {
            debug!(
                "aggregate3 response length mismatch: expected {}, got {}",
                expected, length
            );
            return outcomes;
        }

        let elements_base = array_offset + WORD;
        for (i, outcome) in outcomes.iter_mut().enumerate() {
            *outcome = Self::decode_entry(&reader, elements_base, i)
                .unwrap_or_else(AggregationOutcome::failed);
        }
        outcomes
    }

    fn decode_entry(
        reader: &AbiReader<'_>,
        elements_base: usize,
        index: usize,
    ) -> Option<AggregationOutcome> {
        let rel_offset = reader.usize_at(elements_base + index * WORD).ok()?;
        let entry_base = elements_base.checked_add(rel_offset)?;

        let success = reader.bool_at(entry_base).ok()?;
        let bytes_rel = reader.usize_at(entry_base + WORD).ok()?;
        let bytes_base = entry_base.checked_add(bytes_rel)?;
        let len = reader.usize_at(bytes_base).ok()?;
        let payload = reader.bytes_at(bytes_base + WORD, len).ok()?;

        Some(AggregationOutcome {
            success,
            return_data: payload.to_vec(),
        })
    }

    /// Encodes the `Result[]` response shape. This is the decode mirror used
    /// by scripted transports in tests; production responses come off the
    /// wire.
    pub fn encode_result(outcomes: &[AggregationOutcome]) -> Vec<u8> {
        let mut w = AbiWriter::new();
        w.push_usize(WORD);
        w.push_usize(outcomes.len());

        let mut element_offset = outcomes.len() * WORD;
        for outcome in outcomes {
            w.push_usize(element_offset);
            element_offset += 3 * WORD + padded_len(outcome.return_data.len());
        }
        for outcome in outcomes {
            w.push_bool(outcome.success);
            w.push_usize(2 * WORD);
            w.push_usize(outcome.return_data.len());
            w.push_padded_bytes(&outcome.return_data);
        }
        w.finish().to_vec()
    }
}

/// Splits descriptors into chunks no larger than `max_calls`, preserving
/// order. Providers reject oversized aggregation payloads, so callers chunk
/// and concatenate the positional outcomes.
pub fn chunk_calls(calls: &[CallDescriptor], max_calls: usize) -> Vec<&[CallDescriptor]> {
    if calls.is_empty() {
        return Vec::new();
    }
    calls.chunks(max_calls.max(1)).collect()
}

/// Parses the canonical aggregation-contract address.
pub fn default_aggregation_address() -> Address {
    MULTICALL3_ADDRESS
        .parse()
        .expect("canonical multicall address is valid")
}

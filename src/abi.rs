// src/abi.rs
//
// Bounds-checked ABI encoding/decoding primitives for contract read calls.
// Every decode either consumes exactly the expected byte ranges or fails with
// a DecodeError; the codec never guesses at missing bytes.

use ethers::types::{Address, Bytes, U256};
use thiserror::Error;

/// ABI word size in bytes.
pub const WORD: usize = 32;

/// Errors produced while decoding raw contract return data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty response data")]
    Empty,
    #[error("invalid hex in response data: {0}")]
    InvalidHex(String),
    #[error("response truncated: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("length out of range: {0}")]
    LengthOutOfRange(U256),
    #[error("malformed offset: {0}")]
    MalformedOffset(U256),
    #[error("unprintable or oversized string payload")]
    InvalidString,
}

/// Computes the 4-byte selector for a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    ethers::utils::id(signature)
}

/// Selectors for the read calls this crate issues, derived once from their
/// canonical signatures.
pub mod selectors {
    use once_cell::sync::Lazy;

    /// `0xd1946dbc`
    pub static GET_RESERVES_LIST: Lazy<[u8; 4]> = Lazy::new(|| super::selector("getReservesList()"));
    /// `0x95d89b41`
    pub static SYMBOL: Lazy<[u8; 4]> = Lazy::new(|| super::selector("symbol()"));
    /// `0xf76f8d78`, the uppercase fallback some tokens expose instead.
    pub static SYMBOL_UPPERCASE: Lazy<[u8; 4]> = Lazy::new(|| super::selector("SYMBOL()"));
    /// `0x35ea6a75`
    pub static GET_RESERVE_DATA: Lazy<[u8; 4]> =
        Lazy::new(|| super::selector("getReserveData(address)"));
}

/// Strips an optional `0x` prefix and decodes hex response data to bytes.
pub fn decode_response_hex(data: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = data.strip_prefix("0x").unwrap_or(data);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    hex::decode(trimmed).map_err(|e| DecodeError::InvalidHex(e.to_string()))
}

/// Cursor-style reader over raw return data with explicit bounds checks.
///
/// All offsets are absolute byte positions into the underlying buffer; helper
/// methods for relative offsets live on the callers, which know the ABI
/// "head" their dynamic offsets are relative to.
pub struct AbiReader<'a> {
    data: &'a [u8],
}

impl<'a> AbiReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the 32-byte word starting at `offset`.
    pub fn word_at(&self, offset: usize) -> Result<&'a [u8], DecodeError> {
        self.bytes_at(offset, WORD)
    }

    /// Returns `len` raw bytes starting at `offset`.
    pub fn bytes_at(&self, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = offset.checked_add(len).ok_or(DecodeError::MalformedOffset(U256::MAX))?;
        if end > self.data.len() {
            return Err(DecodeError::Truncated {
                offset,
                needed: len,
                available: self.data.len(),
            });
        }
        Ok(&self.data[offset..end])
    }

    pub fn u256_at(&self, offset: usize) -> Result<U256, DecodeError> {
        Ok(U256::from_big_endian(self.word_at(offset)?))
    }

    /// Reads a word expected to hold a small usize (array length, dynamic
    /// offset). Anything above `u32::MAX` is rejected as malformed rather
    /// than risking a huge allocation from garbage data.
    pub fn usize_at(&self, offset: usize) -> Result<usize, DecodeError> {
        let value = self.u256_at(offset)?;
        if value > U256::from(u32::MAX) {
            return Err(DecodeError::LengthOutOfRange(value));
        }
        Ok(value.as_usize())
    }

    /// Reads an address from the last 20 bytes of the word at `offset`.
    pub fn address_at(&self, offset: usize) -> Result<Address, DecodeError> {
        let word = self.word_at(offset)?;
        Ok(Address::from_slice(&word[12..]))
    }

    pub fn bool_at(&self, offset: usize) -> Result<bool, DecodeError> {
        Ok(!self.u256_at(offset)?.is_zero())
    }
}

/// Append-only calldata builder; the writing mirror of `AbiReader`.
#[derive(Default)]
pub struct AbiWriter {
    buf: Vec<u8>,
}

impl AbiWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Starts a calldata buffer with a 4-byte selector.
    pub fn with_selector(selector: [u8; 4]) -> Self {
        Self {
            buf: selector.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push_u256(&mut self, value: U256) {
        let mut word = [0u8; WORD];
        value.to_big_endian(&mut word);
        self.buf.extend_from_slice(&word);
    }

    pub fn push_usize(&mut self, value: usize) {
        self.push_u256(U256::from(value));
    }

    pub fn push_address(&mut self, address: Address) {
        let mut word = [0u8; WORD];
        word[12..].copy_from_slice(address.as_bytes());
        self.buf.extend_from_slice(&word);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push_u256(if value { U256::one() } else { U256::zero() });
    }

    /// Appends raw bytes right-padded with zeros to a word boundary.
    pub fn push_padded_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        let rem = bytes.len() % WORD;
        if rem != 0 {
            self.buf.extend(std::iter::repeat(0u8).take(WORD - rem));
        }
    }

    pub fn finish(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

/// Length of `n` bytes once right-padded to a word boundary.
pub fn padded_len(n: usize) -> usize {
    n.div_ceil(WORD) * WORD
}

/// Builds calldata for a zero-argument read call.
pub fn encode_no_args(selector: [u8; 4]) -> Bytes {
    AbiWriter::with_selector(selector).finish()
}

/// Builds calldata for a single-address-argument read call.
pub fn encode_address_arg(selector: [u8; 4], address: Address) -> Bytes {
    let mut w = AbiWriter::with_selector(selector);
    w.push_address(address);
    w.finish()
}

/// Decodes a dynamic address array (offset word, length word, N padded
/// addresses) exactly as returned by registry list calls.
pub fn decode_address_array(data: &[u8]) -> Result<Vec<Address>, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    let reader = AbiReader::new(data);

    let array_offset = reader.usize_at(0)?;
    let length = reader.usize_at(array_offset)?;
    if length == 0 {
        return Ok(Vec::new());
    }

    let elements_start = array_offset + WORD;
    // Validate the full extent up front so a truncated tail fails before
    // any partial list escapes.
    reader.bytes_at(elements_start, length * WORD)?;

    let mut addresses = Vec::with_capacity(length);
    for i in 0..length {
        addresses.push(reader.address_at(elements_start + i * WORD)?);
    }
    Ok(addresses)
}

/// Decodes a string return value, accepting both the standard dynamic-string
/// encoding and degenerate fixed bytes32 responses some tokens emit.
///
/// Padding and non-printable bytes are stripped; anything that does not
/// resolve to a short printable string is a decode error, not a guess.
pub fn decode_string(data: &[u8]) -> Result<String, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    // bytes32-style: a single word with the text left-aligned.
    if data.len() == WORD {
        let trimmed: Vec<u8> = data.iter().copied().take_while(|b| *b != 0).collect();
        return clean_string_bytes(&trimmed);
    }

    let reader = AbiReader::new(data);
    let string_offset = reader.usize_at(0)?;
    let length = reader.usize_at(string_offset)?;
    if length == 0 {
        return Err(DecodeError::InvalidString);
    }
    let payload = reader.bytes_at(string_offset + WORD, length)?;
    clean_string_bytes(payload)
}

const MAX_SYMBOL_LEN: usize = 30;

fn clean_string_bytes(bytes: &[u8]) -> Result<String, DecodeError> {
    let text = String::from_utf8_lossy(bytes);
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() && *c != '\u{0}')
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() || cleaned.len() > MAX_SYMBOL_LEN * 4 {
        return Err(DecodeError::InvalidString);
    }
    Ok(cleaned)
}

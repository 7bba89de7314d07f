//! Wire encodings shared by requests and results.
//!
//! Values wider than the cipher's 128-bit domain travel as several 128-bit
//! little-endian parts. Splitting and reassembling must use the same order on
//! both ends; the helpers here always put the low half first.

use thiserror::Error;

use crate::{
    constants::{NONCE_SIZE, U128_PART_SIZE},
    encryption::PlaintextElement,
};

type Result<T> = std::result::Result<T, EncodingError>;

/// Number of 128-bit parts a 256-bit value is split into
pub const U256_PARTS: usize = 2;

/// Serializes a `u128` as 16 little-endian bytes
#[must_use]
pub const fn serialize_le(value: u128) -> [u8; NONCE_SIZE] {
    value.to_le_bytes()
}

/// Reads 16 little-endian bytes as a `u128`
#[must_use]
pub const fn deserialize_le(bytes: &[u8; NONCE_SIZE]) -> u128 {
    u128::from_le_bytes(*bytes)
}

/// Splits a 32-byte value (e.g. a public key) into two 128-bit elements,
/// low half first
#[must_use]
pub fn split_u256(bytes: &[u8; 32]) -> [u128; U256_PARTS] {
    let mut parts = [0u128; U256_PARTS];
    for (part, chunk) in parts.iter_mut().zip(bytes.chunks_exact(U128_PART_SIZE)) {
        let mut le = [0u8; U128_PART_SIZE];
        le.copy_from_slice(chunk);
        *part = u128::from_le_bytes(le);
    }
    parts
}

/// Inverse of [`split_u256`]
///
/// # Errors
///
/// Returns `EncodingError::PartCountMismatch` unless exactly two parts are given
pub fn join_u256(parts: &[u128]) -> Result<[u8; 32]> {
    if parts.len() != U256_PARTS {
        return Err(EncodingError::PartCountMismatch {
            expected: U256_PARTS,
            actual: parts.len(),
        });
    }
    let mut bytes = [0u8; 32];
    for (chunk, part) in bytes.chunks_exact_mut(U128_PART_SIZE).zip(parts) {
        chunk.copy_from_slice(&part.to_le_bytes());
    }
    Ok(bytes)
}

/// Splits a 32-byte value straight into plaintext elements
#[must_use]
pub fn split_u256_elements(bytes: &[u8; 32]) -> Vec<PlaintextElement> {
    split_u256(bytes).into_iter().map(PlaintextElement::from).collect()
}

/// Reassembles decrypted elements produced from [`split_u256_elements`]
///
/// # Errors
///
/// Fails if the part count is wrong or if any element does not fit 128 bits
pub fn reassemble_u256(elements: &[PlaintextElement]) -> Result<[u8; 32]> {
    let parts = elements
        .iter()
        .map(|e| u128::try_from(*e))
        .collect::<Result<Vec<_>>>()?;
    join_u256(&parts)
}

/// Encodes a real number as a signed fixed-point field element with
/// `fractional_bits` bits after the binary point
///
/// # Errors
///
/// Returns `EncodingError::InvalidFixedPoint` for non-finite inputs, too many
/// fractional bits, or values that overflow the signed 128-bit domain
pub fn encode_fixed_point(value: f64, fractional_bits: u32) -> Result<PlaintextElement> {
    if !value.is_finite() || fractional_bits > 64 {
        return Err(EncodingError::InvalidFixedPoint { value });
    }
    let scaled = (value * 2f64.powi(fractional_bits as i32)).round();
    // i128::MAX is not representable as f64; 2^127 is the first value that overflows
    if scaled >= 2f64.powi(127) || scaled < -(2f64.powi(127)) {
        return Err(EncodingError::InvalidFixedPoint { value });
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(PlaintextElement::from(scaled as i128))
}

/// Decodes an element produced by [`encode_fixed_point`]
///
/// # Errors
///
/// Returns `EncodingError::ValueOutOfRange` if the element is not a signed
/// 128-bit value
pub fn decode_fixed_point(element: PlaintextElement, fractional_bits: u32) -> Result<f64> {
    let raw = i128::try_from(element)?;
    #[allow(clippy::cast_precision_loss)]
    Ok(raw as f64 / 2f64.powi(fractional_bits as i32))
}

#[derive(Debug, Error, PartialEq)]
pub enum EncodingError {
    #[error("Value does not fit the `{target}` domain")]
    ValueOutOfRange { target: &'static str },
    #[error("Bytes are not a canonical field element")]
    NonCanonicalElement,
    #[error("Expected {expected} parts, got {actual}")]
    PartCountMismatch { expected: usize, actual: usize },
    #[error("Cannot encode `{value}` as fixed point")]
    InvalidFixedPoint { value: f64 },
}

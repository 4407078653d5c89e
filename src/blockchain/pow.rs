//! Proof-of-work arithmetic over compact difficulty bits.

use super::block::{BlockHeader, Hash256};
use crate::error::ChainError;
use primitive_types::U256;

/// Regtest difficulty, about one hash in two meets it.
pub const REGTEST_BITS: u32 = 0x207fffff;

/// Expand compact "bits" into a 256-bit target.
///
/// Returns `None` for negative or overflowing encodings, which no valid
/// header can carry.
pub fn bits_to_target(bits: u32) -> Option<U256> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    if mantissa != 0 && bits & 0x0080_0000 != 0 {
        return None;
    }

    if exponent <= 3 {
        return Some(U256::from(mantissa >> (8 * (3 - exponent))));
    }

    let overflow = mantissa != 0
        && (exponent > 34 || (mantissa > 0xff && exponent > 33) || (mantissa > 0xffff && exponent > 32));
    if overflow {
        return None;
    }

    Some(U256::from(mantissa) << (8 * (exponent as usize - 3)))
}

/// Expected number of hashes to meet `bits`: 2^256 / (target + 1).
pub fn block_work(bits: u32) -> U256 {
    match bits_to_target(bits) {
        Some(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

/// Header hashes compare as little-endian 256-bit integers.
pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_little_endian(hash)
}

/// Context-free proof-of-work check: the target must be sane and within
/// `pow_limit`, and the header hash must not exceed it.
pub fn check_proof_of_work(header: &BlockHeader, pow_limit: U256) -> Result<(), ChainError> {
    let target = bits_to_target(header.bits).ok_or_else(|| {
        ChainError::ProtocolViolation(format!("Malformed difficulty bits {:#010x}", header.bits))
    })?;

    if target.is_zero() || target > pow_limit {
        return Err(ChainError::ProtocolViolation(format!(
            "Difficulty bits {:#010x} outside the network limit",
            header.bits
        )));
    }

    if hash_to_u256(&header.hash()) > target {
        return Err(ChainError::ProtocolViolation(
            "Header hash does not meet its difficulty target".to_string(),
        ));
    }

    Ok(())
}

pub fn work_to_bytes(work: &U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    work.to_big_endian(&mut out);
    out
}

pub fn work_from_bytes(bytes: &[u8]) -> Result<U256, ChainError> {
    if bytes.len() != 32 {
        return Err(ChainError::Integrity(format!(
            "Stored work must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(U256::from_big_endian(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_limit_target() {
        let target = bits_to_target(0x1d00ffff).unwrap();
        assert_eq!(target, U256::from(0xffffu64) << 208);
        // Difficulty-1 work is 2^32 + 2^16 + 1 (rounded), as in Bitcoin.
        assert_eq!(block_work(0x1d00ffff), U256::from(0x0001_0001_0001u64));
    }

    #[test]
    fn test_regtest_work_is_two() {
        assert_eq!(block_work(REGTEST_BITS), U256::from(2u64));
    }

    #[test]
    fn test_negative_and_overflow_bits_rejected() {
        assert!(bits_to_target(0x04923456).is_none());
        assert!(bits_to_target(0xff123456).is_none());
        assert_eq!(block_work(0x04923456), U256::zero());
    }

    #[test]
    fn test_small_exponent() {
        assert_eq!(bits_to_target(0x03123456).unwrap(), U256::from(0x123456u64));
        assert_eq!(bits_to_target(0x02123456).unwrap(), U256::from(0x1234u64));
    }

    #[test]
    fn test_work_roundtrip_bytes() {
        let work = block_work(0x1d00ffff) * U256::from(1000u64);
        assert_eq!(work_from_bytes(&work_to_bytes(&work)).unwrap(), work);
        assert!(work_from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_pow_limit_enforced() {
        let header = BlockHeader {
            version: 1,
            previous_hash: [0; 32],
            merkle_root: [0; 32],
            timestamp: 0,
            bits: REGTEST_BITS,
            nonce: 0,
        };
        let mainnet_limit = bits_to_target(0x1d00ffff).unwrap();
        let result = check_proof_of_work(&header, mainnet_limit);
        assert!(matches!(result, Err(ChainError::ProtocolViolation(_))));
    }
}

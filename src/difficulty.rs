//! Difficulty and target conversion
//!
//! A target is a 256-bit big-endian boundary rendered as `0x` plus 64 hex
//! digits. Difficulty is `2^256 / target`.

use crate::utils::decode_hex_fixed;
use crate::{Error, Result};
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

/// Fixed-point scale for fractional route difficulties
const DIFFICULTY_SCALE: u64 = 1_000;

fn two_pow_256() -> BigUint {
    BigUint::one() << 256u32
}

fn max_target() -> BigUint {
    two_pow_256() - BigUint::one()
}

/// Render a 256-bit value as a `0x`-prefixed, zero-padded hex string
pub fn format_target(value: &BigUint) -> String {
    let capped = if value > &max_target() {
        max_target()
    } else {
        value.clone()
    };
    format!("0x{:0>64}", capped.to_str_radix(16))
}

/// Parse a target as served by an upstream node
pub fn parse_target(target: &str) -> Result<BigUint> {
    let bytes = decode_hex_fixed(target, 32)
        .map_err(|e| Error::work(format!("invalid target {:?}: {}", target, e)))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// Difficulty represented by a target, saturating at `u128::MAX`
pub fn target_to_difficulty(target: &str) -> Result<u128> {
    let value = parse_target(target)?;
    if value.is_zero() {
        return Err(Error::work("zero target"));
    }
    let difficulty = two_pow_256() / value;
    Ok(difficulty.to_u128().unwrap_or(u128::MAX))
}

/// Target for a difficulty, `None` when the difficulty is not positive
pub fn difficulty_to_target(difficulty: f64) -> Option<String> {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return None;
    }
    let scaled = (difficulty * DIFFICULTY_SCALE as f64).round();
    if scaled < 1.0 {
        return None;
    }
    let divisor = BigUint::from(scaled as u128);
    let target = two_pow_256() * BigUint::from(DIFFICULTY_SCALE) / divisor;
    Some(format_target(&target))
}

/// A difficulty override taken from the connection route.
#[derive(Debug, Clone, PartialEq)]
pub struct DifficultyOverride {
    /// Share difficulty after the multiplier
    pub difficulty: u128,
    /// Matching target
    pub target: String,
}

/// Resolve a route difficulty segment.
///
/// `"0"`, an empty segment or anything unparsable means "use the block
/// template target". Positive values are scaled by `multiplier`.
pub fn resolve_override(segment: Option<&str>, multiplier: f64) -> Option<DifficultyOverride> {
    let raw: f64 = segment?.trim().parse().ok()?;
    let effective = raw * multiplier;
    let target = difficulty_to_target(effective)?;
    let difficulty = effective.round().max(1.0);
    Some(DifficultyOverride {
        difficulty: if difficulty >= u128::MAX as f64 {
            u128::MAX
        } else {
            difficulty as u128
        },
        target,
    })
}

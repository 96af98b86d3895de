//! The Init1 time-lock puzzle.
//!
//! Step 3 of the low-level handshake hands the client an RSA-style puzzle:
//! compute `y = x^(2^level) mod n` for server-chosen 512-bit `x` and `n`.
//! The repeated squaring is inherently sequential, so the server gets a
//! tunable admission cost per connecting client.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::error::CryptoError;

/// Size of the puzzle integers on the wire
pub const PUZZLE_INT_SIZE: usize = 64;

/// Largest level the client will accept; anything above is treated as a
/// hostile server trying to pin the CPU.
pub const MAX_PUZZLE_LEVEL: u32 = 1_000_000;

/// Solve the puzzle: `y = x^(2^level) mod n`, all integers 64-byte
/// big-endian.
///
/// # Errors
///
/// Returns `CryptoError::PuzzleLevelTooLarge` above [`MAX_PUZZLE_LEVEL`]
/// and `CryptoError::PuzzleModulusZero` for a zero modulus.
pub fn solve(
    x: &[u8; PUZZLE_INT_SIZE],
    n: &[u8; PUZZLE_INT_SIZE],
    level: u32,
) -> Result<[u8; PUZZLE_INT_SIZE], CryptoError> {
    if level > MAX_PUZZLE_LEVEL {
        return Err(CryptoError::PuzzleLevelTooLarge(level));
    }

    let n = BigUint::from_bytes_be(n);
    if n.is_zero() {
        return Err(CryptoError::PuzzleModulusZero);
    }

    let x = BigUint::from_bytes_be(x);
    let exponent = BigUint::one() << level;
    let y = x.modpow(&exponent, &n);

    // y < n < 2^512, so it always fits, left-padded with zeros.
    let bytes = y.to_bytes_be();
    let mut out = [0u8; PUZZLE_INT_SIZE];
    out[PUZZLE_INT_SIZE - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

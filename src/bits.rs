//! Bit-level primitives over the 16-byte instruction word.

use crate::error::SolverError;

/// Bytes in one instruction word.
pub const INST_BYTES: usize = 16;

/// Bits in one instruction word.
pub const INST_BITS: usize = INST_BYTES * 8;

/// A 128-bit instruction word, little-endian: bit `i` lives in byte `i / 8`
/// at position `i % 8`.
pub type InstWord = [u8; INST_BYTES];

/// Fields are read into a `u64`, so spans are capped at 64 bits; the range
/// construction never produces a wider field from well-formed input, but a
/// degenerate seed can, and that surfaces here instead of panicking.
fn check_span(lo: usize, hi: usize) -> Result<(), SolverError> {
    if lo > hi || hi > INST_BITS || hi - lo > 64 {
        return Err(SolverError::BitRange { lo, hi });
    }
    Ok(())
}

fn check_bit(bit: usize) -> Result<(), SolverError> {
    if bit >= INST_BITS {
        return Err(SolverError::BitRange { lo: bit, hi: bit + 1 });
    }
    Ok(())
}

/// Read the unsigned integer formed by bits `[lo, hi)` of `word`.
pub fn get_bit_range(word: &InstWord, lo: usize, hi: usize) -> Result<u64, SolverError> {
    check_span(lo, hi)?;
    let mut value = 0u64;
    for (i, bit) in (lo..hi).enumerate() {
        let b = (word[bit / 8] >> (bit % 8)) & 1;
        value |= (b as u64) << i;
    }
    Ok(value)
}

/// Write the low `hi - lo` bits of `value` into bits `[lo, hi)` of `word`,
/// leaving all other bits untouched.
pub fn set_bit_range(
    word: &mut InstWord,
    lo: usize,
    hi: usize,
    value: u64,
) -> Result<(), SolverError> {
    check_span(lo, hi)?;
    for (i, bit) in (lo..hi).enumerate() {
        let mask = 1u8 << (bit % 8);
        if (value >> i) & 1 == 1 {
            word[bit / 8] |= mask;
        } else {
            word[bit / 8] &= !mask;
        }
    }
    Ok(())
}

/// Flip a single bit of `word`.
pub fn toggle_bit(word: &mut InstWord, bit: usize) -> Result<(), SolverError> {
    check_bit(bit)?;
    word[bit / 8] ^= 1 << (bit % 8);
    Ok(())
}

/// Test a single bit of `word`.
pub fn get_bit(word: &InstWord, bit: usize) -> Result<bool, SolverError> {
    check_bit(bit)?;
    Ok((word[bit / 8] >> (bit % 8)) & 1 == 1)
}

/// Lowercase hex form of a word, the on-disk representation.
pub fn word_to_hex(word: &InstWord) -> String {
    let mut out = String::with_capacity(INST_BYTES * 2);
    for byte in word {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Parse the hex form produced by [`word_to_hex`].
pub fn word_from_hex(text: &str) -> Option<InstWord> {
    let text = text.trim();
    if text.len() != INST_BYTES * 2 {
        return None;
    }
    let mut word = [0u8; INST_BYTES];
    for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
        let chunk = std::str::from_utf8(chunk).ok()?;
        word[i] = u8::from_str_radix(chunk, 16).ok()?;
    }
    Some(word)
}

/// Serde adapter persisting an [`InstWord`] as its lowercase hex string.
pub mod hex_word {
    use super::{word_from_hex, word_to_hex, InstWord};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(word: &InstWord, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&word_to_hex(word))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<InstWord, D::Error> {
        let text = String::deserialize(deserializer)?;
        word_from_hex(&text).ok_or_else(|| serde::de::Error::custom("malformed instruction hex"))
    }
}

//! Fixed-width base62 encoding for short codes and packed tokens.
//!
//! The alphabet is `0-9a-zA-Z`. Encoding left-pads with the zero digit, so any
//! string produced for a given width decodes back to the same integer, and a
//! shorter unpadded string decodes to the same value as its padded form.

use thiserror::Error;

pub const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

const BASE: u64 = 62;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("cannot decode an empty string")]
    Empty,
    #[error("invalid base62 character {ch:?} at position {position}")]
    InvalidCharacter { ch: char, position: usize },
    #[error("base62 value does not fit in 64 bits")]
    Overflow,
}

/// Encode `n` in base62, left-padded with `'0'` to at least `width` characters.
///
/// Values that need more than `width` digits are returned unpadded and longer
/// than `width`; callers that require an exact width check against
/// [`max_for_width`] first.
pub fn encode(mut n: u64, width: usize) -> String {
    let mut digits = Vec::with_capacity(width.max(11));
    if n == 0 {
        digits.push(ALPHABET[0]);
    }
    while n > 0 {
        digits.push(ALPHABET[(n % BASE) as usize]);
        n /= BASE;
    }
    while digits.len() < width {
        digits.push(ALPHABET[0]);
    }
    digits.reverse();
    // Every byte comes from ALPHABET, which is ASCII.
    digits.into_iter().map(char::from).collect()
}

/// Decode a base62 string, most significant digit first.
///
/// Leading `'0'` characters are pad digits with value zero.
pub fn decode(s: &str) -> Result<u64, DecodeError> {
    if s.is_empty() {
        return Err(DecodeError::Empty);
    }

    s.chars().enumerate().try_fold(0u64, |acc, (position, ch)| {
        let digit = digit_value(ch).ok_or(DecodeError::InvalidCharacter { ch, position })?;
        acc.checked_mul(BASE)
            .and_then(|v| v.checked_add(digit))
            .ok_or(DecodeError::Overflow)
    })
}

/// Largest value representable in `width` base62 digits.
pub fn max_for_width(width: usize) -> u64 {
    let width = u32::try_from(width).unwrap_or(u32::MAX);
    BASE.checked_pow(width).map_or(u64::MAX, |v| v - 1)
}

/// Smallest value whose unpadded encoding is exactly `width` digits, or
/// `None` when that value does not fit in 64 bits (width 12 and up).
pub fn min_full_width(width: usize) -> Option<u64> {
    match width {
        0 | 1 => Some(0),
        w => {
            let exponent = u32::try_from(w - 1).ok()?;
            BASE.checked_pow(exponent)
        }
    }
}

fn digit_value(ch: char) -> Option<u64> {
    let d = match ch {
        '0'..='9' => ch as u64 - '0' as u64,
        'a'..='z' => ch as u64 - 'a' as u64 + 10,
        'A'..='Z' => ch as u64 - 'A' as u64 + 36,
        _ => return None,
    };
    Some(d)
}

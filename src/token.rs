//! Short-lived access tokens for protected redirects.
//!
//! A token is a `u64` packed as `expiry (32 bits) | signature (32 bits)` and
//! written in base62. The signature is the first four bytes of
//! `HMAC-SHA256(key, short_code || expiry_be)`, so a token only verifies for
//! the link it was issued for.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::OnceLock;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::codec;

/// Global HMAC key for token signing
static HMAC_KEY: OnceLock<Vec<u8>> = OnceLock::new();

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed access token")]
    Malformed,
    #[error("access token expired")]
    Expired,
    #[error("access token signature mismatch")]
    BadSignature,
}

/// Initialize the HMAC key for token signing
/// If secret is None, generates a random key (tokens won't survive restarts)
pub fn init_token_hmac_key(secret: Option<&str>) {
    let key = match secret {
        Some(s) => s.as_bytes().to_vec(),
        None => random_key(),
    };

    HMAC_KEY.get_or_init(|| key);
}

fn get_hmac_key() -> &'static [u8] {
    HMAC_KEY.get_or_init(random_key)
}

fn random_key() -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..32).map(|_| rng.random::<u8>()).collect()
}

fn signature(short_code: &str, expiry: u32) -> [u8; 4] {
    // Any key length is valid for HMAC
    let mut mac = match Hmac::<Sha256>::new_from_slice(get_hmac_key()) {
        Ok(mac) => mac,
        Err(_) => return [0; 4],
    };
    mac.update(short_code.as_bytes());
    mac.update(&expiry.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Issue a token for `short_code` valid for `ttl` from now.
pub fn issue(short_code: &str, ttl: Duration) -> String {
    let now = Utc::now().timestamp();
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let expiry = u32::try_from(now.saturating_add(ttl)).unwrap_or(u32::MAX);
    issue_with_expiry(short_code, expiry)
}

fn issue_with_expiry(short_code: &str, expiry: u32) -> String {
    let sig = u32::from_be_bytes(signature(short_code, expiry));
    let packed = (u64::from(expiry) << 32) | u64::from(sig);
    codec::encode(packed, 0)
}

/// Check that `token` was issued for `short_code` and has not expired.
pub fn verify(token: &str, short_code: &str) -> Result<(), TokenError> {
    let packed = codec::decode(token).map_err(|_| TokenError::Malformed)?;
    let expiry = (packed >> 32) as u32;
    let provided = (packed as u32).to_be_bytes();

    let expected = signature(short_code, expiry);
    if !bool::from(expected.ct_eq(&provided)) {
        return Err(TokenError::BadSignature);
    }

    if i64::from(expiry) < Utc::now().timestamp() {
        return Err(TokenError::Expired);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        init_token_hmac_key(Some("test_secret_key_for_hmac_signing"));
    }

    #[test]
    fn test_issue_and_verify() {
        init();
        let token = issue("ab12cd3", DEFAULT_TTL);
        assert_eq!(verify(&token, "ab12cd3"), Ok(()));
    }

    #[test]
    fn test_token_is_bound_to_short_code() {
        init();
        let token = issue("ab12cd3", DEFAULT_TTL);
        assert_eq!(verify(&token, "zz99yy8"), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_expired_token() {
        init();
        let past = u32::try_from(Utc::now().timestamp() - 10).unwrap();
        let token = issue_with_expiry("ab12cd3", past);
        assert_eq!(verify(&token, "ab12cd3"), Err(TokenError::Expired));
    }

    #[test]
    fn test_tampered_expiry_fails_signature() {
        init();
        let token = issue("ab12cd3", DEFAULT_TTL);
        let packed = codec::decode(&token).unwrap();
        let extended = packed + (3600u64 << 32);
        let forged = codec::encode(extended, 0);
        assert_eq!(verify(&forged, "ab12cd3"), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_malformed_token() {
        assert_eq!(verify("not-base62!", "abc"), Err(TokenError::Malformed));
        assert_eq!(verify("", "abc"), Err(TokenError::Malformed));
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Compact HMAC-signed bearer tokens for glasses and App links.
//!
//! Format: `base64url(payload_json) "." base64url(hmac_sha256)`. Verification
//! goes through `ring`, which compares tags in constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

/// Payload of a glasses token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlassesClaims {
    pub email: String,
}

/// Payload of an App token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppClaims {
    pub package_name: String,
    pub api_key: String,
}

/// Token error. Deliberately carries no detail beyond the kind; callers log
/// the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    BadSignature,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed token"),
            Self::BadSignature => f.write_str("bad token signature"),
        }
    }
}

impl std::error::Error for TokenError {}

fn key(secret: &str) -> hmac::Key {
    hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes())
}

/// Sign a claims payload into a compact token.
pub fn sign<T: Serialize>(secret: &str, claims: &T) -> Result<String, TokenError> {
    let payload = serde_json::to_vec(claims).map_err(|_| TokenError::Malformed)?;
    let tag = hmac::sign(&key(secret), &payload);
    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(tag.as_ref())
    ))
}

/// Verify a compact token and deserialize its claims.
pub fn verify<T: for<'de> Deserialize<'de>>(secret: &str, token: &str) -> Result<T, TokenError> {
    let (payload_b64, tag_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
    let tag = URL_SAFE_NO_PAD.decode(tag_b64).map_err(|_| TokenError::Malformed)?;
    hmac::verify(&key(secret), &payload, &tag).map_err(|_| TokenError::BadSignature)?;
    serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;

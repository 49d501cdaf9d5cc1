// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unverified access-token claim decoding.
//!
//! Only used to estimate refresh timing. The signature is never checked
//! here; the server stays the sole authority on token validity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use tracing::debug;

/// Claims this layer cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// Expiry, seconds since the Unix epoch.
    pub exp: Option<u64>,
    pub sub: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("token is not a three-part signed-claims token")]
    Format,
    #[error("claims segment is not base64url: {0}")]
    Base64(String),
    #[error("claims segment is not a JSON object: {0}")]
    Json(String),
}

/// Decode the payload segment of `header.payload.signature`.
pub fn decode_claims(token: &str) -> Result<TokenClaims, DecodeError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(DecodeError::Format);
    };
    if payload.is_empty() {
        return Err(DecodeError::Format);
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    let value: Value =
        serde_json::from_slice(&bytes).map_err(|e| DecodeError::Json(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::Json("expected an object".to_owned()));
    }

    // Some issuers emit fractional `exp`; truncate to whole seconds.
    let exp = value.get("exp").and_then(|v| {
        v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    });
    let sub = value.get("sub").and_then(Value::as_str).map(str::to_owned);
    Ok(TokenClaims { exp, sub })
}

/// Expiry of `token` in epoch seconds, or `None` when it cannot be determined.
pub fn expires_at(token: &str) -> Option<u64> {
    match decode_claims(token) {
        Ok(claims) => {
            if claims.exp.is_none() {
                debug!("access token carries no exp claim");
            }
            claims.exp
        }
        Err(e) => {
            debug!(err = %e, "cannot decode access token expiry");
            None
        }
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;

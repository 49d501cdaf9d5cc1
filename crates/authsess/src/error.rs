// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::Value;

/// Network-level failure reported by the [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

/// Outcome of a failed refresh, delivered identically to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    /// No refresh token is held, so there is nothing to exchange.
    #[error("no refresh token available")]
    MissingRefreshToken,
    /// The server declined the refresh token (any non-2xx status).
    #[error("refresh rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The refresh call never produced a response.
    #[error("refresh transport failure: {0}")]
    Transport(String),
    /// A 2xx response whose body is not a token pair.
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),
    /// The session was replaced or logged out while the refresh was outstanding.
    #[error("session ended during refresh")]
    SessionEnded,
    /// The refresh task ended without producing an outcome.
    #[error("refresh task aborted")]
    Aborted,
}

/// Errors surfaced by the request pipeline and session operations.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Non-2xx response. `message` is extracted from the body when possible.
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not authenticated")]
    NotAuthenticated,
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// Pull a human-readable message out of an API error body.
///
/// Checks `message`, then a string `detail`, then the first validation
/// entry's `detail[0].msg`. Anything else yields `fallback`.
pub fn extract_api_error(body: &[u8], fallback: &str) -> String {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        return if text.is_empty() { fallback.to_owned() } else { text.to_owned() };
    };

    if let Some(msg) = value.get("message").and_then(Value::as_str) {
        return msg.to_owned();
    }
    match value.get("detail") {
        Some(Value::String(detail)) => detail.clone(),
        Some(Value::Array(items)) => items
            .first()
            .and_then(|first| first.get("msg"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| fallback.to_owned()),
        _ => fallback.to_owned(),
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

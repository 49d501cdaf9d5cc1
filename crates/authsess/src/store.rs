// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential store: the single owner of the session state.
//!
//! State lives in a `watch` channel. Every setter is one `send_modify`
//! transition that also writes durable storage, so observers never see a
//! partially-updated session and storage writes are serialized with it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::storage::{Storage, ACCESS_TOKEN_KEY, CACHED_USER_KEY, REFRESH_TOKEN_KEY};

/// User profile as returned by `GET /api/v1/users/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Access/refresh pair. Always replaced together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self { access_token: access_token.into(), refresh_token: refresh_token.into() }
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Snapshot of the client session.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
    pub loading: bool,
    pub initialized: bool,
}

impl Session {
    /// A session counts as authenticated once a user profile is known.
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("user", &self.user)
            .field("loading", &self.loading)
            .field("initialized", &self.initialized)
            .finish()
    }
}

pub struct CredentialStore {
    storage: Arc<dyn Storage>,
    state: watch::Sender<Session>,
}

impl CredentialStore {
    /// New store in its pre-restore state (`loading`, not `initialized`).
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let (state, _rx) =
            watch::channel(Session { loading: true, initialized: false, ..Session::default() });
        Self { storage, state }
    }

    /// Observe every session transition.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.borrow().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.borrow().refresh_token.clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.borrow().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    /// Replace both tokens, or clear both when `tokens` is `None`.
    pub fn set_tokens(&self, tokens: Option<&TokenPair>) {
        self.state.send_modify(|session| {
            match tokens {
                Some(pair) => {
                    self.storage.set(ACCESS_TOKEN_KEY, &pair.access_token);
                    self.storage.set(REFRESH_TOKEN_KEY, &pair.refresh_token);
                    session.access_token = Some(pair.access_token.clone());
                    session.refresh_token = Some(pair.refresh_token.clone());
                }
                None => {
                    self.storage.remove(ACCESS_TOKEN_KEY);
                    self.storage.remove(REFRESH_TOKEN_KEY);
                    session.access_token = None;
                    session.refresh_token = None;
                }
            }
        });
        debug!(present = tokens.is_some(), "session tokens updated");
    }

    /// Swap in a refreshed pair only if the held refresh token is still
    /// `expected`. Returns whether the swap happened.
    pub fn rotate_tokens(&self, expected: &str, tokens: &TokenPair) -> bool {
        self.state.send_if_modified(|session| {
            if session.refresh_token.as_deref() != Some(expected) {
                return false;
            }
            self.storage.set(ACCESS_TOKEN_KEY, &tokens.access_token);
            self.storage.set(REFRESH_TOKEN_KEY, &tokens.refresh_token);
            session.access_token = Some(tokens.access_token.clone());
            session.refresh_token = Some(tokens.refresh_token.clone());
            true
        })
    }

    /// Cache (or clear) the user profile. Always ends `loading`.
    pub fn set_user(&self, user: Option<User>) {
        self.state.send_modify(|session| {
            self.write_cached_user(user.as_ref());
            session.user = user;
            session.loading = false;
        });
    }

    pub fn set_loading(&self, loading: bool) {
        self.state.send_modify(|session| session.loading = loading);
    }

    /// Establish a full session in one transition.
    pub fn login(&self, user: User, tokens: &TokenPair) {
        let email = user.email.clone();
        self.state.send_modify(|session| {
            self.storage.set(ACCESS_TOKEN_KEY, &tokens.access_token);
            self.storage.set(REFRESH_TOKEN_KEY, &tokens.refresh_token);
            self.write_cached_user(Some(&user));
            *session = Session {
                access_token: Some(tokens.access_token.clone()),
                refresh_token: Some(tokens.refresh_token.clone()),
                user: Some(user),
                loading: false,
                initialized: true,
            };
        });
        info!(user = %email, "session established");
    }

    /// Drop every credential from memory and storage in one transition.
    pub fn logout(&self) {
        self.state.send_modify(|session| {
            self.storage.remove(ACCESS_TOKEN_KEY);
            self.storage.remove(REFRESH_TOKEN_KEY);
            self.storage.remove(CACHED_USER_KEY);
            *session = Session { initialized: true, ..Session::default() };
        });
        info!("session cleared");
    }

    /// Logout, but only if the held refresh token is still `expected`.
    /// Returns whether the session was cleared.
    pub fn clear_if(&self, expected: Option<&str>) -> bool {
        let cleared = self.state.send_if_modified(|session| {
            if session.refresh_token.as_deref() != expected {
                return false;
            }
            self.storage.remove(ACCESS_TOKEN_KEY);
            self.storage.remove(REFRESH_TOKEN_KEY);
            self.storage.remove(CACHED_USER_KEY);
            *session = Session { initialized: true, ..Session::default() };
            true
        });
        if cleared {
            info!("session cleared");
        }
        cleared
    }

    /// Load persisted credentials into memory. Returns the restored access token.
    ///
    /// `loading` stays set when a token survived but the cached profile did
    /// not; the caller must fetch the profile.
    pub fn restore(&self) -> Option<String> {
        let mut restored = None;
        self.state.send_modify(|session| {
            let access_token = self.storage.get(ACCESS_TOKEN_KEY);
            let refresh_token = self.storage.get(REFRESH_TOKEN_KEY);
            let user = self.storage.get(CACHED_USER_KEY).and_then(|raw| {
                match serde_json::from_str::<User>(&raw) {
                    Ok(user) => Some(user),
                    Err(e) => {
                        warn!("discarding unreadable cached user: {e}");
                        self.storage.remove(CACHED_USER_KEY);
                        None
                    }
                }
            });
            let loading = access_token.is_some() && user.is_none();
            restored = access_token.clone();
            *session = Session { access_token, refresh_token, user, loading, initialized: true };
        });
        debug!(restored = restored.is_some(), "session restored from storage");
        restored
    }

    fn write_cached_user(&self, user: Option<&User>) {
        match user.map(serde_json::to_string) {
            Some(Ok(json)) => self.storage.set(CACHED_USER_KEY, &json),
            Some(Err(e)) => warn!("failed to serialize user profile: {e}"),
            None => self.storage.remove(CACHED_USER_KEY),
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

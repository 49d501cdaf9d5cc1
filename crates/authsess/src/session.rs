// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session facade wiring store, scheduler, coordinator and pipeline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::coordinator::{Navigator, RefreshCoordinator};
use crate::error::ApiError;
use crate::pipeline::{ApiClient, LOGIN_PATH, REGISTER_PATH};
use crate::scheduler::TokenScheduler;
use crate::storage::Storage;
use crate::store::{CredentialStore, Session, TokenPair, User};
use crate::transport::{ApiRequest, Transport};

pub const LOGOUT_PATH: &str = "/api/v1/auth/logout";
pub const LOGOUT_ALL_PATH: &str = "/api/v1/auth/logout-all";
pub const PROFILE_PATH: &str = "/api/v1/users/me";

/// Registration payload for `POST /api/v1/auth/register`.
#[derive(Debug, Clone, Serialize)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// Success body of `POST /api/v1/auth/login`.
#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// One client session against the API.
pub struct AuthSession {
    client: ApiClient,
}

impl AuthSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        navigator: Arc<dyn Navigator>,
        lead_time: Duration,
    ) -> Self {
        let store = Arc::new(CredentialStore::new(storage));
        let coordinator = RefreshCoordinator::new(
            store,
            TokenScheduler::new(lead_time),
            Arc::clone(&transport),
            navigator,
        );
        Self { client: ApiClient::new(coordinator, transport) }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.client.store()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        self.client.coordinator()
    }

    /// Restore persisted credentials, arm the refresh timer, and load the
    /// profile when only the tokens survived.
    pub async fn start(&self) -> Session {
        if let Some(token) = self.store().restore() {
            let armed = self.coordinator().schedule(&token);
            debug!(?armed, "restored session");
        }
        if self.store().is_loading() {
            if let Err(e) = self.refresh_profile().await {
                warn!(err = %e, "could not load user profile");
                self.store().set_user(None);
            }
        }
        self.store().snapshot()
    }

    /// Password login. On success the session is fully established and the
    /// refresh timer armed.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
        let request =
            ApiRequest::post(LOGIN_PATH).form(&[("username", email), ("password", password)]);
        let body: LoginResponse = self.client.execute(request).await?.json()?;
        let tokens = TokenPair::new(body.access_token, body.refresh_token);
        debug!(expires_in = ?body.expires_in, "login accepted");

        // The profile call goes through the pipeline and needs the bearer.
        self.store().set_tokens(Some(&tokens));
        let user = match self.client.get_json::<User>(PROFILE_PATH).await {
            Ok(user) => user,
            Err(e) => {
                warn!(err = %e, "login profile fetch failed, discarding tokens");
                self.teardown();
                return Err(e);
            }
        };

        // A refresh during the profile fetch may have rotated the pair.
        let tokens = match (self.store().access_token(), self.store().refresh_token()) {
            (Some(access), Some(refresh)) => TokenPair::new(access, refresh),
            _ => tokens,
        };
        self.store().login(user.clone(), &tokens);
        self.arm(&tokens.access_token);
        Ok(user)
    }

    /// Create an account. Does not log in.
    pub async fn register(&self, new_user: &NewUser) -> Result<User, ApiError> {
        let request = ApiRequest::post(REGISTER_PATH).json(serde_json::to_value(new_user)?);
        let user: User = self.client.execute(request).await?.json()?;
        info!(user = %user.email, "account registered");
        Ok(user)
    }

    /// Revoke the refresh token server-side (best effort) and clear the session.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.store().refresh_token() {
            let request = ApiRequest::post(LOGOUT_PATH).json(json!({ "refresh_token": refresh_token }));
            if let Err(e) = self.client.execute(request).await {
                warn!(err = %e, "server logout failed, clearing local session anyway");
            }
        }
        self.teardown();
    }

    /// Revoke every session of this user, then clear the local one.
    pub async fn logout_all(&self) -> Result<(), ApiError> {
        let result = self.client.execute(ApiRequest::post(LOGOUT_ALL_PATH)).await.map(|_| ());
        if let Err(e) = &result {
            warn!(err = %e, "logout from all devices failed");
        }
        self.teardown();
        result
    }

    /// Fetch `/users/me` and cache it.
    pub async fn refresh_profile(&self) -> Result<User, ApiError> {
        let user: User = self.client.get_json(PROFILE_PATH).await?;
        self.store().set_user(Some(user.clone()));
        Ok(user)
    }

    /// Guard for operations that need a signed-in session.
    pub fn require_session(&self) -> Result<Session, ApiError> {
        let session = self.store().snapshot();
        if session.access_token.is_none() {
            return Err(ApiError::NotAuthenticated);
        }
        Ok(session)
    }

    /// Stop the refresh timer without touching credentials.
    pub fn shutdown(&self) {
        self.coordinator().scheduler().disarm();
    }

    fn arm(&self, access_token: &str) {
        let armed = self.coordinator().schedule(access_token);
        debug!(?armed, "refresh timer after login");
    }

    fn teardown(&self) {
        self.coordinator().scheduler().disarm();
        self.store().logout();
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

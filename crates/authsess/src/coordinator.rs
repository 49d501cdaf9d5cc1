// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight access-token refresh.
//!
//! While a refresh is outstanding every caller awaits the same shared
//! future, so N concurrent callers cost exactly one network call and all of
//! them observe the same outcome. The exchange runs in its own task so a
//! caller that gives up cannot cancel the refresh for the others.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{extract_api_error, RefreshFailure};
use crate::scheduler::{ArmOutcome, TokenScheduler};
use crate::store::{CredentialStore, TokenPair};
use crate::transport::{ApiRequest, Transport};

pub const REFRESH_PATH: &str = "/api/v1/auth/refresh";

/// The "navigate to login" side effect.
pub trait Navigator: Send + Sync {
    fn navigate_to_login(&self) -> BoxFuture<'_, ()>;
}

/// Navigator for headless use: tells the operator to log in again.
#[derive(Debug, Default)]
pub struct LoginPrompt;

impl Navigator for LoginPrompt {
    fn navigate_to_login(&self) -> BoxFuture<'_, ()> {
        async {
            warn!("session ended; run `authsess login` to sign in again");
        }
        .boxed()
    }
}

/// Allows one login navigation at a time.
#[derive(Debug, Clone, Default)]
pub struct RedirectGuard {
    in_progress: Arc<AtomicBool>,
}

/// Held while a navigation runs; releases the guard on drop.
#[derive(Debug)]
pub struct RedirectPermit {
    in_progress: Arc<AtomicBool>,
}

impl RedirectGuard {
    pub fn try_acquire(&self) -> Option<RedirectPermit> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RedirectPermit { in_progress: Arc::clone(&self.in_progress) })
    }

    pub fn is_redirecting(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

impl Drop for RedirectPermit {
    fn drop(&mut self) {
        self.in_progress.store(false, Ordering::Release);
    }
}

type RefreshOutcome = Result<String, RefreshFailure>;
type RefreshOperation = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Success body of `POST /api/v1/auth/refresh`.
#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    scheduler: TokenScheduler,
    transport: Arc<dyn Transport>,
    navigator: Arc<dyn Navigator>,
    inflight: Mutex<Option<RefreshOperation>>,
    redirect: RedirectGuard,
    refresh_calls: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        scheduler: TokenScheduler,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            transport,
            navigator,
            inflight: Mutex::new(None),
            redirect: RedirectGuard::default(),
            refresh_calls: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &TokenScheduler {
        &self.scheduler
    }

    pub fn is_refreshing(&self) -> bool {
        self.inflight.lock().is_some()
    }

    pub fn is_redirecting(&self) -> bool {
        self.redirect.is_redirecting()
    }

    /// Number of refresh network calls issued so far.
    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::Relaxed)
    }

    /// Obtain a freshly refreshed access token, joining any refresh in flight.
    ///
    /// Failures are final: the session has been torn down and a login
    /// navigation scheduled.
    pub async fn ensure_fresh_token(self: &Arc<Self>) -> Result<String, RefreshFailure> {
        let operation = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(operation) => {
                    debug!("refresh in flight, joining");
                    operation.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let task = tokio::spawn(async move { this.run_refresh().await });
                    let operation = async move { task.await.unwrap_or(Err(RefreshFailure::Aborted)) }
                        .boxed()
                        .shared();
                    *slot = Some(operation.clone());
                    operation
                }
            }
        };
        operation.await
    }

    /// Arm the proactive timer for `access_token`; firing runs the refresh path.
    pub fn schedule(self: &Arc<Self>, access_token: &str) -> ArmOutcome {
        let this = Arc::clone(self);
        self.scheduler.arm(access_token, async move {
            if let Err(e) = this.ensure_fresh_token().await {
                debug!(err = %e, "proactive refresh failed");
            }
        })
    }

    async fn run_refresh(self: Arc<Self>) -> RefreshOutcome {
        let sent = self.store.refresh_token();
        let mut outcome = match &sent {
            None => Err(RefreshFailure::MissingRefreshToken),
            Some(sent) => match self.exchange(sent).await {
                // A logout or new login that raced the exchange wins.
                Ok(pair) if !self.store.rotate_tokens(sent, &pair) => {
                    Err(RefreshFailure::SessionEnded)
                }
                other => other,
            },
        };
        let superseded = match &outcome {
            Ok(pair) => {
                let armed = self.schedule(&pair.access_token);
                info!(?armed, "access token refreshed");
                false
            }
            Err(RefreshFailure::SessionEnded) => {
                debug!("session changed while refreshing, discarding new tokens");
                false
            }
            // Only tear down the session this refresh was started for.
            Err(e) if self.store.clear_if(sent.as_deref()) => {
                warn!(err = %e, "token refresh failed, session ended");
                self.scheduler.disarm();
                false
            }
            Err(e) => {
                debug!(err = %e, "refresh failed for a replaced session, keeping current one");
                true
            }
        };
        if superseded {
            outcome = Err(RefreshFailure::SessionEnded);
        }

        // Destroy the operation before waiters see the outcome so a waiter's
        // own retry starts a new refresh instead of rejoining this one.
        self.inflight.lock().take();

        if matches!(outcome, Err(ref e) if *e != RefreshFailure::SessionEnded) {
            self.redirect_to_login();
        }
        outcome.map(|pair| pair.access_token)
    }

    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshFailure> {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
        let request = ApiRequest::post(REFRESH_PATH).json(json!({ "refresh_token": refresh_token }));
        let resp = self
            .transport
            .send(request)
            .await
            .map_err(|e| RefreshFailure::Transport(e.0))?;

        if !resp.is_success() {
            return Err(RefreshFailure::Rejected {
                status: resp.status.as_u16(),
                message: extract_api_error(&resp.body, "refresh token rejected"),
            });
        }

        let body: RefreshResponse =
            resp.json().map_err(|e| RefreshFailure::InvalidResponse(e.to_string()))?;
        Ok(TokenPair::new(body.access_token, body.refresh_token))
    }

    fn redirect_to_login(self: &Arc<Self>) {
        let Some(permit) = self.redirect.try_acquire() else {
            debug!("login navigation already in progress, skipping");
            return;
        };
        let navigator = Arc::clone(&self.navigator);
        tokio::spawn(async move {
            navigator.navigate_to_login().await;
            drop(permit);
        });
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proactive refresh timer.
//!
//! At most one timer is live. `arm` always disarms first, and a timer only
//! fires if it is still the live one when its sleep completes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::token;

/// Default safety margin between the refresh and the token's expiry.
pub const DEFAULT_LEAD_TIME: Duration = Duration::from_secs(120);

/// What `arm` decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// Expiry unknown; only reactive refresh-on-401 applies.
    Idle,
    Armed { fire_in: Duration },
    /// Already inside the lead window; the refresh runs without delay
    /// unless disarmed first.
    FiredImmediately,
}

struct ScheduledRefresh {
    id: u64,
    fire_at: Instant,
    cancel: CancellationToken,
}

pub struct TokenScheduler {
    lead_time: Duration,
    slot: Arc<Mutex<Option<ScheduledRefresh>>>,
    next_id: AtomicU64,
}

impl TokenScheduler {
    pub fn new(lead_time: Duration) -> Self {
        Self { lead_time, slot: Arc::new(Mutex::new(None)), next_id: AtomicU64::new(1) }
    }

    pub fn lead_time(&self) -> Duration {
        self.lead_time
    }

    /// Schedule `on_fire` to run `lead_time` before the token expires.
    ///
    /// Must be called within a Tokio runtime.
    pub fn arm<F>(&self, access_token: &str, on_fire: F) -> ArmOutcome
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.disarm();

        let Some(expires_at) = token::expires_at(access_token) else {
            return ArmOutcome::Idle;
        };

        // Inside the lead window the timer still goes through the slot with a
        // zero delay, so a disarm before it runs cancels it.
        let delay = refresh_delay(expires_at, epoch_ms(), self.lead_time);
        let fire_in = delay.unwrap_or(Duration::ZERO);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let fire_at = Instant::now() + fire_in;
        {
            let mut slot = self.slot.lock();
            *slot = Some(ScheduledRefresh { id, fire_at, cancel: cancel.clone() });
        }

        let slot = Arc::clone(&self.slot);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(fire_at) => {}
                _ = cancel.cancelled() => return,
            }
            // Claim the slot; a concurrent disarm or re-arm wins if it got here first.
            {
                let mut slot = slot.lock();
                if slot.as_ref().map(|s| s.id) != Some(id) {
                    return;
                }
                *slot = None;
            }
            debug!(timer = id, "proactive refresh timer fired");
            on_fire.await;
        });

        if delay.is_none() {
            debug!(timer = id, expires_at, "token inside refresh window, refreshing now");
            return ArmOutcome::FiredImmediately;
        }
        debug!(timer = id, fire_in_secs = fire_in.as_secs(), "proactive refresh armed");
        ArmOutcome::Armed { fire_in }
    }

    /// Cancel the pending timer, if any. Idempotent.
    pub fn disarm(&self) {
        if let Some(previous) = self.slot.lock().take() {
            previous.cancel.cancel();
            debug!(timer = previous.id, "proactive refresh disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Time left until the live timer fires.
    pub fn time_until_fire(&self) -> Option<Duration> {
        self.slot.lock().as_ref().map(|s| s.fire_at.saturating_duration_since(Instant::now()))
    }
}

impl Drop for TokenScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Delay until a refresh should start, or `None` to refresh immediately.
pub fn refresh_delay(expires_at_secs: u64, now_ms: u64, lead_time: Duration) -> Option<Duration> {
    let fire_at_ms =
        expires_at_secs.saturating_mul(1000).saturating_sub(lead_time.as_millis() as u64);
    if fire_at_ms <= now_ms {
        None
    } else {
        Some(Duration::from_millis(fire_at_ms - now_ms))
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;

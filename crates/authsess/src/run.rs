// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command runner shared by `main` and integration tests.

use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Command, LogFormat, SessionConfig};
use crate::coordinator::LoginPrompt;
use crate::scheduler::epoch_ms;
use crate::session::{AuthSession, NewUser};
use crate::storage::{FileStorage, MemoryStorage, Storage};
use crate::store::User;
use crate::token;
use crate::transport::{ApiRequest, HttpTransport};

/// Initialize tracing/logging from config. Logs go to stderr.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &SessionConfig) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.log_format() {
        Ok(LogFormat::Json) => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().try_init()
        }
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
    };
    drop(result);
}

/// Production session stack: HTTP transport, file (or memory) storage and
/// the login prompt navigator.
pub fn build_session(config: &SessionConfig) -> AuthSession {
    let transport = Arc::new(HttpTransport::new(&config.api_url, config.request_timeout()));
    let storage: Arc<dyn Storage> = if config.ephemeral {
        Arc::new(MemoryStorage::new())
    } else {
        Arc::new(FileStorage::open(config.session_file()))
    };
    AuthSession::new(transport, storage, Arc::new(LoginPrompt), config.refresh_lead_time())
}

/// Run one CLI invocation until it completes (or Ctrl-C for `keepalive`).
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let session = build_session(&cli.config);
    let shutdown = CancellationToken::new();
    let sd = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            sd.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let result = execute(&session, cli.command, &mut stdout, shutdown).await;
    session.shutdown();
    result
}

/// Session snapshot printed by `authsess status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub authenticated: bool,
    pub user: Option<User>,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    /// Expiry of the access token (seconds since epoch), when decodable.
    pub access_expires_at: Option<u64>,
    pub access_expires_in_secs: Option<i64>,
    pub refresh_scheduled_in_secs: Option<u64>,
}

impl StatusReport {
    pub fn collect(session: &AuthSession) -> Self {
        let snapshot = session.store().snapshot();
        let access_expires_at = snapshot.access_token.as_deref().and_then(token::expires_at);
        let now_secs = (epoch_ms() / 1000) as i64;
        Self {
            authenticated: snapshot.is_authenticated(),
            has_access_token: snapshot.access_token.is_some(),
            has_refresh_token: snapshot.refresh_token.is_some(),
            access_expires_at,
            access_expires_in_secs: access_expires_at.map(|exp| exp as i64 - now_secs),
            refresh_scheduled_in_secs: session
                .coordinator()
                .scheduler()
                .time_until_fire()
                .map(|d| d.as_secs()),
            user: snapshot.user,
        }
    }
}

/// Execute `command` against `session`, writing user-facing output to `out`.
pub async fn execute<W: Write>(
    session: &AuthSession,
    command: Command,
    out: &mut W,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::Login { email, password } => {
            let user = session.login(&email, &password).await?;
            writeln!(out, "signed in as {}", user.email)?;
        }
        Command::Register { email, password, full_name } => {
            let user = session.register(&NewUser { email, password, full_name }).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&user)?)?;
        }
        Command::Logout { all } => {
            session.start().await;
            if all {
                session.logout_all().await?;
            } else {
                session.logout().await;
            }
            writeln!(out, "signed out")?;
        }
        Command::Whoami => {
            session.start().await;
            session.require_session()?;
            let user = session.refresh_profile().await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&user)?)?;
        }
        Command::Status => {
            session.start().await;
            let report = StatusReport::collect(session);
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        }
        Command::Request { method, path, data } => {
            session.start().await;
            let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())?;
            let mut request = ApiRequest::new(method, path);
            if let Some(data) = data {
                request = request.json(serde_json::from_str(&data)?);
            }
            let resp = session.client().send(request).await?;
            match serde_json::from_slice::<serde_json::Value>(&resp.body) {
                Ok(json) => writeln!(out, "{}", serde_json::to_string_pretty(&json)?)?,
                Err(_) => writeln!(out, "{}", String::from_utf8_lossy(&resp.body))?,
            }
            if !resp.is_success() {
                anyhow::bail!("request failed (HTTP {})", resp.status.as_u16());
            }
        }
        Command::Keepalive => {
            session.start().await;
            session.require_session()?;
            writeln!(out, "keeping session alive, Ctrl-C to stop")?;
            keepalive(session, shutdown).await?;
        }
    }
    Ok(())
}

/// Hold the session open so the scheduler keeps refreshing it.
async fn keepalive(session: &AuthSession, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut rx = session.store().subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("keepalive stopped");
                return Ok(());
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let ended = rx.borrow_and_update().access_token.is_none();
                if ended {
                    anyhow::bail!("session ended; run `authsess login` to sign in again");
                }
                debug!(
                    next_refresh = ?session.coordinator().scheduler().time_until_fire(),
                    "session updated"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Log output format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("invalid log format: {other}"),
        }
    }
}

/// Client session manager for the todo API.
#[derive(Debug, Parser)]
#[command(name = "authsess", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub config: SessionConfig,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone, clap::Args)]
pub struct SessionConfig {
    /// Base URL of the API.
    #[arg(long, global = true, env = "AUTHSESS_API_URL", default_value = "http://127.0.0.1:8000")]
    pub api_url: String,

    /// Directory holding the persisted session.
    #[arg(long, global = true, env = "AUTHSESS_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Seconds before token expiry at which the proactive refresh runs.
    #[arg(long, global = true, env = "AUTHSESS_REFRESH_LEAD_SECS", default_value_t = 120)]
    pub refresh_lead_secs: u64,

    /// Per-request timeout in milliseconds.
    #[arg(long, global = true, env = "AUTHSESS_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Keep the session in memory only.
    #[arg(long, global = true, env = "AUTHSESS_EPHEMERAL")]
    pub ephemeral: bool,

    /// Log format (text or json).
    #[arg(long, global = true, env = "AUTHSESS_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "AUTHSESS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Sign in with email and password.
    Login {
        #[arg(long, env = "AUTHSESS_EMAIL")]
        email: String,
        #[arg(long, env = "AUTHSESS_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account. Does not sign in.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "AUTHSESS_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        full_name: Option<String>,
    },
    /// Sign out and forget the stored session.
    Logout {
        /// Revoke every session of this account, not just this one.
        #[arg(long)]
        all: bool,
    },
    /// Print the signed-in user's profile.
    Whoami,
    /// Print the session state as JSON.
    Status,
    /// Send one request through the authenticated pipeline.
    Request {
        method: String,
        path: String,
        /// JSON request body.
        #[arg(long)]
        data: Option<String>,
    },
    /// Stay running and keep the session fresh until Ctrl-C.
    Keepalive,
}

impl Cli {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.config.validate()?;
        if let Command::Request { method, path, data } = &self.command {
            reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| anyhow::anyhow!("invalid HTTP method: {method}"))?;
            if !path.starts_with('/') {
                anyhow::bail!("request path must start with '/': {path}");
            }
            if let Some(data) = data {
                serde_json::from_str::<serde_json::Value>(data)
                    .map_err(|e| anyhow::anyhow!("--data is not valid JSON: {e}"))?;
            }
        }
        Ok(())
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = self.api_url.trim();
        if url.is_empty() {
            anyhow::bail!("--api-url must not be empty");
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("--api-url must be an http(s) URL: {url}");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("--request-timeout-ms must be greater than zero");
        }
        self.log_format()?;
        Ok(())
    }

    pub fn log_format(&self) -> anyhow::Result<LogFormat> {
        self.log_format.parse()
    }

    pub fn refresh_lead_time(&self) -> Duration {
        Duration::from_secs(self.refresh_lead_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `--state-dir`, else the XDG state location.
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => default_state_dir(
                std::env::var_os("XDG_STATE_HOME"),
                std::env::var_os("HOME"),
            ),
        }
    }

    pub fn session_file(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    /// Build a config for tests pointed at `api_url`.
    #[doc(hidden)]
    pub fn test(api_url: &str, state_dir: &Path) -> Self {
        Self {
            api_url: api_url.to_owned(),
            state_dir: Some(state_dir.to_path_buf()),
            refresh_lead_secs: 120,
            request_timeout_ms: 5_000,
            ephemeral: false,
            log_format: "text".into(),
            log_level: "debug".into(),
        }
    }
}

/// `$XDG_STATE_HOME/authsess`, then `$HOME/.local/state/authsess`, then `.authsess`.
pub fn default_state_dir(xdg_state_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    if let Some(xdg) = xdg_state_home.filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("authsess");
    }
    if let Some(home) = home.filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local/state/authsess");
    }
    PathBuf::from(".authsess")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

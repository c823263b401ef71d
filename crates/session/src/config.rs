// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Connection settings for the dashboard backend.
#[derive(Debug, Clone, clap::Args)]
pub struct SessionConfig {
    /// Base URL of the REST API (paths like `/auth/login` are appended).
    #[arg(long, default_value = "http://localhost:8000/api", env = "SWITCHBOARD_API_URL")]
    pub api_url: String,

    /// WebSocket URL of the session push channel. Push logout is disabled if unset.
    #[arg(long, env = "SWITCHBOARD_PUSH_URL")]
    pub push_url: Option<String>,

    /// Header sent on every request to get past the development tunnel.
    #[arg(long, default_value = "ngrok-skip-browser-warning", env = "SWITCHBOARD_BYPASS_HEADER")]
    pub bypass_header: String,

    /// Value of the tunnel-bypass header.
    #[arg(long, default_value = "true", env = "SWITCHBOARD_BYPASS_VALUE")]
    pub bypass_value: String,

    /// Overall timeout for ordinary requests, in milliseconds.
    #[arg(long, default_value_t = 30000, env = "SWITCHBOARD_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Timeout for the automatic token refresh, in milliseconds.
    #[arg(long, default_value_t = 10000, env = "SWITCHBOARD_REFRESH_TIMEOUT_MS")]
    pub refresh_timeout_ms: u64,

    /// Reconnect the push channel with backoff after it drops.
    #[arg(long, env = "SWITCHBOARD_PUSH_RECONNECT")]
    pub push_reconnect: bool,

    /// Initial push reconnect backoff in milliseconds.
    #[arg(long, default_value_t = 500, env = "SWITCHBOARD_PUSH_RECONNECT_INITIAL_MS")]
    pub push_reconnect_initial_ms: u64,

    /// Maximum push reconnect backoff in milliseconds.
    #[arg(long, default_value_t = 30000, env = "SWITCHBOARD_PUSH_RECONNECT_MAX_MS")]
    pub push_reconnect_max_ms: u64,

    /// Directory holding persisted credentials.
    #[arg(long, env = "SWITCHBOARD_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api".into(),
            push_url: None,
            bypass_header: "ngrok-skip-browser-warning".into(),
            bypass_value: "true".into(),
            request_timeout_ms: 30000,
            refresh_timeout_ms: 10000,
            push_reconnect: false,
            push_reconnect_initial_ms: 500,
            push_reconnect_max_ms: 30000,
            state_dir: None,
        }
    }
}

/// What the push listener does after its channel drops without a logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Stay disconnected until the access token changes.
    Never,
    /// Reconnect with exponential backoff.
    Backoff { initial: Duration, max: Duration },
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        if !self.push_reconnect {
            return ReconnectPolicy::Never;
        }
        let initial = Duration::from_millis(self.push_reconnect_initial_ms.max(1));
        let max = Duration::from_millis(self.push_reconnect_max_ms).max(initial);
        ReconnectPolicy::Backoff { initial, max }
    }

    /// Resolve the state directory.
    ///
    /// Checks `--state-dir`/`SWITCHBOARD_STATE_DIR`, then
    /// `$XDG_STATE_HOME/switchboard`, then `$HOME/.local/state/switchboard`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            return PathBuf::from(xdg).join("switchboard");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/state/switchboard");
        }
        PathBuf::from(".switchboard")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.state_dir().join("credentials.json")
    }
}

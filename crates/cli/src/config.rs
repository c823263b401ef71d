// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::{Parser, Subcommand};

use switchboard::SessionConfig;

/// Dashboard session client: sign in, call the API, watch for remote logout.
#[derive(Debug, Parser)]
#[command(name = "switchboard", version, about)]
pub struct Config {
    #[command(flatten)]
    pub session: SessionConfig,

    /// Log format (json or text).
    #[arg(long, env = "SWITCHBOARD_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in and persist the session
    Login {
        #[arg(long, env = "SWITCHBOARD_EMAIL")]
        email: String,
        #[arg(long, env = "SWITCHBOARD_PASSWORD", hide_env_values = true)]
        password: String,
        /// One-time code, if the account has two-factor enabled
        #[arg(long)]
        otp: Option<String>,
    },
    /// Create an account and sign in
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long, env = "SWITCHBOARD_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Show the signed-in user
    Whoami,
    /// Rotate the stored token pair
    Refresh,
    /// Log out this device
    Logout,
    /// Log out every device of this user
    LogoutAll,
    /// List active device sessions
    Sessions,
    /// Revoke one device session
    Revoke { session_id: String },
    /// Set a new password using a reset token
    ResetPassword {
        #[arg(long)]
        token: String,
        #[arg(long, hide_env_values = true)]
        new_password: String,
    },
    /// Request a password reset email
    ForgotPassword {
        #[arg(long)]
        email: String,
    },
    /// Confirm an email address
    VerifyEmail {
        #[arg(long)]
        token: String,
    },
    /// Update profile fields
    Profile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Show, select or clear the active workspace
    Workspace {
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        clear: bool,
    },
    /// GET an API path with the stored session
    Get {
        path: String,
        /// Nest the path under the active workspace
        #[arg(long)]
        scoped: bool,
    },
    /// Hold the push channel open until the session ends
    Watch,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let api = &self.session.api_url;
        if !(api.starts_with("http://") || api.starts_with("https://")) {
            anyhow::bail!("--api-url must be an http(s) URL, got {api}");
        }
        if let Some(ref push) = self.session.push_url {
            let known = ["http://", "https://", "ws://", "wss://"];
            if !known.iter().any(|scheme| push.starts_with(scheme)) {
                anyhow::bail!("--push-url must be an http(s) or ws(s) URL, got {push}");
            }
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("--log-format must be json or text");
        }
        if self.session.refresh_timeout_ms == 0 {
            anyhow::bail!("--refresh-timeout-ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

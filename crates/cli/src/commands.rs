// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `switchboard` subcommands.

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use switchboard::types::{DeviceSession, ProfileUpdate, User};
use switchboard::{RequestOptions, SessionEvent, SessionRuntime};

use crate::config::{Command, Config};

/// Run one subcommand and return the process exit code.
pub async fn run(config: Config) -> i32 {
    let runtime = match SessionRuntime::with_file_storage(config.session) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: {e:#}");
            return 1;
        }
    };
    debug!(state = %runtime.config.credentials_path().display(), "session runtime ready");

    match execute(&runtime, config.command).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    }
}

async fn execute(rt: &SessionRuntime, command: Command) -> anyhow::Result<()> {
    let controller = &rt.controller;
    match command {
        Command::Login { email, password, otp } => {
            let resp = controller.login(&email, &password, otp.as_deref()).await?;
            println!("Logged in as {}", format_user(&resp.user));
        }

        Command::Register { email, name, password } => {
            let resp = controller.register(&email, &name, &password).await?;
            println!("Registered {}", format_user(&resp.user));
            if let Some(token) = resp.verification_token {
                println!("Verification token: {token}");
            }
        }

        Command::Whoami => {
            let user = controller.me().await?;
            println!("{}", format_user(&user));
        }

        Command::Refresh => {
            let refresh_token = require_refresh_token(rt)?;
            controller.refresh(&refresh_token).await?;
            println!("Tokens refreshed");
        }

        Command::Logout => {
            let refresh_token = require_refresh_token(rt)?;
            let resp = controller.logout(&refresh_token).await?;
            println!("{}", non_empty(&resp.message, "Logged out"));
        }

        Command::LogoutAll => {
            // Local credentials are gone even if the server call failed.
            let resp = controller.logout_all().await?;
            println!("{}", non_empty(&resp.message, "Logged out of all sessions"));
        }

        Command::Sessions => {
            let sessions = controller.sessions().await?;
            print_sessions(&sessions);
        }

        Command::Revoke { session_id } => {
            let resp = controller.logout_session(&session_id).await?;
            println!("{}", non_empty(&resp.message, "Session revoked"));
        }

        Command::ResetPassword { token, new_password } => {
            let resp = controller.reset_password(&token, &new_password).await?;
            println!("{}", non_empty(&resp.message, "Password reset, please log in again"));
        }

        Command::ForgotPassword { email } => {
            let resp = controller.forgot_password(&email).await?;
            println!("{}", non_empty(&resp.message, "Reset email sent"));
        }

        Command::VerifyEmail { token } => {
            let resp = controller.verify_email(&token).await?;
            println!("{}", non_empty(&resp.message, "Email verified"));
        }

        Command::Profile { name, avatar } => {
            if name.is_none() && avatar.is_none() {
                anyhow::bail!("nothing to update (pass --name or --avatar)");
            }
            match controller.update_profile(&ProfileUpdate { name, avatar }).await? {
                Some(user) => println!("{}", format_user(&user)),
                None => println!("Profile updated"),
            }
        }

        Command::Workspace { id, clear } => {
            if clear {
                rt.api.select_workspace(None);
            } else if let Some(ref id) = id {
                rt.api.select_workspace(Some(id.as_str()));
            }
            match rt.api.workspace() {
                Some(id) => println!("{id}"),
                None => println!("(no workspace)"),
            }
        }

        Command::Get { path, scoped } => {
            let mut options = RequestOptions::get(path);
            if scoped {
                options = options.scoped();
            }
            let resp = rt.api.send(options).await?;
            match resp.json::<Value>() {
                Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
                Err(_) => println!("{}", String::from_utf8_lossy(&resp.body)),
            }
        }

        Command::Watch => watch(rt).await?,
    }
    Ok(())
}

async fn watch(rt: &SessionRuntime) -> anyhow::Result<()> {
    if !rt.store.is_authenticated() {
        anyhow::bail!("not logged in");
    }
    let mut events = rt.controller.events();
    let Some(listener) = rt.spawn_listener() else {
        anyhow::bail!("no push channel configured (set --push-url)");
    };
    println!("Watching for remote logout");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                listener.shutdown();
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Ended { reason }) => {
                    println!("Session ended: {reason}");
                    return Ok(());
                }
                Ok(other) => debug!(?other, "session event"),
                Err(RecvError::Lagged(n)) => debug!(lagged = n, "session events lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn require_refresh_token(rt: &SessionRuntime) -> anyhow::Result<String> {
    rt.store.refresh_token().ok_or_else(|| anyhow::anyhow!("not logged in"))
}

fn non_empty<'a>(message: &'a str, fallback: &'a str) -> &'a str {
    if message.trim().is_empty() {
        fallback
    } else {
        message
    }
}

pub fn format_user(user: &User) -> String {
    let mut out = match user.name {
        Some(ref name) => format!("{name} <{}>", user.email),
        None => user.email.clone(),
    };
    out.push_str(&format!(" [{}]", user.id));
    if !user.is_verified {
        out.push_str(" (unverified)");
    }
    out
}

pub fn format_expires(secs: i64) -> String {
    if secs <= 0 {
        return "expired".to_owned();
    }
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}h {m:02}m")
    } else {
        format!("{m}m {s:02}s")
    }
}

fn print_sessions(sessions: &[DeviceSession]) {
    if sessions.is_empty() {
        println!("(no sessions)");
        return;
    }
    let id_w = sessions.iter().map(|s| s.refresh_id.len()).max().unwrap_or(0).max(10);
    let created_w = sessions.iter().map(|s| s.created_at.len()).max().unwrap_or(0).max(7);

    println!("{:<id_w$}  {:<created_w$}  {}", "SESSION ID", "CREATED", "EXPIRES IN");
    for s in sessions {
        println!(
            "{:<id_w$}  {:<created_w$}  {}",
            s.refresh_id,
            s.created_at,
            format_expires(s.expires_in_seconds)
        );
    }
}

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;

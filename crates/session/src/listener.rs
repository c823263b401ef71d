// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session push listener: one WebSocket per access token, watching for
//! server-initiated logout.
//!
//! The channel follows the token store. It opens when a token appears,
//! reopens when the token changes, and closes when the token is cleared.
//! A `logout` frame runs the same teardown as a local logout, at most once
//! per access token, however many channels that token opens.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::controller::SessionController;
use crate::store::TokenStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Connected,
    LoggingOut,
}

/// Inbound push frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    #[serde(alias = "LOGOUT", alias = "session:logout")]
    Logout {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Parse a text frame. Malformed frames are logged and dropped.
pub fn parse_event(text: &str) -> Option<PushEvent> {
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(err = %e, "ignoring malformed push frame");
            None
        }
    }
}

/// Remembers which access token a logout was already handled for.
///
/// `fire` returns `true` once per token. A reconnect on the same token after a
/// logout frame cannot start a second teardown; a new login re-arms it.
#[derive(Debug, Default)]
pub struct LogoutLatch {
    fired_for: Option<String>,
}

impl LogoutLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&mut self, token: &str) -> bool {
        if self.fired_for.as_deref() == Some(token) {
            return false;
        }
        self.fired_for = Some(token.to_owned());
        true
    }
}

/// Build the push channel URL: `ws(s)://…?token=<token>`.
pub fn build_push_url(base_url: &str, token: &str) -> String {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else if base_url.starts_with("http://") {
        base_url.replacen("http://", "ws://", 1)
    } else {
        base_url.to_owned()
    };
    let sep = if ws_base.contains('?') { '&' } else { '?' };
    format!("{ws_base}{sep}token={}", urlencoded(token))
}

/// Percent-encode everything outside the unreserved set.
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}

/// How one channel lifetime ended.
enum ChannelOutcome {
    Cancelled,
    TokenChanged,
    LoggedOut,
    /// Closed or failed without a logout event.
    Dropped { connected: bool },
}

/// Handle to the background listener task. Dropping it stops the task.
pub struct PushListener {
    state: watch::Receiver<ListenerState>,
    cancel: CancellationToken,
}

impl PushListener {
    pub fn spawn(
        push_url: String,
        policy: ReconnectPolicy,
        store: &TokenStore,
        controller: Arc<SessionController>,
    ) -> Self {
        let (state_tx, state) = watch::channel(ListenerState::Disconnected);
        let cancel = CancellationToken::new();
        let task = ListenerTask {
            push_url,
            policy,
            controller,
            token_rx: store.subscribe(),
            latch: LogoutLatch::new(),
            state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());
        Self { state, cancel }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ListenerTask {
    push_url: String,
    policy: ReconnectPolicy,
    controller: Arc<SessionController>,
    token_rx: watch::Receiver<Option<String>>,
    latch: LogoutLatch,
    state_tx: watch::Sender<ListenerState>,
    cancel: CancellationToken,
}

impl ListenerTask {
    async fn run(mut self) {
        let mut backoff = match self.policy {
            ReconnectPolicy::Backoff { initial, .. } => initial,
            ReconnectPolicy::Never => Duration::ZERO,
        };

        loop {
            let token = self.token_rx.borrow_and_update().clone();
            let Some(token) = token else {
                self.set_state(ListenerState::Disconnected);
                if !self.wait_token_change().await {
                    break;
                }
                continue;
            };

            match self.run_channel(&token).await {
                ChannelOutcome::Cancelled => break,
                ChannelOutcome::TokenChanged | ChannelOutcome::LoggedOut => continue,
                ChannelOutcome::Dropped { connected } => {
                    self.set_state(ListenerState::Disconnected);
                    match self.policy {
                        ReconnectPolicy::Never => {
                            debug!("push channel down, waiting for a new token");
                            if !self.wait_token_change().await {
                                break;
                            }
                        }
                        ReconnectPolicy::Backoff { initial, max } => {
                            if connected {
                                backoff = initial;
                            }
                            debug!(backoff_ms = backoff.as_millis() as u64, "push channel down, reconnecting");
                            tokio::select! {
                                _ = self.cancel.cancelled() => break,
                                changed = self.token_rx.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(max);
                        }
                    }
                }
            }
        }

        self.set_state(ListenerState::Disconnected);
        debug!("push listener stopped");
    }

    /// Wait for the token to change. Returns `false` on cancel or store drop.
    async fn wait_token_change(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            changed = self.token_rx.changed() => changed.is_ok(),
        }
    }

    async fn run_channel(&mut self, token: &str) -> ChannelOutcome {
        self.set_state(ListenerState::Connecting);
        let url = build_push_url(&self.push_url, token);

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return ChannelOutcome::Cancelled,
            changed = self.token_rx.changed() => {
                return if changed.is_ok() { ChannelOutcome::TokenChanged } else { ChannelOutcome::Cancelled };
            }
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };
        let ws_stream = match connected {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                debug!(err = %e, "push channel connect failed");
                return ChannelOutcome::Dropped { connected: false };
            }
        };

        self.set_state(ListenerState::Connected);
        info!("push channel connected");

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return ChannelOutcome::Cancelled;
                }
                changed = self.token_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return if changed.is_ok() { ChannelOutcome::TokenChanged } else { ChannelOutcome::Cancelled };
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match parse_event(&text) {
                            Some(PushEvent::Logout { reason }) => {
                                if !self.latch.fire(token) {
                                    debug!("duplicate logout event ignored");
                                    continue;
                                }
                                self.set_state(ListenerState::LoggingOut);
                                info!(reason = reason.as_deref().unwrap_or("unspecified"), "remote logout received");
                                let _ = write.send(Message::Close(None)).await;
                                drop(write);
                                drop(read);
                                self.controller.remote_logout().await;
                                return ChannelOutcome::LoggedOut;
                            }
                            Some(PushEvent::Other) => debug!("ignoring push event"),
                            None => {}
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("push channel closed");
                            return ChannelOutcome::Dropped { connected: true };
                        }
                        Some(Err(e)) => {
                            debug!(err = %e, "push channel error");
                            return ChannelOutcome::Dropped { connected: true };
                        }
                        Some(Ok(_)) => {} // binary, ping, pong
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-ended hook and the events broadcast to the front-end.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::storage::Storage;
use crate::store::TokenStore;
use crate::types::DeviceSession;

/// Why a session was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Logout,
    LogoutAll,
    RemoteLogout,
    RefreshFailed,
    MissingRefreshToken,
    PasswordReset,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::LogoutAll => "logout_all",
            Self::RemoteLogout => "remote_logout",
            Self::RefreshFailed => "refresh_failed",
            Self::MissingRefreshToken => "missing_refresh_token",
            Self::PasswordReset => "password_reset",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle events. `Ended` is the front-end's cue to show the login screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { user_id: String },
    Refreshed,
    Ended { reason: EndReason },
}

/// Owns session teardown. Every path that ends a session goes through
/// [`SessionHook::session_ended`]; nothing else purges storage.
pub struct SessionHook {
    store: Arc<TokenStore>,
    storage: Arc<dyn Storage>,
    event_tx: broadcast::Sender<SessionEvent>,
    device_sessions: RwLock<Option<Vec<DeviceSession>>>,
}

impl SessionHook {
    pub fn new(store: Arc<TokenStore>, storage: Arc<dyn Storage>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self { store, storage, event_tx, device_sessions: RwLock::new(None) }
    }

    /// Clear the store, purge persisted state, and drop cached device sessions.
    ///
    /// Safe to call from several paths at once: the purge is idempotent and
    /// `Ended` is broadcast only by the call that actually cleared a session.
    pub fn session_ended(&self, reason: EndReason) -> bool {
        let cleared = self.store.clear_credentials();
        self.storage.clear();
        self.invalidate_device_sessions();
        if cleared {
            info!(%reason, "session ended");
            let _ = self.event_tx.send(SessionEvent::Ended { reason });
        } else {
            debug!(%reason, "session already ended");
        }
        cleared
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn cached_device_sessions(&self) -> Option<Vec<DeviceSession>> {
        self.device_sessions.read().clone()
    }

    pub(crate) fn cache_device_sessions(&self, sessions: Vec<DeviceSession>) {
        *self.device_sessions.write() = Some(sessions);
    }

    pub fn invalidate_device_sessions(&self) {
        self.device_sessions.write().take();
    }
}

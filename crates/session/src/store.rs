// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory token store: the single source of truth for "is a session active".
//!
//! Reads are synchronous so the request pipeline never awaits to learn the
//! current token. Every mutation happens under one write lock, with the
//! storage mirror updated before the lock is released, so readers never see a
//! half-applied merge.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::storage::{Storage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::types::{AuthResponse, TokenPair, User, UserPatch};

/// Snapshot of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<User>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.user.is_none()
    }
}

/// Partial update merged by [`TokenStore::set_credentials`]. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct CredentialsUpdate {
    pub user: Option<User>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl CredentialsUpdate {
    pub fn tokens(pair: TokenPair) -> Self {
        Self { user: None, access_token: Some(pair.access_token), refresh_token: Some(pair.refresh_token) }
    }

    pub fn user(user: User) -> Self {
        Self { user: Some(user), access_token: None, refresh_token: None }
    }
}

impl From<AuthResponse> for CredentialsUpdate {
    fn from(resp: AuthResponse) -> Self {
        Self {
            user: Some(resp.user),
            access_token: Some(resp.access_token),
            refresh_token: Some(resp.refresh_token),
        }
    }
}

struct Inner {
    creds: Credentials,
    /// Bumped whenever a session starts or ends.
    generation: u64,
    hydrated: bool,
}

pub struct TokenStore {
    inner: RwLock<Inner>,
    storage: Arc<dyn Storage>,
    token_tx: watch::Sender<Option<String>>,
}

impl TokenStore {
    /// Create an empty store. Reads fall back to `storage` until [`hydrate`](Self::hydrate).
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let (token_tx, _) = watch::channel(None);
        Self {
            inner: RwLock::new(Inner { creds: Credentials::default(), generation: 0, hydrated: false }),
            storage,
            token_tx,
        }
    }

    /// Create a store and immediately load persisted tokens.
    pub fn open(storage: Arc<dyn Storage>) -> Self {
        let store = Self::new(storage);
        store.hydrate();
        store
    }

    /// Load persisted tokens into memory. No-op once hydrated.
    pub fn hydrate(&self) {
        let mut inner = self.inner.write();
        if inner.hydrated {
            return;
        }
        inner.creds.access_token = self.storage.get(ACCESS_TOKEN_KEY);
        inner.creds.refresh_token = self.storage.get(REFRESH_TOKEN_KEY);
        inner.hydrated = true;
        let token = inner.creds.access_token.clone();
        self.publish(token);
    }

    pub fn snapshot(&self) -> Credentials {
        self.inner.read().creds.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        let inner = self.inner.read();
        if inner.hydrated {
            return inner.creds.access_token.clone();
        }
        inner.creds.access_token.clone().or_else(|| self.storage.get(ACCESS_TOKEN_KEY))
    }

    pub fn refresh_token(&self) -> Option<String> {
        let inner = self.inner.read();
        if inner.hydrated {
            return inner.creds.refresh_token.clone();
        }
        inner.creds.refresh_token.clone().or_else(|| self.storage.get(REFRESH_TOKEN_KEY))
    }

    pub fn user(&self) -> Option<User> {
        self.inner.read().creds.user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Watch the access token. The listener reconnects on every change.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.token_tx.subscribe()
    }

    /// Merge the supplied fields and mirror supplied tokens to storage.
    pub fn set_credentials(&self, update: CredentialsUpdate) {
        let mut inner = self.inner.write();
        self.merge(&mut inner, update);
    }

    /// Merge only if no session started or ended since `generation` was read.
    pub fn set_credentials_if(&self, generation: u64, update: CredentialsUpdate) -> bool {
        let mut inner = self.inner.write();
        if inner.generation != generation {
            return false;
        }
        self.merge(&mut inner, update);
        true
    }

    /// Patch the stored user in place, unless the session changed since
    /// `generation` was read. Returns `None` when skipped or no user is held.
    pub fn merge_user_if(&self, generation: u64, patch: UserPatch) -> Option<User> {
        let mut inner = self.inner.write();
        if inner.generation != generation {
            return None;
        }
        let user = inner.creds.user.as_mut()?;
        user.merge(patch);
        Some(user.clone())
    }

    /// Start a fresh session: bump the generation, then merge.
    pub fn begin_session(&self, update: CredentialsUpdate) -> u64 {
        let mut inner = self.inner.write();
        inner.generation += 1;
        inner.creds.user = None;
        self.merge(&mut inner, update);
        inner.generation
    }

    /// Drop all credentials and their persisted copies.
    ///
    /// Returns whether anything was held. Calling this on an empty store is a
    /// no-op that returns `false`.
    pub fn clear_credentials(&self) -> bool {
        let mut inner = self.inner.write();
        let persisted = self.storage.get(ACCESS_TOKEN_KEY).is_some()
            || self.storage.get(REFRESH_TOKEN_KEY).is_some();
        let had_session = !inner.creds.is_empty() || persisted;

        inner.creds = Credentials::default();
        inner.hydrated = true;
        self.storage.remove(ACCESS_TOKEN_KEY);
        self.storage.remove(REFRESH_TOKEN_KEY);
        if had_session {
            inner.generation += 1;
        }
        self.publish(None);
        had_session
    }

    fn merge(&self, inner: &mut Inner, update: CredentialsUpdate) {
        if let Some(user) = update.user {
            inner.creds.user = Some(user);
        }
        if let Some(token) = update.refresh_token {
            self.storage.set(REFRESH_TOKEN_KEY, &token);
            inner.creds.refresh_token = Some(token);
        }
        if let Some(token) = update.access_token {
            self.storage.set(ACCESS_TOKEN_KEY, &token);
            inner.creds.access_token = Some(token);
        }
        inner.hydrated = true;
        let token = inner.creds.access_token.clone();
        self.publish(token);
    }

    fn publish(&self, token: Option<String>) {
        self.token_tx.send_if_modified(|current| {
            if *current == token {
                return false;
            }
            *current = token;
            true
        });
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("TokenStore")
            .field("authenticated", &inner.creds.access_token.is_some())
            .field("generation", &inner.generation)
            .finish()
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

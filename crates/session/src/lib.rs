// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Switchboard: authenticated-session core for the dashboard console.

pub mod config;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod pipeline;
pub mod request;
pub mod storage;
pub mod store;
pub mod types;

use std::sync::{Arc, Once};

pub use crate::config::{ReconnectPolicy, SessionConfig};
pub use crate::controller::SessionController;
pub use crate::error::{ApiError, ErrorCode};
pub use crate::lifecycle::{EndReason, SessionEvent, SessionHook};
pub use crate::listener::{ListenerState, PushListener};
pub use crate::pipeline::{ApiClient, ApiResponse};
pub use crate::request::{scope_path, RequestOptions};
pub use crate::storage::{FileStorage, MemoryStorage, Storage};
pub use crate::store::{Credentials, CredentialsUpdate, TokenStore};

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times; only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Owns one session's store, hook, pipeline and controller.
///
/// Nothing here is global, so independent runtimes can live side by side.
pub struct SessionRuntime {
    pub config: SessionConfig,
    pub store: Arc<TokenStore>,
    pub hook: Arc<SessionHook>,
    pub api: Arc<ApiClient>,
    pub controller: Arc<SessionController>,
}

impl SessionRuntime {
    pub fn new(config: SessionConfig, storage: Arc<dyn Storage>) -> anyhow::Result<Self> {
        let store = Arc::new(TokenStore::open(Arc::clone(&storage)));
        let hook = Arc::new(SessionHook::new(Arc::clone(&store), Arc::clone(&storage)));
        let api = Arc::new(ApiClient::new(&config, Arc::clone(&store), Arc::clone(&hook), storage)?);
        let controller =
            Arc::new(SessionController::new(Arc::clone(&api), Arc::clone(&store), Arc::clone(&hook)));
        Ok(Self { config, store, hook, api, controller })
    }

    /// Runtime backed by the JSON credential file under the configured state dir.
    pub fn with_file_storage(config: SessionConfig) -> anyhow::Result<Self> {
        let storage = Arc::new(FileStorage::open(config.credentials_path()));
        Self::new(config, storage)
    }

    /// Start the push listener if a push URL is configured.
    pub fn spawn_listener(&self) -> Option<PushListener> {
        let push_url = self.config.push_url.clone()?;
        Some(PushListener::spawn(
            push_url,
            self.config.reconnect_policy(),
            &self.store,
            Arc::clone(&self.controller),
        ))
    }
}

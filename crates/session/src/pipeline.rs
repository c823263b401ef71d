// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated request pipeline.
//!
//! Every backend call goes through [`ApiClient`]. It attaches the bearer token
//! and the tunnel-bypass header, rewrites workspace-scoped paths, and recovers
//! from a 401 with one refresh and one retry. Concurrent 401s share a single
//! in-flight refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ApiError, ErrorCode};
use crate::lifecycle::{EndReason, SessionEvent, SessionHook};
use crate::request::{scope_path, RequestOptions};
use crate::storage::{Storage, WORKSPACE_KEY};
use crate::store::{CredentialsUpdate, TokenStore};
use crate::types::{RefreshTokenBody, TokenPair};

const REFRESH_PATH: &str = "/auth/refresh";

type RefreshFuture = Shared<BoxFuture<'static, Result<TokenPair, ApiError>>>;

/// Raw response of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ApiResponse {
    /// Decode the body. An empty body decodes as `{}`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let bytes: &[u8] = if self.body.is_empty() { b"{}" } else { &self.body };
        serde_json::from_slice(bytes).map_err(ApiError::decode)
    }

    fn into_result(self) -> Result<Self, ApiError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_response(self.status.as_u16(), &self.body))
        }
    }
}

/// HTTP plumbing shared by ordinary calls and the detached refresh future.
#[derive(Clone)]
struct Transport {
    http: reqwest::Client,
    base_url: String,
    bypass_name: HeaderName,
    bypass_value: HeaderValue,
}

impl Transport {
    async fn execute(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
        token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .header(self.bypass_name.clone(), self.bypass_value.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| ApiError::transport(&e))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| ApiError::transport(&e))?;
        Ok(ApiResponse { status, body })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let body = to_body(&RefreshTokenBody { refresh_token })?;
        let resp = self.execute(&Method::POST, REFRESH_PATH, Some(&body), None).await?;
        resp.into_result()?.json()
    }
}

struct InflightRefresh {
    id: u64,
    generation: u64,
    fut: RefreshFuture,
}

/// The single choke point for backend calls.
pub struct ApiClient {
    transport: Transport,
    store: Arc<TokenStore>,
    hook: Arc<SessionHook>,
    storage: Arc<dyn Storage>,
    refresh_timeout: Duration,
    inflight: Arc<Mutex<Option<InflightRefresh>>>,
    next_refresh_id: AtomicU64,
}

impl ApiClient {
    pub fn new(
        config: &SessionConfig,
        store: Arc<TokenStore>,
        hook: Arc<SessionHook>,
        storage: Arc<dyn Storage>,
    ) -> anyhow::Result<Self> {
        crate::ensure_crypto();
        let http = reqwest::Client::builder().timeout(config.request_timeout()).build()?;
        let bypass_name = HeaderName::from_bytes(config.bypass_header.as_bytes())?;
        let bypass_value = HeaderValue::from_str(&config.bypass_value)?;
        Ok(Self {
            transport: Transport {
                http,
                base_url: config.api_url.trim_end_matches('/').to_owned(),
                bypass_name,
                bypass_value,
            },
            store,
            hook,
            storage,
            refresh_timeout: config.refresh_timeout(),
            inflight: Arc::new(Mutex::new(None)),
            next_refresh_id: AtomicU64::new(0),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.transport.base_url
    }

    /// Select (or with `None`, deselect) the workspace used by scoped requests.
    pub fn select_workspace(&self, workspace: Option<&str>) {
        match workspace.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self.storage.set(WORKSPACE_KEY, id),
            None => self.storage.remove(WORKSPACE_KEY),
        }
    }

    pub fn workspace(&self) -> Option<String> {
        self.storage.get(WORKSPACE_KEY)
    }

    fn resolve_path(&self, options: &RequestOptions) -> String {
        if options.workspace_scoped {
            scope_path(&options.path, self.workspace().as_deref())
        } else {
            scope_path(&options.path, None)
        }
    }

    /// Send a request, recovering from one 401 with a refresh-and-retry.
    ///
    /// If recovery is impossible the caller gets the original 401, never the
    /// refresh error.
    pub async fn send(&self, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        let path = self.resolve_path(&options);
        let generation = self.store.generation();
        let token = self.store.access_token();

        let resp =
            self.transport.execute(&options.method, &path, options.body.as_ref(), token.as_deref()).await?;
        if resp.status != StatusCode::UNAUTHORIZED {
            return resp.into_result();
        }

        let original = ApiError::from_response(resp.status.as_u16(), &resp.body);
        debug!(%path, "request unauthorized, attempting recovery");
        let Some(fresh) = self.recover(token.as_deref(), generation).await else {
            return Err(original);
        };

        self.transport
            .execute(&options.method, &path, options.body.as_ref(), Some(&fresh))
            .await?
            .into_result()
    }

    /// Send a request without 401 recovery.
    ///
    /// Used for endpoints whose 401 means "bad credentials" rather than
    /// "expired token", and for calls that carry a refresh token in the body.
    pub async fn send_once(&self, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        let path = self.resolve_path(&options);
        let token = self.store.access_token();
        self.transport
            .execute(&options.method, &path, options.body.as_ref(), token.as_deref())
            .await?
            .into_result()
    }

    pub async fn send_json<T: DeserializeOwned>(&self, options: RequestOptions) -> Result<T, ApiError> {
        self.send(options).await?.json()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(RequestOptions::get(path)).await
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(RequestOptions::post(path).json(to_body(body)?)).await
    }

    /// Rotate the token pair now, joining a refresh already in flight.
    ///
    /// A failed refresh ends the session unless it changed in the meantime.
    pub async fn refresh_now(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let generation = self.store.generation();
        self.refresh_shared(refresh_token.to_owned(), generation).await
    }

    /// Work out which token to retry with after a 401, refreshing if needed.
    async fn recover(&self, stale: Option<&str>, generation: u64) -> Option<String> {
        if self.store.generation() != generation {
            debug!("session changed while request was in flight, not retrying");
            return None;
        }

        if let Some(current) = self.store.access_token() {
            if stale != Some(current.as_str()) {
                debug!("access token already rotated, retrying with current token");
                return Some(current);
            }
        }

        let Some(refresh_token) = self.store.refresh_token() else {
            warn!("unauthorized with no refresh token");
            self.hook.session_ended(EndReason::MissingRefreshToken);
            return None;
        };

        self.refresh_shared(refresh_token, generation).await.ok().map(|pair| pair.access_token)
    }

    /// Join the in-flight refresh for this generation, or start one.
    fn refresh_shared(&self, refresh_token: String, generation: u64) -> RefreshFuture {
        let mut slot = self.inflight.lock();
        if let Some(ref inflight) = *slot {
            if inflight.generation == generation {
                return inflight.fut.clone();
            }
        }

        let id = self.next_refresh_id.fetch_add(1, Ordering::Relaxed);
        let transport = self.transport.clone();
        let store = Arc::clone(&self.store);
        let hook = Arc::clone(&self.hook);
        let inflight = Arc::clone(&self.inflight);
        let timeout = self.refresh_timeout;

        let fut = async move {
            let result = match tokio::time::timeout(timeout, transport.refresh(&refresh_token)).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::new(ErrorCode::Timeout, "token refresh timed out")),
            };

            // Apply the outcome before vacating the slot so a late 401 sees
            // either the in-flight refresh or its result, never the stale token.
            let result = match result {
                Ok(pair) => {
                    if store.set_credentials_if(generation, CredentialsUpdate::tokens(pair.clone())) {
                        info!("access token refreshed");
                        hook.emit(SessionEvent::Refreshed);
                        Ok(pair)
                    } else {
                        debug!("session changed during refresh, discarding tokens");
                        Err(ApiError::no_session())
                    }
                }
                Err(e) => {
                    warn!(err = %e, "token refresh failed");
                    if store.generation() == generation {
                        hook.session_ended(EndReason::RefreshFailed);
                    }
                    Err(e)
                }
            };

            {
                let mut slot = inflight.lock();
                if slot.as_ref().is_some_and(|f| f.id == id) {
                    *slot = None;
                }
            }
            result
        }
        .boxed()
        .shared();

        *slot = Some(InflightRefresh { id, generation, fut: fut.clone() });
        fut
    }
}

pub(crate) fn to_body<B: Serialize + ?Sized>(body: &B) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(body).map_err(|e| ApiError::new(ErrorCode::BadRequest, format!("encode body: {e}")))
}

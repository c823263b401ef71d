// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process mock of the dashboard backend.
//!
//! Serves the `/auth/*` endpoints, a bearer-protected fallback for every other
//! path, and the `/ws` push channel. Access tokens are accepted only after a
//! login or a scripted rotation, so tests control exactly when a 401 happens.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const EMAIL: &str = "a@b.com";
pub const PASSWORD: &str = "secret";
pub const BYPASS_HEADER: &str = "ngrok-skip-browser-warning";

/// One request as seen by the backend.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub bypass: Option<String>,
}

#[derive(Debug, Clone)]
enum PushFrame {
    Text(String),
    Close,
}

#[derive(Default)]
struct Counters {
    login: AtomicU32,
    refresh: AtomicU32,
    logout: AtomicU32,
    logout_all: AtomicU32,
    sessions: AtomicU32,
    push_connects: AtomicU32,
    push_open: AtomicU32,
}

struct BackendState {
    login_tokens: Mutex<(String, String)>,
    valid_tokens: Mutex<HashSet<String>>,
    rotations: Mutex<HashMap<String, (String, String)>>,
    delays: Mutex<HashMap<String, Duration>>,
    fail_logout: AtomicBool,
    fail_logout_all: AtomicBool,
    counters: Counters,
    requests: Mutex<Vec<RecordedRequest>>,
    push_tokens: Mutex<Vec<String>>,
    push_tx: broadcast::Sender<PushFrame>,
}

impl BackendState {
    async fn pause(&self, path: &str) {
        let delay = self.delays.lock().get(path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        bearer(headers).is_some_and(|token| self.valid_tokens.lock().contains(token))
    }
}

/// A running mock backend. The server task is aborted on drop.
pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> anyhow::Result<Self> {
        let (push_tx, _) = broadcast::channel(16);
        let state = Arc::new(BackendState {
            login_tokens: Mutex::new(("AT1".to_owned(), "RT1".to_owned())),
            valid_tokens: Mutex::new(HashSet::new()),
            rotations: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            fail_logout: AtomicBool::new(false),
            fail_logout_all: AtomicBool::new(false),
            counters: Counters::default(),
            requests: Mutex::new(Vec::new()),
            push_tokens: Mutex::new(Vec::new()),
            push_tx,
        });

        let router = Router::new()
            .route("/auth/login", post(login))
            .route("/auth/register", post(register))
            .route("/auth/refresh", post(refresh))
            .route("/auth/logout", post(logout))
            .route("/auth/logout-all", post(logout_all))
            .route("/auth/logout/session", post(logout_session))
            .route("/auth/sessions", get(sessions))
            .route("/auth/me", get(me))
            .route("/auth/profile", patch(profile))
            .route("/auth/reset-password", post(acknowledge))
            .route("/auth/forgot-password", post(acknowledge))
            .route("/auth/verify-email", post(acknowledge))
            .route("/ws", get(push_upgrade))
            .fallback(protected)
            .layer(middleware::from_fn_with_state(Arc::clone(&state), record))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self { addr, state, handle })
    }

    /// Base URL for the REST API.
    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Push channel URL, in `http` form so clients must rewrite the scheme.
    pub fn push_url(&self) -> String {
        format!("http://{}/ws", self.addr)
    }

    /// Tokens handed out by the next login or register.
    pub fn set_login_tokens(&self, access: &str, refresh: &str) {
        *self.state.login_tokens.lock() = (access.to_owned(), refresh.to_owned());
    }

    pub fn accept_token(&self, access: &str) {
        self.state.valid_tokens.lock().insert(access.to_owned());
    }

    /// Make `access` expired: requests bearing it get a 401.
    pub fn expire_token(&self, access: &str) {
        self.state.valid_tokens.lock().remove(access);
    }

    /// Allow `refresh` to be exchanged once for the given pair.
    pub fn add_rotation(&self, refresh: &str, new_access: &str, new_refresh: &str) {
        self.state
            .rotations
            .lock()
            .insert(refresh.to_owned(), (new_access.to_owned(), new_refresh.to_owned()));
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.set_delay("/auth/refresh", delay);
    }

    /// Hold responses on `path` for `delay` before answering.
    pub fn set_delay(&self, path: &str, delay: Duration) {
        self.state.delays.lock().insert(path.to_owned(), delay);
    }

    pub fn fail_logout(&self, fail: bool) {
        self.state.fail_logout.store(fail, Ordering::SeqCst);
    }

    pub fn fail_logout_all(&self, fail: bool) {
        self.state.fail_logout_all.store(fail, Ordering::SeqCst);
    }

    pub fn login_calls(&self) -> u32 {
        self.state.counters.login.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.counters.refresh.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> u32 {
        self.state.counters.logout.load(Ordering::SeqCst)
    }

    pub fn logout_all_calls(&self) -> u32 {
        self.state.counters.logout_all.load(Ordering::SeqCst)
    }

    pub fn sessions_calls(&self) -> u32 {
        self.state.counters.sessions.load(Ordering::SeqCst)
    }

    /// Total push connections accepted so far.
    pub fn push_connects(&self) -> u32 {
        self.state.counters.push_connects.load(Ordering::SeqCst)
    }

    /// Push connections currently open.
    pub fn push_open(&self) -> u32 {
        self.state.counters.push_open.load(Ordering::SeqCst)
    }

    /// Tokens presented by push connections, in connection order.
    pub fn push_tokens(&self) -> Vec<String> {
        self.state.push_tokens.lock().clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Requests to `path`, in arrival order.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.state.requests.lock().iter().filter(|r| r.path == path).cloned().collect()
    }

    /// Send a JSON frame to every open push connection.
    pub fn push(&self, frame: &Value) -> usize {
        self.state.push_tx.send(PushFrame::Text(frame.to_string())).unwrap_or(0)
    }

    /// Send a raw text frame to every open push connection.
    pub fn push_text(&self, text: &str) -> usize {
        self.state.push_tx.send(PushFrame::Text(text.to_owned())).unwrap_or(0)
    }

    /// Close every open push connection from the server side.
    pub fn drop_push(&self) -> usize {
        self.state.push_tx.send(PushFrame::Close).unwrap_or(0)
    }

    /// Wait until `n` push connections are open.
    pub async fn wait_push_open(&self, n: u32, timeout: Duration) -> anyhow::Result<()> {
        crate::wait_until(timeout, || self.push_open() == n).await
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn user_json() -> Value {
    json!({ "id": "u1", "email": EMAIL, "name": "Ada", "is_verified": false })
}

fn error(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
}

fn unauthorized() -> Response {
    error(StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED", "access token expired")
}

fn message(text: &str) -> Response {
    Json(json!({ "message": text })).into_response()
}

async fn record(State(state): State<Arc<BackendState>>, req: Request, next: Next) -> Response {
    let recorded = {
        let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
        RecordedRequest {
            method: req.method().clone(),
            path: req.uri().path().to_owned(),
            authorization: header("authorization"),
            bypass: header(BYPASS_HEADER),
        }
    };
    state.requests.lock().push(recorded);
    next.run(req).await
}

fn issue_session(state: &BackendState, status: StatusCode, verification: bool) -> Response {
    let (access, refresh) = state.login_tokens.lock().clone();
    state.valid_tokens.lock().insert(access.clone());
    let mut body = json!({ "user": user_json(), "access_token": access, "refresh_token": refresh });
    if verification {
        body["verification_token"] = json!("verify-1");
    }
    (status, Json(body)).into_response()
}

async fn login(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    state.counters.login.fetch_add(1, Ordering::SeqCst);
    if body["email"] != EMAIL || body["password"] != PASSWORD {
        return error(StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", "invalid email or password");
    }
    issue_session(&state, StatusCode::OK, false)
}

async fn register(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    if body["email"] == EMAIL {
        return error(StatusCode::CONFLICT, "EMAIL_TAKEN", "email already registered");
    }
    issue_session(&state, StatusCode::CREATED, true)
}

async fn refresh(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    state.counters.refresh.fetch_add(1, Ordering::SeqCst);
    state.pause("/auth/refresh").await;

    let presented = body["refresh_token"].as_str().unwrap_or_default();
    let rotation = state.rotations.lock().remove(presented);
    match rotation {
        Some((access, refresh)) => {
            state.valid_tokens.lock().insert(access.clone());
            Json(json!({ "access_token": access, "refresh_token": refresh })).into_response()
        }
        None => error(StatusCode::UNAUTHORIZED, "INVALID_REFRESH_TOKEN", "refresh token revoked"),
    }
}

async fn logout(State(state): State<Arc<BackendState>>) -> Response {
    state.counters.logout.fetch_add(1, Ordering::SeqCst);
    state.pause("/auth/logout").await;
    if state.fail_logout.load(Ordering::SeqCst) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "logout failed");
    }
    message("Logged out")
}

async fn logout_all(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    state.counters.logout_all.fetch_add(1, Ordering::SeqCst);
    if state.fail_logout_all.load(Ordering::SeqCst) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "logout-all failed");
    }
    if !state.authorized(&headers) {
        return unauthorized();
    }
    message("Logged out of all sessions")
}

async fn logout_session(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    message("Session revoked")
}

async fn sessions(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    state.counters.sessions.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "sessions": [
            { "refresh_id": "r1", "created_at": "2026-01-01T00:00:00Z", "expires_in_seconds": 3600 },
            { "refresh_id": "r2", "created_at": "2026-01-02T00:00:00Z", "expires_in_seconds": 7200 },
        ]
    }))
    .into_response()
}

async fn me(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    state.pause("/auth/me").await;
    if !state.authorized(&headers) {
        return unauthorized();
    }
    Json(user_json()).into_response()
}

async fn profile(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.pause("/auth/profile").await;
    if !state.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "user": body })).into_response()
}

async fn acknowledge(uri: Uri) -> Response {
    message(&format!("ok {}", uri.path()))
}

async fn protected(
    State(state): State<Arc<BackendState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "method": method.as_str(), "path": uri.path() })).into_response()
}

async fn push_upgrade(
    State(state): State<Arc<BackendState>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.get("token").cloned().unwrap_or_default();
    if !state.valid_tokens.lock().contains(&token) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    ws.on_upgrade(move |socket| push_session(socket, state, token)).into_response()
}

async fn push_session(socket: WebSocket, state: Arc<BackendState>, token: String) {
    // Subscribe before counting the connection open so no frame is missed.
    let mut rx = state.push_tx.subscribe();
    state.push_tokens.lock().push(token);
    state.counters.push_connects.fetch_add(1, Ordering::SeqCst);
    state.counters.push_open.fetch_add(1, Ordering::SeqCst);

    let (mut tx, mut inbound) = socket.split();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(PushFrame::Text(text)) => {
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(PushFrame::Close) => {
                    let _ = tx.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = inbound.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.counters.push_open.fetch_sub(1, Ordering::SeqCst);
}

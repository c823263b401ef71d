// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle operations used by the front-end and the push listener.
//!
//! Local state only changes after the network call resolves. `logout_all` is
//! the exception: it always ends the local session.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::lifecycle::{EndReason, SessionEvent, SessionHook};
use crate::pipeline::{to_body, ApiClient};
use crate::request::RequestOptions;
use crate::store::{Credentials, CredentialsUpdate, TokenStore};
use crate::types::{
    AuthResponse, DeviceSession, ForgotPasswordRequest, LoginRequest, LogoutSessionRequest,
    MessageResponse, ProfileResponse, ProfileUpdate, RefreshTokenBody, RegisterRequest,
    ResetPasswordRequest, SessionsResponse, TokenPair, User, UserPatch, VerifyEmailRequest,
};

pub struct SessionController {
    api: Arc<ApiClient>,
    store: Arc<TokenStore>,
    hook: Arc<SessionHook>,
}

impl SessionController {
    pub fn new(api: Arc<ApiClient>, store: Arc<TokenStore>, hook: Arc<SessionHook>) -> Self {
        Self { api, store, hook }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn current(&self) -> Credentials {
        self.store.snapshot()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.hook.subscribe()
    }

    /// Sign in. Errors such as bad credentials or a missing OTP are returned untouched.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        otp: Option<&str>,
    ) -> Result<AuthResponse, ApiError> {
        let body = to_body(&LoginRequest { email, password, otp })?;
        let resp: AuthResponse =
            self.api.send_once(RequestOptions::post("/auth/login").json(body)).await?.json()?;
        self.start_session(&resp);
        Ok(resp)
    }

    pub async fn register(
        &self,
        email: &str,
        name: &str,
        password: &str,
    ) -> Result<AuthResponse, ApiError> {
        let body = to_body(&RegisterRequest { email, name, password })?;
        let resp: AuthResponse =
            self.api.send_once(RequestOptions::post("/auth/register").json(body)).await?.json()?;
        self.start_session(&resp);
        Ok(resp)
    }

    fn start_session(&self, resp: &AuthResponse) {
        self.store.begin_session(CredentialsUpdate::from(resp.clone()));
        info!(user_id = %resp.user.id, "session started");
        self.hook.emit(SessionEvent::Started { user_id: resp.user.id.clone() });
    }

    /// Explicitly rotate the token pair.
    ///
    /// Joins a pipeline refresh already in flight, so the single-use refresh
    /// token is only ever presented once. A failed refresh ends the session.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        self.api.refresh_now(refresh_token).await
    }

    /// Log out the session owning `refresh_token`.
    ///
    /// The local session is ended only if `refresh_token` is the one currently
    /// held, so a stale call cannot drop a newer login. On failure nothing local changes.
    pub async fn logout(&self, refresh_token: &str) -> Result<MessageResponse, ApiError> {
        let body = to_body(&RefreshTokenBody { refresh_token })?;
        let resp: MessageResponse =
            self.api.send_once(RequestOptions::post("/auth/logout").json(body)).await?.json()?;

        if self.store.refresh_token().as_deref() == Some(refresh_token) {
            self.hook.session_ended(EndReason::Logout);
        } else {
            debug!("logout was for a different session, keeping local credentials");
        }
        Ok(resp)
    }

    /// Revoke every session of this user. The local session ends even if the call fails.
    pub async fn logout_all(&self) -> Result<MessageResponse, ApiError> {
        let result = self
            .api
            .send_once(RequestOptions::post("/auth/logout-all"))
            .await
            .and_then(|resp| resp.json::<MessageResponse>());
        if let Err(ref e) = result {
            warn!(err = %e, "logout-all request failed, clearing local session anyway");
        }
        self.hook.session_ended(EndReason::LogoutAll);
        self.hook.invalidate_device_sessions();
        result
    }

    /// Revoke one device session. Local credentials are never touched.
    pub async fn logout_session(&self, session_id: &str) -> Result<MessageResponse, ApiError> {
        let body = to_body(&LogoutSessionRequest { session_id })?;
        let resp =
            self.api.send_json(RequestOptions::post("/auth/logout/session").json(body)).await?;
        self.hook.invalidate_device_sessions();
        Ok(resp)
    }

    /// List device sessions, served from cache until invalidated.
    pub async fn sessions(&self) -> Result<Vec<DeviceSession>, ApiError> {
        if let Some(cached) = self.hook.cached_device_sessions() {
            return Ok(cached);
        }
        let resp: SessionsResponse = self.api.get_json("/auth/sessions").await?;
        self.hook.cache_device_sessions(resp.sessions.clone());
        Ok(resp.sessions)
    }

    /// Reset the password. Any successful reset forces a fresh login.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<MessageResponse, ApiError> {
        let body = to_body(&ResetPasswordRequest { token, new_password })?;
        let resp: MessageResponse = self
            .api
            .send_once(RequestOptions::post("/auth/reset-password").json(body))
            .await?
            .json()?;
        self.hook.session_ended(EndReason::PasswordReset);
        Ok(resp)
    }

    pub async fn forgot_password(&self, email: &str) -> Result<MessageResponse, ApiError> {
        let body = to_body(&ForgotPasswordRequest { email })?;
        self.api.send_once(RequestOptions::post("/auth/forgot-password").json(body)).await?.json()
    }

    /// Confirm an email address and mark the stored user verified.
    pub async fn verify_email(&self, token: &str) -> Result<MessageResponse, ApiError> {
        let generation = self.store.generation();
        let body = to_body(&VerifyEmailRequest { token })?;
        let resp: MessageResponse = self
            .api
            .send_once(RequestOptions::post("/auth/verify-email").json(body))
            .await?
            .json()?;
        let patch = UserPatch { is_verified: Some(true), ..UserPatch::default() };
        if self.store.merge_user_if(generation, patch).is_none() {
            debug!("no current user to mark verified");
        }
        Ok(resp)
    }

    /// Update the profile and merge the returned fields into the stored user.
    ///
    /// Without a stored user (after a reload) the full user is fetched instead.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<Option<User>, ApiError> {
        let generation = self.store.generation();
        let resp: ProfileResponse = self
            .api
            .send_json(RequestOptions::patch("/auth/profile").json(to_body(update)?))
            .await?;

        if self.store.generation() != generation {
            debug!("session changed during profile update, not storing user");
            return Ok(None);
        }
        match self.store.merge_user_if(generation, resp.user) {
            Some(user) => Ok(Some(user)),
            None => {
                debug!("no stored user to merge into, fetching profile");
                self.me().await.map(Some)
            }
        }
    }

    /// Fetch the signed-in user and replace the stored snapshot.
    ///
    /// The result is dropped if the session ends or restarts while the call is
    /// in flight.
    pub async fn me(&self) -> Result<User, ApiError> {
        if !self.store.is_authenticated() {
            return Err(ApiError::no_session());
        }
        let generation = self.store.generation();
        let user: User = self.api.get_json("/auth/me").await?;
        if !self.store.set_credentials_if(generation, CredentialsUpdate::user(user.clone())) {
            debug!("session changed while fetching user, discarding");
        }
        Ok(user)
    }

    /// Handle a server-pushed logout: best-effort remote logout, then end locally.
    pub async fn remote_logout(&self) {
        if let Some(refresh_token) = self.store.refresh_token() {
            let result = match to_body(&RefreshTokenBody { refresh_token: &refresh_token }) {
                Ok(body) => self.api.send_once(RequestOptions::post("/auth/logout").json(body)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(err = %e, "remote logout call failed, clearing local session anyway");
            }
        }
        self.hook.session_ended(EndReason::RemoteLogout);
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure codes for calls made through the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    Server,
    Transport,
    Timeout,
    Decode,
    NoSession,
}

impl ErrorCode {
    /// Map an HTTP status to its error code. Unknown 4xx become `BadRequest`.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            400..=499 => Self::BadRequest,
            _ => Self::Server,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Server => "SERVER",
            Self::Transport => "TRANSPORT",
            Self::Timeout => "TIMEOUT",
            Self::Decode => "DECODE",
            Self::NoSession => "NO_SESSION",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the pipeline and controller.
///
/// Business-rule failures (bad credentials, OTP mismatch, duplicate email) keep
/// the server's own code in `server_code` so the caller can render it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub status: Option<u16>,
    pub server_code: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, status: None, server_code: None, message: message.into() }
    }

    /// Build an error from a non-success HTTP response body.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let (server_code, message) = parse_error_body(body);
        Self {
            code: ErrorCode::from_status(status),
            status: Some(status),
            server_code,
            message: message.unwrap_or_else(|| format!("HTTP {status}")),
        }
    }

    pub fn transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::new(ErrorCode::Timeout, format!("request timed out: {err}"));
        }
        Self::new(ErrorCode::Transport, format!("request failed: {err}"))
    }

    pub fn decode(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Decode, format!("invalid response: {err}"))
    }

    pub fn no_session() -> Self {
        Self::new(ErrorCode::NoSession, "no active session")
    }

    pub fn is_unauthorized(&self) -> bool {
        self.code == ErrorCode::Unauthorized
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.status, &self.server_code) {
            (Some(status), Some(code)) => write!(f, "{} ({status} {code}): {}", self.code, self.message),
            (Some(status), None) => write!(f, "{} ({status}): {}", self.code, self.message),
            _ => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Extract `(code, message)` from the error envelopes the backend is known to send.
fn parse_error_body(body: &[u8]) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        let text = String::from_utf8_lossy(body).trim().to_owned();
        return (None, (!text.is_empty()).then_some(text));
    };

    let field = |v: &serde_json::Value, key: &str| v.get(key).and_then(|s| s.as_str()).map(String::from);

    match value.get("error") {
        Some(inner @ serde_json::Value::Object(_)) => (field(inner, "code"), field(inner, "message")),
        Some(serde_json::Value::String(msg)) => {
            (field(&value, "code"), field(&value, "message").or_else(|| Some(msg.clone())))
        }
        _ => (field(&value, "code"), field(&value, "message")),
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

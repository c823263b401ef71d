// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use reqwest::Method;

/// Descriptor for one backend call.
///
/// `workspace_scoped` only steers path rewriting inside the pipeline; it is
/// never serialized onto the wire.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub workspace_scoped: bool,
}

impl RequestOptions {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), body: None, workspace_scoped: false }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Nest this request under the active workspace, if one is selected.
    pub fn scoped(mut self) -> Self {
        self.workspace_scoped = true;
        self
    }
}

/// Rewrite `path` to `/workspace/{id}/...` when a workspace is selected.
///
/// Without a (non-empty) workspace the path is returned unchanged apart from
/// a leading `/` being ensured.
pub fn scope_path(path: &str, workspace: Option<&str>) -> String {
    let path = if path.starts_with('/') { path.to_owned() } else { format!("/{path}") };
    match workspace.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            let tail = if path == "/" { "" } else { path.as_str() };
            format!("/workspace/{id}{tail}")
        }
        None => path,
    }
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;

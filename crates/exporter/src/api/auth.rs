//! Environment-derived credentials guarding the HTTP surface.
//!
//! Two independent gates: HTTP Basic auth for the metrics endpoint
//! (`METRICS_USER`/`METRICS_PASS`) and a shared key for the reload endpoint
//! (`API_KEY`). An unset pair leaves the corresponding gate open; an unset
//! `API_KEY` disables reloads over HTTP entirely.

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fmt;

pub struct ApiAuth {
    api_key: Option<String>,
    metrics_user: Option<String>,
    metrics_pass: Option<String>,
}

impl fmt::Debug for ApiAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiAuth")
            .field("api_key_set", &self.api_key.is_some())
            .field("metrics_auth_set", &self.metrics_user.is_some())
            .finish()
    }
}

impl ApiAuth {
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty(std::env::var("API_KEY").ok()),
            metrics_user: non_empty(std::env::var("METRICS_USER").ok()),
            metrics_pass: non_empty(std::env::var("METRICS_PASS").ok()),
        }
    }

    pub fn open() -> Self {
        Self {
            api_key: None,
            metrics_user: None,
            metrics_pass: None,
        }
    }

    /// Fixed credentials, bypassing the environment. Used by tests and
    /// embedders.
    pub fn with_credentials(
        api_key: Option<&str>,
        metrics_user: Option<&str>,
        metrics_pass: Option<&str>,
    ) -> Self {
        Self {
            api_key: api_key.map(str::to_string),
            metrics_user: metrics_user.map(str::to_string),
            metrics_pass: metrics_pass.map(str::to_string),
        }
    }

    /// Whether reloads over HTTP are enabled at all.
    pub fn reload_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Validate the `X-API-Key` header against the configured key.
    pub fn reload_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.api_key else {
            return false;
        };
        headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|presented| presented == expected)
    }

    /// Validate HTTP Basic credentials for the metrics endpoint. Open when
    /// no credentials are configured.
    pub fn metrics_authorized(&self, headers: &HeaderMap) -> bool {
        let (Some(user), Some(pass)) = (&self.metrics_user, &self.metrics_pass) else {
            return true;
        };
        let Some(value) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
        else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        decoded == format!("{user}:{pass}")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

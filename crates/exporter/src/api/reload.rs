//! Authenticated configuration reload endpoint.

use crate::AppResources;
use crate::api::info::EXPORTER_TAG;
use crate::error::{EngineError, classify};
use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReloadResponse {
    pub config_revision: String,
    pub routes: usize,
    pub invalid_routes: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReloadError {
    pub error: String,
}

/// Force a configuration reload. A rejected candidate leaves the installed
/// snapshot in place, so a bad config pushed to disk never takes the
/// exporter down.
#[tracing::instrument(skip(resources, headers))]
#[utoipa::path(
    post,
    path = "/api/reload",
    tag = EXPORTER_TAG,
    operation_id = "Reload Configuration",
    summary = "Rebuild the configuration snapshot from its source",
    responses(
        (status = 200, description = "New snapshot installed", body = ReloadResponse),
        (status = 400, description = "Candidate configuration rejected, prior snapshot kept", body = ReloadError),
        (status = 401, description = "Missing or invalid API key"),
        (status = 403, description = "Reload endpoint disabled, no API key configured")
    ),
    security(
        ("ApiKeyHeader" = [])
    )
)]
pub async fn reload(
    axum::Extension(resources): axum::Extension<AppResources>,
    headers: HeaderMap,
) -> Response {
    if !resources.auth.reload_enabled() {
        return (
            StatusCode::FORBIDDEN,
            Json(ReloadError {
                error: "reload over http is disabled".to_string(),
            }),
        )
            .into_response();
    }
    if !resources.auth.reload_authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match resources.authority.force_reload() {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(ReloadResponse {
                config_revision: snapshot.revision.to_string(),
                routes: snapshot.routes.len(),
                invalid_routes: snapshot.invalid_routes.len(),
            }),
        )
            .into_response(),
        Err(error) => {
            let engine_error = EngineError::from(error);
            let classified = classify(&engine_error);
            resources
                .metrics
                .increment_config_error(classified.fingerprint);
            tracing::error!(error = %engine_error, "reload rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(ReloadError {
                    error: engine_error.to_string(),
                }),
            )
                .into_response()
        }
    }
}

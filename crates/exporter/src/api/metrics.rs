//! Prometheus metrics endpoint.

use crate::AppResources;
use crate::api::health::MISC_TAG;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

/// Prometheus metrics endpoint.
#[tracing::instrument(skip(resources, headers))]
#[utoipa::path(
    get,
    path = "/metrics",
    tag = MISC_TAG,
    operation_id = "Prometheus Metrics",
    responses(
        (status = 200, description = "Prometheus metrics in text exposition format", body = String, content_type = "text/plain"),
        (status = 401, description = "Missing or invalid Basic credentials")
    ),
    security(
        (),
        ("MetricsBasicAuth" = [])
    )
)]
pub async fn metrics(
    axum::Extension(resources): axum::Extension<AppResources>,
    headers: HeaderMap,
) -> Response {
    if !resources.auth.metrics_authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"metrics\"")],
            String::new(),
        )
            .into_response();
    }
    (StatusCode::OK, resources.metrics.render()).into_response()
}

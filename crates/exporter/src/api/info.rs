//! Runtime introspection endpoint.

use crate::AppResources;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Tag for OpenAPI documentation.
pub const EXPORTER_TAG: &str = "Exporter";

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RouteInfo {
    pub name: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InvalidRouteInfo {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InfoResponse {
    /// Exporter version.
    pub version: String,
    /// Revision marker of the installed configuration snapshot.
    pub config_revision: String,
    pub check_interval_seconds: u64,
    pub routes: Vec<RouteInfo>,
    pub invalid_routes: Vec<InvalidRouteInfo>,
    pub cycles_total: u64,
}

/// Current configuration and engine state, with secrets excluded.
#[tracing::instrument(skip(resources))]
#[utoipa::path(
    get,
    path = "/api/info",
    tag = EXPORTER_TAG,
    operation_id = "Exporter Info",
    summary = "Installed configuration and engine state",
    responses(
        (status = 200, description = "Current exporter state", body = InfoResponse)
    )
)]
pub async fn info(
    axum::Extension(resources): axum::Extension<AppResources>,
) -> Json<InfoResponse> {
    let snapshot = resources.authority.current();
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        config_revision: snapshot.revision.to_string(),
        check_interval_seconds: snapshot.settings.check_interval_seconds,
        routes: snapshot
            .routes
            .iter()
            .map(|route| RouteInfo {
                name: route.effective_name(),
                from: route.from.clone(),
                to: route.to.clone(),
            })
            .collect(),
        invalid_routes: snapshot
            .invalid_routes
            .iter()
            .map(|invalid| InvalidRouteInfo {
                name: invalid.name.clone(),
                reason: invalid.reason.clone(),
            })
            .collect(),
        cycles_total: resources.metrics.cycles_total(),
    })
}

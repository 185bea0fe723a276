//! HTTP front door for the exporter.
//!
//! Submodules:
//! - `metrics` - Prometheus metrics endpoint (/metrics)
//! - `health` - Health check endpoint (/healthz)
//! - `info` - Runtime introspection (/api/info)
//! - `reload` - Authenticated config reload (/api/reload)
//! - `auth` - Environment-derived credentials
//! - `openapi` - OpenAPI/Utoipa configuration

pub mod auth;
pub mod health;
pub mod info;
pub mod metrics;
pub mod openapi;
pub mod reload;

pub use health::MISC_TAG;
pub use info::EXPORTER_TAG;

use crate::AppResources;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Build the full router with all endpoints and middleware attached.
pub fn build_router(resources: AppResources) -> axum::Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .routes(routes!(metrics::metrics))
        .routes(routes!(health::health))
        .routes(routes!(info::info))
        .routes(routes!(reload::reload))
        .layer(axum::Extension(resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

/// Start the web server and run it until the shutdown future resolves.
pub async fn start_webserver(
    resources: AppResources,
    listen: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> color_eyre::Result<()> {
    let router = build_router(resources);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listen, "web server listening");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}

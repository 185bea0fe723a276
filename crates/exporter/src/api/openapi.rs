//! OpenAPI/Utoipa configuration.

use crate::api::{health::MISC_TAG, info::EXPORTER_TAG};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
};

/// Security addon for OpenAPI documentation.
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "ApiKeyHeader",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "X-API-Key",
                    "Shared key from the API_KEY environment variable.",
                ))),
            );
            let basic = HttpBuilder::new()
                .scheme(HttpAuthScheme::Basic)
                .description(Some(
                    "Credentials from the METRICS_USER and METRICS_PASS environment variables.",
                ))
                .build();
            components.add_security_scheme("MetricsBasicAuth", SecurityScheme::Http(basic));
        }
    }
}

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "Mail E2E Exporter API",
        description = "Black-box mail round-trip verification: sends tokened test messages over SMTP, confirms their arrival over IMAP and publishes the results as Prometheus metrics."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = EXPORTER_TAG, description = "Exporter state and control endpoints")
    )
)]
pub struct ApiDoc;

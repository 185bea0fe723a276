//! HTTP handler tests for the exporter endpoints.

use axum_test::TestServer;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mail_e2e_exporter::AppResources;
use mail_e2e_exporter::api::auth::ApiAuth;
use mail_e2e_exporter::api::build_router;
use mail_e2e_exporter::authority::ConfigAuthority;
use mail_e2e_exporter::config::{ConfigError, ConfigSource, RevisionMarker};
use mail_e2e_exporter::metrics::{MetricsSink, RouteLabels};
use std::sync::{Arc, Mutex};

const ONE_ROUTE: &str = r#"
accounts:
  alice:
    smtp:
      host: smtp.example.org
      username: alice@example.org
      password: pw
  bob:
    imap:
      host: imap.example.org
      username: bob@example.org
      password: pw
routes:
  - from: alice
    to: bob
"#;

#[derive(Debug)]
struct StaticSource {
    state: Arc<Mutex<(String, RevisionMarker)>>,
}

impl ConfigSource for StaticSource {
    fn fetch(&self) -> Result<(String, RevisionMarker), ConfigError> {
        Ok(self.state.lock().unwrap().clone())
    }

    fn revision(&self) -> Result<RevisionMarker, ConfigError> {
        Ok(self.state.lock().unwrap().1)
    }
}

struct Harness {
    server: TestServer,
    state: Arc<Mutex<(String, RevisionMarker)>>,
    metrics: Arc<MetricsSink>,
}

fn harness(auth: ApiAuth) -> Harness {
    let state = Arc::new(Mutex::new((ONE_ROUTE.to_string(), 1)));
    let authority = Arc::new(
        ConfigAuthority::bootstrap(Box::new(StaticSource {
            state: state.clone(),
        }))
        .expect("bootstrap"),
    );
    let metrics = Arc::new(MetricsSink::new("mail_", "test"));
    let resources = AppResources {
        authority,
        metrics: metrics.clone(),
        auth: Arc::new(auth),
    };
    let server = TestServer::new(build_router(resources)).expect("test server");
    Harness {
        server,
        state,
        metrics,
    }
}

#[tokio::test]
async fn healthz_returns_ok() {
    let harness = harness(ApiAuth::open());
    let response = harness.server.get("/healthz").await;
    response.assert_status_ok();
    response.assert_text("ok");
}

#[tokio::test]
async fn metrics_render_without_credentials_when_unconfigured() {
    let harness = harness(ApiAuth::open());
    harness.metrics.mark_cycle(1, 0);
    harness.metrics.set_send_outcome(
        &RouteLabels {
            route: "alice->bob".into(),
            from: "alice".into(),
            to: "bob".into(),
        },
        true,
        Some(1_000.0),
    );

    let response = harness.server.get("/metrics").await;
    response.assert_status_ok();
    let body = response.text();
    assert!(body.contains("mail_cycles_total 1"));
    assert!(body.contains(
        "mail_send_success{route=\"alice->bob\",from=\"alice\",to=\"bob\"} 1"
    ));
}

#[tokio::test]
async fn metrics_enforce_basic_auth_when_configured() {
    let harness = harness(ApiAuth::with_credentials(None, Some("prom"), Some("scrape")));

    let denied = harness.server.get("/metrics").await;
    denied.assert_status_unauthorized();
    assert_eq!(
        denied.headers().get("www-authenticate").unwrap(),
        "Basic realm=\"metrics\""
    );

    let credentials = BASE64.encode("prom:scrape");
    let allowed = harness
        .server
        .get("/metrics")
        .add_header("authorization", format!("Basic {credentials}"))
        .await;
    allowed.assert_status_ok();
}

#[tokio::test]
async fn info_exposes_routes_without_secrets() {
    let harness = harness(ApiAuth::open());
    let response = harness.server.get("/api/info").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["config_revision"], "1");
    assert_eq!(body["routes"][0]["name"], "alice->bob");
    assert_eq!(body["invalid_routes"].as_array().unwrap().len(), 0);
    assert!(!response.text().contains("pw"));
}

#[tokio::test]
async fn reload_is_forbidden_without_configured_key() {
    let harness = harness(ApiAuth::open());
    let response = harness.server.post("/api/reload").await;
    response.assert_status_forbidden();
}

#[tokio::test]
async fn reload_rejects_wrong_key() {
    let harness = harness(ApiAuth::with_credentials(Some("sekrit"), None, None));
    let response = harness
        .server
        .post("/api/reload")
        .add_header("x-api-key", "nope")
        .await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn reload_installs_new_snapshot() {
    let harness = harness(ApiAuth::with_credentials(Some("sekrit"), None, None));
    *harness.state.lock().unwrap() = ("routes: []".to_string(), 2);

    let response = harness
        .server
        .post("/api/reload")
        .add_header("x-api-key", "sekrit")
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["config_revision"], "2");
    assert_eq!(body["routes"], 0);

    let info = harness.server.get("/api/info").await;
    let body: serde_json::Value = info.json();
    assert_eq!(body["routes"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn rejected_reload_keeps_prior_snapshot() {
    let harness = harness(ApiAuth::with_credentials(Some("sekrit"), None, None));
    *harness.state.lock().unwrap() = (": broken yaml :::".to_string(), 2);

    let response = harness
        .server
        .post("/api/reload")
        .add_header("x-api-key", "sekrit")
        .await;
    response.assert_status_bad_request();

    // Installed snapshot is untouched and the failure is surfaced in the
    // exposition.
    let info = harness.server.get("/api/info").await;
    let body: serde_json::Value = info.json();
    assert_eq!(body["config_revision"], "1");
    assert_eq!(body["routes"].as_array().unwrap().len(), 1);
    assert!(
        harness
            .metrics
            .render()
            .contains("mail_config_errors_total 1")
    );
}

#[tokio::test]
async fn redoc_is_served() {
    let harness = harness(ApiAuth::open());
    let response = harness.server.get("/api-docs").await;
    response.assert_status_ok();
}

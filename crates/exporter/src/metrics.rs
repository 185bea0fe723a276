//! Per-route metric state and the Prometheus text exposition built from it.
//!
//! The engine is the only writer; the HTTP layer only reads. Every update
//! replaces a route's whole state record, so a concurrent scrape sees either
//! the previous cycle's record or the new one, never a torn mix.

use crate::config::ExporterSettings;
use crate::error::Step;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

/// Identity labels attached to every per-route series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLabels {
    pub route: String,
    pub from: String,
    pub to: String,
}

/// Latest published values for one route. Owned exclusively by the engine;
/// replaced wholesale, never mutated in place once published.
#[derive(Debug, Clone)]
pub struct RouteMetricState {
    pub from: String,
    pub to: String,
    pub send_success: Option<bool>,
    pub receive_success: Option<bool>,
    pub last_send_timestamp: Option<f64>,
    pub last_receive_timestamp: Option<f64>,
    pub roundtrip_seconds: Option<f64>,
    pub receive_attempted: bool,
    pub receive_skipped: bool,
    /// Cumulative error count per failing step.
    pub errors: BTreeMap<Step, u64>,
    /// Fingerprint of the last observed error, 0 when none was seen yet.
    pub last_error_fingerprint: u64,
}

impl RouteMetricState {
    fn new(labels: &RouteLabels) -> Self {
        Self {
            from: labels.from.clone(),
            to: labels.to.clone(),
            send_success: None,
            receive_success: None,
            last_send_timestamp: None,
            last_receive_timestamp: None,
            roundtrip_seconds: None,
            receive_attempted: false,
            receive_skipped: false,
            errors: BTreeMap::new(),
            last_error_fingerprint: 0,
        }
    }
}

#[derive(Debug)]
pub struct MetricsSink {
    prefix: String,
    version: String,
    routes: DashMap<String, Arc<RouteMetricState>>,
    config: RwLock<Option<ExporterSettings>>,
    cycles_total: AtomicU64,
    last_cycle_timestamp: AtomicU64,
    routes_configured: AtomicU64,
    invalid_routes: AtomicU64,
    config_errors_total: AtomicU64,
    last_config_error_fingerprint: AtomicU64,
}

impl MetricsSink {
    pub fn new(prefix: &str, version: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            version: version.to_string(),
            routes: DashMap::new(),
            config: RwLock::new(None),
            cycles_total: AtomicU64::new(0),
            last_cycle_timestamp: AtomicU64::new(0),
            routes_configured: AtomicU64::new(0),
            invalid_routes: AtomicU64::new(0),
            config_errors_total: AtomicU64::new(0),
            last_config_error_fingerprint: AtomicU64::new(0),
        }
    }

    /// Clone-modify-replace, keeping the published record whole at all
    /// times.
    fn update_route(&self, labels: &RouteLabels, apply: impl FnOnce(&mut RouteMetricState)) {
        let mut state = self
            .routes
            .get(&labels.route)
            .map(|entry| (**entry.value()).clone())
            .unwrap_or_else(|| RouteMetricState::new(labels));
        state.from = labels.from.clone();
        state.to = labels.to.clone();
        apply(&mut state);
        self.routes.insert(labels.route.clone(), Arc::new(state));
    }

    /// Ensure the route's info series exists, without touching outcomes.
    pub fn set_route_info(&self, labels: &RouteLabels) {
        self.update_route(labels, |_| {});
    }

    /// Record the send outcome. On success the last-send timestamp is
    /// published immediately, independent of how the receive side ends.
    pub fn set_send_outcome(&self, labels: &RouteLabels, ok: bool, sent_at: Option<f64>) {
        self.update_route(labels, |state| {
            state.send_success = Some(ok);
            if let Some(ts) = sent_at {
                state.last_send_timestamp = Some(ts);
            }
        });
    }

    /// Record that the receive phase started polling. Published before the
    /// wait completes so a scrape during the poll window sees the current
    /// cycle's attempt, not the previous one's.
    pub fn set_receive_started(&self, labels: &RouteLabels) {
        self.update_route(labels, |state| {
            state.receive_attempted = true;
            state.receive_skipped = false;
        });
    }

    /// Record that the receive phase was skipped because the send failed.
    /// The previous receive outcome is deliberately left untouched.
    pub fn set_receive_skipped(&self, labels: &RouteLabels) {
        self.update_route(labels, |state| {
            state.receive_attempted = false;
            state.receive_skipped = true;
        });
    }

    pub fn set_receive_outcome(
        &self,
        labels: &RouteLabels,
        ok: bool,
        roundtrip_seconds: Option<f64>,
        received_at: Option<f64>,
    ) {
        self.update_route(labels, |state| {
            state.receive_attempted = true;
            state.receive_skipped = false;
            state.receive_success = Some(ok);
            if ok {
                state.roundtrip_seconds = roundtrip_seconds;
                state.last_receive_timestamp = received_at;
            }
        });
    }

    pub fn increment_error(&self, labels: &RouteLabels, step: Step, fingerprint: u64) {
        self.update_route(labels, |state| {
            *state.errors.entry(step).or_insert(0) += 1;
            state.last_error_fingerprint = fingerprint;
        });
    }

    /// Config failures that are not attributable to a single route, e.g. a
    /// rejected reload.
    pub fn increment_config_error(&self, fingerprint: u64) {
        self.config_errors_total.fetch_add(1, Ordering::Relaxed);
        self.last_config_error_fingerprint
            .store(fingerprint, Ordering::Relaxed);
    }

    pub fn set_config_gauges(&self, settings: &ExporterSettings) {
        match self.config.write() {
            Ok(mut guard) => *guard = Some(settings.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(settings.clone()),
        }
    }

    /// Mark a completed tick. Runs for empty route sets too, so operators
    /// can tell "running with nothing configured" from "not running".
    pub fn mark_cycle(&self, valid_routes: usize, invalid_routes: usize) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        self.routes_configured
            .store(valid_routes as u64, Ordering::Relaxed);
        self.invalid_routes
            .store(invalid_routes as u64, Ordering::Relaxed);
        self.last_cycle_timestamp.store(
            OffsetDateTime::now_utc().unix_timestamp().max(0) as u64,
            Ordering::Relaxed,
        );
    }

    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    /// Latest published state for one route, mainly for tests and
    /// introspection.
    pub fn route_state(&self, route: &str) -> Option<Arc<RouteMetricState>> {
        self.routes.get(route).map(|entry| Arc::clone(entry.value()))
    }

    /// Render the full text exposition.
    pub fn render(&self) -> String {
        let p = &self.prefix;
        // Deterministic output order keeps scrapes diffable.
        let routes: BTreeMap<String, Arc<RouteMetricState>> = self
            .routes
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut buf = String::new();

        let _ = writeln!(
            buf,
            "# HELP {p}build_info Build and version information for the exporter.\n# TYPE {p}build_info gauge"
        );
        let _ = writeln!(
            buf,
            "{p}build_info{{version=\"{}\"}} 1",
            escape_label(&self.version)
        );

        let _ = writeln!(
            buf,
            "# HELP {p}routes_configured Number of valid routes in the last completed cycle.\n# TYPE {p}routes_configured gauge"
        );
        let _ = writeln!(
            buf,
            "{p}routes_configured {}",
            self.routes_configured.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            buf,
            "# HELP {p}routes_invalid Number of configured routes excluded by validation.\n# TYPE {p}routes_invalid gauge"
        );
        let _ = writeln!(
            buf,
            "{p}routes_invalid {}",
            self.invalid_routes.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            buf,
            "# HELP {p}cycles_total Completed test cycles since process start.\n# TYPE {p}cycles_total counter"
        );
        let _ = writeln!(buf, "{p}cycles_total {}", self.cycles_total.load(Ordering::Relaxed));
        let last_cycle = self.last_cycle_timestamp.load(Ordering::Relaxed);
        if last_cycle > 0 {
            let _ = writeln!(
                buf,
                "# HELP {p}last_cycle_timestamp Unix timestamp of the last completed cycle.\n# TYPE {p}last_cycle_timestamp gauge"
            );
            let _ = writeln!(buf, "{p}last_cycle_timestamp {last_cycle}");
        }

        let settings = match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(settings) = settings {
            let gauges: [(&str, &str, u64); 5] = [
                (
                    "config_check_interval_seconds",
                    "Configured check interval in seconds.",
                    settings.check_interval_seconds,
                ),
                (
                    "config_receive_timeout_seconds",
                    "Configured receive timeout in seconds.",
                    settings.receive_timeout_seconds,
                ),
                (
                    "config_receive_poll_seconds",
                    "Configured receive poll interval in seconds.",
                    settings.receive_poll_seconds,
                ),
                (
                    "config_smtp_timeout_seconds",
                    "Configured SMTP timeout in seconds.",
                    settings.smtp_timeout_seconds,
                ),
                (
                    "config_delete_testmail_after_verify",
                    "1 if matched test messages are deleted after verification.",
                    u64::from(settings.delete_testmail_after_verify),
                ),
            ];
            for (name, help, value) in gauges {
                let _ = writeln!(buf, "# HELP {p}{name} {help}\n# TYPE {p}{name} gauge");
                let _ = writeln!(buf, "{p}{name} {value}");
            }
        }

        let config_errors = self.config_errors_total.load(Ordering::Relaxed);
        let _ = writeln!(
            buf,
            "# HELP {p}config_errors_total Rejected reloads and other route-independent config failures.\n# TYPE {p}config_errors_total counter"
        );
        let _ = writeln!(buf, "{p}config_errors_total {config_errors}");
        let _ = writeln!(
            buf,
            "# HELP {p}last_config_error_info Fingerprint of the last config failure, 0 when none.\n# TYPE {p}last_config_error_info gauge"
        );
        let _ = writeln!(
            buf,
            "{p}last_config_error_info {}",
            self.last_config_error_fingerprint.load(Ordering::Relaxed)
        );

        if routes.is_empty() {
            return buf;
        }

        let _ = writeln!(
            buf,
            "# HELP {p}test_info Maps each route to its sender and receiver accounts, always 1.\n# TYPE {p}test_info gauge"
        );
        for (route, state) in &routes {
            let _ = writeln!(buf, "{p}test_info{{{}}} 1", labels_for(route, state));
        }

        let _ = writeln!(
            buf,
            "# HELP {p}send_success 1 if the last SMTP send succeeded, else 0.\n# TYPE {p}send_success gauge"
        );
        for (route, state) in &routes {
            if let Some(ok) = state.send_success {
                let _ = writeln!(
                    buf,
                    "{p}send_success{{{}}} {}",
                    labels_for(route, state),
                    u64::from(ok)
                );
            }
        }

        let _ = writeln!(
            buf,
            "# HELP {p}receive_success 1 if the last receive attempt found the test message, else 0.\n# TYPE {p}receive_success gauge"
        );
        for (route, state) in &routes {
            if let Some(ok) = state.receive_success {
                let _ = writeln!(
                    buf,
                    "{p}receive_success{{{}}} {}",
                    labels_for(route, state),
                    u64::from(ok)
                );
            }
        }

        let _ = writeln!(
            buf,
            "# HELP {p}receive_attempted 1 if the receive phase ran in the last cycle, else 0.\n# TYPE {p}receive_attempted gauge"
        );
        for (route, state) in &routes {
            let _ = writeln!(
                buf,
                "{p}receive_attempted{{{}}} {}",
                labels_for(route, state),
                u64::from(state.receive_attempted)
            );
        }

        let _ = writeln!(
            buf,
            "# HELP {p}receive_skipped 1 if the receive phase was skipped due to a send failure, else 0.\n# TYPE {p}receive_skipped gauge"
        );
        for (route, state) in &routes {
            let _ = writeln!(
                buf,
                "{p}receive_skipped{{{}}} {}",
                labels_for(route, state),
                u64::from(state.receive_skipped)
            );
        }

        let _ = writeln!(
            buf,
            "# HELP {p}roundtrip_seconds Seconds from successful send to observed receipt.\n# TYPE {p}roundtrip_seconds gauge"
        );
        for (route, state) in &routes {
            if let Some(roundtrip) = state.roundtrip_seconds {
                let _ = writeln!(
                    buf,
                    "{p}roundtrip_seconds{{{}}} {roundtrip}",
                    labels_for(route, state)
                );
            }
        }

        let _ = writeln!(
            buf,
            "# HELP {p}last_send_timestamp Unix timestamp of the last successful send.\n# TYPE {p}last_send_timestamp gauge"
        );
        for (route, state) in &routes {
            if let Some(ts) = state.last_send_timestamp {
                let _ = writeln!(
                    buf,
                    "{p}last_send_timestamp{{{}}} {ts}",
                    labels_for(route, state)
                );
            }
        }

        let _ = writeln!(
            buf,
            "# HELP {p}last_receive_timestamp Unix timestamp of the last observed receipt.\n# TYPE {p}last_receive_timestamp gauge"
        );
        for (route, state) in &routes {
            if let Some(ts) = state.last_receive_timestamp {
                let _ = writeln!(
                    buf,
                    "{p}last_receive_timestamp{{{}}} {ts}",
                    labels_for(route, state)
                );
            }
        }

        let _ = writeln!(
            buf,
            "# HELP {p}test_errors_total Errors per route and failing step.\n# TYPE {p}test_errors_total counter"
        );
        for (route, state) in &routes {
            for (step, count) in &state.errors {
                let _ = writeln!(
                    buf,
                    "{p}test_errors_total{{{},step=\"{step}\"}} {count}",
                    labels_for(route, state)
                );
            }
        }

        let _ = writeln!(
            buf,
            "# HELP {p}last_error_info Fingerprint of the last error on this route, 0 when none.\n# TYPE {p}last_error_info gauge"
        );
        for (route, state) in &routes {
            let _ = writeln!(
                buf,
                "{p}last_error_info{{{}}} {}",
                labels_for(route, state),
                state.last_error_fingerprint
            );
        }

        buf
    }
}

fn labels_for(route: &str, state: &RouteMetricState) -> String {
    format!(
        "route=\"{}\",from=\"{}\",to=\"{}\"",
        escape_label(route),
        escape_label(&state.from),
        escape_label(&state.to)
    )
}

fn escape_label(val: &str) -> String {
    let mut out = String::with_capacity(val.len() + 4);
    for c in val.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> RouteLabels {
        RouteLabels {
            route: "alice->bob".into(),
            from: "alice".into(),
            to: "bob".into(),
        }
    }

    #[test]
    fn whole_record_replacement_keeps_untouched_fields() {
        let sink = MetricsSink::new("mail_", "0.0.0");
        sink.set_receive_outcome(&labels(), true, Some(12.5), Some(1000.0));
        sink.set_send_outcome(&labels(), false, None);

        let state = sink.route_state("alice->bob").unwrap();
        assert_eq!(state.send_success, Some(false));
        // Prior receive success survives a later send-only update.
        assert_eq!(state.receive_success, Some(true));
        assert_eq!(state.roundtrip_seconds, Some(12.5));
    }

    #[test]
    fn receive_start_flips_attempt_flags_only() {
        let sink = MetricsSink::new("mail_", "0.0.0");
        sink.set_receive_outcome(&labels(), false, None, None);
        sink.set_receive_skipped(&labels());
        sink.set_receive_started(&labels());

        let state = sink.route_state("alice->bob").unwrap();
        assert!(state.receive_attempted);
        assert!(!state.receive_skipped);
        // The outcome of the previous completed wait stands until this one
        // finishes.
        assert_eq!(state.receive_success, Some(false));
    }

    #[test]
    fn render_escapes_label_values() {
        let sink = MetricsSink::new("mail_", "0.0.0");
        sink.set_route_info(&RouteLabels {
            route: "odd\"route".into(),
            from: "a".into(),
            to: "b".into(),
        });
        let body = sink.render();
        assert!(body.contains("route=\"odd\\\"route\""));
    }

    #[test]
    fn placeholder_series_present_without_routes() {
        let sink = MetricsSink::new("mail_", "0.0.0");
        sink.mark_cycle(0, 0);
        let body = sink.render();
        assert!(body.contains("mail_routes_configured 0"));
        assert!(body.contains("mail_cycles_total 1"));
        assert!(body.contains("mail_build_info{version=\"0.0.0\"} 1"));
        assert!(!body.contains("mail_send_success{"));
    }
}

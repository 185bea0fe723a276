//! Per-route round-trip driver: send the probe, wait for it, publish the
//! outcome.
//!
//! Send and receive are strictly ordered. A failed send skips the receive
//! phase entirely and the previous receive outcome stays published, so a
//! temporary SMTP outage does not fabricate a delivery failure.

use crate::config::{ConfigSnapshot, RouteConfig};
use crate::error::{classify, EngineError};
use crate::metrics::{MetricsSink, RouteLabels};
use crate::receiver::MailReceiver;
use crate::sender::{MailSender, TestMessage};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::Instant;

pub struct RouteCycleRunner {
    sender: Arc<dyn MailSender>,
    receiver: Arc<dyn MailReceiver>,
    metrics: Arc<MetricsSink>,
}

impl RouteCycleRunner {
    pub fn new(
        sender: Arc<dyn MailSender>,
        receiver: Arc<dyn MailReceiver>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            sender,
            receiver,
            metrics,
        }
    }

    /// Run one complete round-trip for one route. Never returns an error;
    /// every failure ends up classified in the metrics instead.
    pub async fn run_route(&self, snapshot: &ConfigSnapshot, route: &RouteConfig) {
        let labels = RouteLabels {
            route: route.effective_name(),
            from: route.from.clone(),
            to: route.to.clone(),
        };
        self.metrics.set_route_info(&labels);
        let probe = TestMessage::new(&snapshot.settings.subject_prefix, &labels.route);

        if let Err(error) = self.sender.send(snapshot, route, &probe).await {
            let permanent = error.is_permanent();
            let error = EngineError::from(error);
            let classified = classify(&error);
            tracing::warn!(route = %labels.route, permanent, error = %error, "send failed");
            self.metrics.set_send_outcome(&labels, false, None);
            self.metrics.set_receive_skipped(&labels);
            self.metrics
                .increment_error(&labels, classified.step, classified.fingerprint);
            return;
        }
        // Roundtrip is anchored at transport acceptance, so SMTP submission
        // time never counts against delivery latency.
        let sent_at = unix_now();
        let send_accepted = Instant::now();
        self.metrics.set_send_outcome(&labels, true, Some(sent_at));
        self.metrics.set_receive_started(&labels);
        tracing::info!(route = %labels.route, token = %probe.token, "test message sent");

        match self.receiver.wait_for(snapshot, route, &probe).await {
            Ok(receipt) => {
                let roundtrip = send_accepted.elapsed().as_secs_f64();
                self.metrics
                    .set_receive_outcome(&labels, true, Some(roundtrip), Some(unix_now()));
                tracing::info!(
                    route = %labels.route,
                    folder = %receipt.folder,
                    roundtrip_seconds = roundtrip,
                    "round-trip verified"
                );
            }
            Err(error) => {
                let error = EngineError::from(error);
                let classified = classify(&error);
                tracing::warn!(route = %labels.route, error = %error, "receive failed");
                self.metrics.set_receive_outcome(&labels, false, None, None);
                self.metrics
                    .increment_error(&labels, classified.step, classified.fingerprint);
            }
        }
    }
}

fn unix_now() -> f64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp_nanos() as f64 / 1e9
}

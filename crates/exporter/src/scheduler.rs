//! Recurring check loop: refresh configuration, fan the routes out with
//! bounded concurrency, publish cycle-level metrics, sleep, repeat.
//!
//! A new cycle only starts after the previous one finished completely, so a
//! slow receive can delay the schedule but two cycles never overlap.

use crate::authority::ConfigAuthority;
use crate::cycle::RouteCycleRunner;
use crate::error::{classify, EngineError};
use crate::metrics::MetricsSink;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct Scheduler {
    authority: Arc<ConfigAuthority>,
    runner: Arc<RouteCycleRunner>,
    metrics: Arc<MetricsSink>,
}

impl Scheduler {
    pub fn new(
        authority: Arc<ConfigAuthority>,
        runner: Arc<RouteCycleRunner>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            authority,
            runner,
            metrics,
        }
    }

    /// Run cycles until the shutdown signal fires. The signal is honored
    /// between cycles; an in-flight cycle runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.run_cycle().await;
            let interval = self
                .authority
                .current()
                .settings
                .check_interval_seconds;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                _ = shutdown.changed() => {
                    tracing::info!("check scheduler stopping");
                    return;
                }
            }
        }
    }

    /// One complete cycle over the currently-installed snapshot. Runs even
    /// with zero routes so the cycle counter keeps proving liveness.
    pub async fn run_cycle(&self) {
        if let Err(error) = self.authority.reload_if_stale() {
            let error = EngineError::from(error);
            let classified = classify(&error);
            tracing::error!(error = %error, "config reload rejected, keeping installed snapshot");
            self.metrics.increment_config_error(classified.fingerprint);
        }
        let snapshot = self.authority.current();
        self.metrics.set_config_gauges(&snapshot.settings);

        let concurrency = snapshot.settings.max_concurrent_routes.max(1);
        tracing::debug!(
            routes = snapshot.routes.len(),
            concurrency,
            "starting check cycle"
        );
        futures::stream::iter(snapshot.routes.iter())
            .for_each_concurrent(concurrency, |route| {
                let runner = Arc::clone(&self.runner);
                let snapshot = Arc::clone(&snapshot);
                async move {
                    runner.run_route(&snapshot, route).await;
                }
            })
            .await;

        self.metrics
            .mark_cycle(snapshot.routes.len(), snapshot.invalid_routes.len());
    }
}

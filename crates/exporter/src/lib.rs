//! Black-box mail delivery verification.
//!
//! Sends uniquely-tokened test messages over SMTP, confirms their arrival
//! over IMAP and publishes per-route results as Prometheus metrics. A mail
//! platform that accepts messages but silently drops them shows up here as a
//! failing round-trip, which no queue-depth or connection metric catches.

use std::sync::Arc;

use crate::api::auth::ApiAuth;
use crate::authority::ConfigAuthority;
use crate::metrics::MetricsSink;

pub mod api;
pub mod authority;
pub mod config;
pub mod cycle;
pub mod error;
pub mod metrics;
pub mod providers;
pub mod receiver;
pub mod scheduler;
pub mod sender;

#[derive(Clone)]
pub struct AppResources {
    pub authority: Arc<ConfigAuthority>,
    pub metrics: Arc<MetricsSink>,
    pub auth: Arc<ApiAuth>,
}

//! Snapshot authority: owns the currently-installed [`ConfigSnapshot`] and
//! the reload protocol around it.
//!
//! Reloads build the candidate snapshot entirely outside the lock and only
//! then swap it in, so `current()` never waits on a parse in progress and a
//! cycle holding the old snapshot is never invalidated mid-flight. A failed
//! reload leaves the prior valid snapshot authoritative.

use crate::config::{ConfigError, ConfigSnapshot, ConfigSource};
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct ConfigAuthority {
    source: Box<dyn ConfigSource>,
    installed: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigAuthority {
    /// Load the initial snapshot from the source. Startup fails hard on an
    /// invalid config; only later reloads fall back to the installed one.
    pub fn bootstrap(source: Box<dyn ConfigSource>) -> Result<Self, ConfigError> {
        let snapshot = build_snapshot(source.as_ref())?;
        Ok(Self {
            source,
            installed: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// The currently-installed snapshot. Never blocks on a reload.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        match self.installed.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Compare the source's revision marker against the installed snapshot
    /// and reload when it moved. Returns whether a new snapshot was
    /// installed.
    pub fn reload_if_stale(&self) -> Result<bool, ConfigError> {
        let fresh = self.source.revision()?;
        if fresh == self.current().revision {
            return Ok(false);
        }
        self.force_reload().map(|_| true)
    }

    /// Unconditionally rebuild from the source and install the result.
    pub fn force_reload(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let snapshot = Arc::new(build_snapshot(self.source.as_ref())?);
        match self.installed.write() {
            Ok(mut guard) => *guard = Arc::clone(&snapshot),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&snapshot),
        }
        tracing::info!(
            revision = %snapshot.revision,
            routes = snapshot.routes.len(),
            invalid_routes = snapshot.invalid_routes.len(),
            "configuration snapshot installed"
        );
        Ok(snapshot)
    }
}

fn build_snapshot(source: &dyn ConfigSource) -> Result<ConfigSnapshot, ConfigError> {
    let (content, revision) = source.fetch()?;
    ConfigSnapshot::from_yaml(&content, revision)
}

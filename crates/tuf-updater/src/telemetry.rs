//! Telemetry hooks for the updater.
//!
//! [`UpdaterTelemetry`] receives an event for every accepted metadata object,
//! root rotation, refresh outcome and verified download. [`CountingTelemetry`]
//! keeps atomic counters that embedders can export to any metric backend;
//! [`CompositeTelemetry`] fans events out to several observers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TrustError;

/// Observer of updater activity. Every method defaults to a no-op.
pub trait UpdaterTelemetry: Send + Sync {
    /// A metadata object for `role` was verified and trusted.
    fn on_metadata_accepted(&self, _role: &str, _version: u64) {}

    /// The trusted root moved to `version`.
    fn on_root_rotated(&self, _version: u64) {}

    /// A refresh committed new trusted state.
    fn on_refresh_completed(&self, _elapsed: Duration) {}

    /// A refresh failed; trusted state is unchanged.
    fn on_refresh_failed(&self, _error: &TrustError) {}

    /// A target passed verification and was written to its destination.
    fn on_target_downloaded(&self, _path: &str, _length: u64) {}
}

/// Telemetry sink that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl UpdaterTelemetry for NoopTelemetry {}

/// Aggregated telemetry counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    metadata_accepted: AtomicU64,
    root_rotations: AtomicU64,
    refresh_success: AtomicU64,
    refresh_error: AtomicU64,
    rollback_rejected: AtomicU64,
    targets_downloaded: AtomicU64,
    target_bytes: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            metadata_accepted: self.metadata_accepted.load(Ordering::Relaxed),
            root_rotations: self.root_rotations.load(Ordering::Relaxed),
            refresh_success: self.refresh_success.load(Ordering::Relaxed),
            refresh_error: self.refresh_error.load(Ordering::Relaxed),
            rollback_rejected: self.rollback_rejected.load(Ordering::Relaxed),
            targets_downloaded: self.targets_downloaded.load(Ordering::Relaxed),
            target_bytes: self.target_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Metadata objects accepted into trusted state.
    pub metadata_accepted: u64,
    /// Root versions accepted after bootstrap.
    pub root_rotations: u64,
    /// Successful refreshes.
    pub refresh_success: u64,
    /// Failed refreshes.
    pub refresh_error: u64,
    /// Failed refreshes caused by a rollback attempt.
    pub rollback_rejected: u64,
    /// Targets verified and written.
    pub targets_downloaded: u64,
    /// Total bytes of verified targets.
    pub target_bytes: u64,
}

impl fmt::Display for TelemetrySnapshot {
    /// Formats the snapshot metrics into a comma-separated list for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "metadata_accepted={}, root_rotations={}, refresh_success={}, refresh_error={}, \
             rollback_rejected={}, targets_downloaded={}, target_bytes={}",
            self.metadata_accepted,
            self.root_rotations,
            self.refresh_success,
            self.refresh_error,
            self.rollback_rejected,
            self.targets_downloaded,
            self.target_bytes
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every signal.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    /// Creates a new telemetry instance backed by the provided counter set.
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl UpdaterTelemetry for CountingTelemetry {
    fn on_metadata_accepted(&self, _role: &str, _version: u64) {
        self.counters
            .metadata_accepted
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_root_rotated(&self, _version: u64) {
        self.counters.root_rotations.fetch_add(1, Ordering::Relaxed);
    }

    fn on_refresh_completed(&self, _elapsed: Duration) {
        self.counters
            .refresh_success
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_refresh_failed(&self, error: &TrustError) {
        self.counters.refresh_error.fetch_add(1, Ordering::Relaxed);
        if matches!(error, TrustError::RollbackAttack { .. }) {
            self.counters
                .rollback_rejected
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_target_downloaded(&self, _path: &str, length: u64) {
        self.counters
            .targets_downloaded
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .target_bytes
            .fetch_add(length, Ordering::Relaxed);
    }
}

/// Telemetry implementation that forwards events to multiple observers.
#[derive(Default)]
pub struct CompositeTelemetry {
    observers: Vec<Arc<dyn UpdaterTelemetry>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a telemetry observer to the dispatcher.
    pub fn with_observer(mut self, telemetry: Arc<dyn UpdaterTelemetry>) -> Self {
        self.observers.push(telemetry);
        self
    }
}

impl fmt::Debug for CompositeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTelemetry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

impl UpdaterTelemetry for CompositeTelemetry {
    fn on_metadata_accepted(&self, role: &str, version: u64) {
        for observer in &self.observers {
            observer.on_metadata_accepted(role, version);
        }
    }

    fn on_root_rotated(&self, version: u64) {
        for observer in &self.observers {
            observer.on_root_rotated(version);
        }
    }

    fn on_refresh_completed(&self, elapsed: Duration) {
        for observer in &self.observers {
            observer.on_refresh_completed(elapsed);
        }
    }

    fn on_refresh_failed(&self, error: &TrustError) {
        for observer in &self.observers {
            observer.on_refresh_failed(error);
        }
    }

    fn on_target_downloaded(&self, path: &str, length: u64) {
        for observer in &self.observers {
            observer.on_target_downloaded(path, length);
        }
    }
}

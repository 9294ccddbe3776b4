//! Operational counters of a [`Decider`](crate::Decider).
//!
//! Every outcome is counted twice: in the per-decider [`DeciderStats`], and through the
//! [`metrics`] facade as `decider_client_total{operation, success, error_type, pkg_version}`.
//! The latter is a no-op until the host application installs a recorder (e.g., a Prometheus
//! exporter).
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

use crate::Error;

/// Name of the labelled outcome counter reported through [`metrics`].
pub const CLIENT_COUNTER: &str = "decider_client_total";

/// Counter of definitions dropped while parsing published snapshots.
pub const DEFINITION_WARNINGS_COUNTER: &str = "decider_definition_warnings_total";

/// Counters updated by the refresh thread and by exposure delivery.
///
/// All counters are monotonic for the lifetime of the decider.
#[derive(Debug, Default)]
pub struct DeciderStats {
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    snapshots_published: AtomicU64,
    definition_warnings: AtomicU64,
    exposures_emitted: AtomicU64,
    exposures_deduplicated: AtomicU64,
    delivery_failures: AtomicU64,
}

/// A point-in-time copy of [`DeciderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Number of refresh checks performed.
    pub refreshes: u64,
    /// Refresh checks that failed to read or parse the definitions file.
    pub refresh_failures: u64,
    /// Snapshots published, including the initial one.
    pub snapshots_published: u64,
    /// Definitions dropped across all published snapshots.
    pub definition_warnings: u64,
    /// Exposure events handed to the exposure logger.
    pub exposures_emitted: u64,
    /// Exposures skipped because the same request already exposed the experiment.
    pub exposures_deduplicated: u64,
    /// Exposure events the logger failed to deliver.
    pub delivery_failures: u64,
}

impl DeciderStats {
    pub(crate) fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_failure(&self, err: &Error) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        report("refresh", Some(error_type(err)));
    }

    pub(crate) fn record_published(&self, warnings: usize) {
        self.snapshots_published.fetch_add(1, Ordering::Relaxed);
        self.definition_warnings
            .fetch_add(warnings as u64, Ordering::Relaxed);
        report("publish", None);
        counter!(DEFINITION_WARNINGS_COUNTER).increment(warnings as u64);
    }

    /// Count an event handed to the exposure logger, and whether the logger accepted it.
    pub(crate) fn record_exposure(&self, delivered: bool) {
        self.exposures_emitted.fetch_add(1, Ordering::Relaxed);
        if delivered {
            report("expose", None);
        } else {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
            report("expose", Some("delivery"));
        }
    }

    pub(crate) fn record_deduplicated(&self) {
        self.exposures_deduplicated.fetch_add(1, Ordering::Relaxed);
        report("expose_deduplicated", None);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
            definition_warnings: self.definition_warnings.load(Ordering::Relaxed),
            exposures_emitted: self.exposures_emitted.load(Ordering::Relaxed),
            exposures_deduplicated: self.exposures_deduplicated.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

fn report(operation: &'static str, error_type: Option<&'static str>) {
    let labels = [
        ("operation", operation),
        ("success", if error_type.is_none() { "true" } else { "false" }),
        ("error_type", error_type.unwrap_or("")),
        ("pkg_version", env!("CARGO_PKG_VERSION")),
    ];
    counter!(CLIENT_COUNTER, &labels).increment(1);
}

fn error_type(err: &Error) -> &'static str {
    match err {
        Error::ConfigUnavailable { .. } => "unavailable",
        Error::ConfigParse(_) => "parse",
        Error::InvalidSettings(_) => "settings",
        Error::Cancelled => "cancelled",
        Error::RefreshThreadPanicked => "panic",
        Error::Io(_) => "io",
    }
}

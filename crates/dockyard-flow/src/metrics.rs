//! Pipeline metrics.
//!
//! Recorded through the `metrics` facade; the manager installs a Prometheus
//! recorder and serves it on `/metrics`. Without a recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `dockyard_watcher_polls_total` | Counter | `result` | Bucket polls by outcome |
//! | `dockyard_watcher_invalid_paths_total` | Counter | - | Objects that are not artifacts |
//! | `dockyard_work_items_emitted_total` | Counter | - | Work items handed to the dispatcher |
//! | `dockyard_ledger_transitions_total` | Counter | `from_state`, `to_state` | Ledger phase transitions |
//! | `dockyard_pipelines_in_flight` | Gauge | - | Pipelines claimed but not finished |
//! | `dockyard_build_duration_seconds` | Histogram | `result` | Build wall time |
//! | `dockyard_apply_total` | Counter | `kind`, `result` | Manifest applies |
//! | `dockyard_terminal_failures` | Gauge | - | Entries that exhausted their attempts |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: bucket polls by outcome.
    pub const WATCHER_POLLS_TOTAL: &str = "dockyard_watcher_polls_total";
    /// Counter: listed objects rejected by the identifier.
    pub const WATCHER_INVALID_PATHS_TOTAL: &str = "dockyard_watcher_invalid_paths_total";
    /// Counter: work items emitted by the watcher.
    pub const WORK_ITEMS_EMITTED_TOTAL: &str = "dockyard_work_items_emitted_total";
    /// Counter: ledger phase transitions.
    pub const LEDGER_TRANSITIONS_TOTAL: &str = "dockyard_ledger_transitions_total";
    /// Gauge: pipelines currently in flight.
    pub const PIPELINES_IN_FLIGHT: &str = "dockyard_pipelines_in_flight";
    /// Histogram: build duration in seconds.
    pub const BUILD_DURATION_SECONDS: &str = "dockyard_build_duration_seconds";
    /// Counter: manifest applies by kind and outcome.
    pub const APPLY_TOTAL: &str = "dockyard_apply_total";
    /// Gauge: entries in terminal failure.
    pub const TERMINAL_FAILURES: &str = "dockyard_terminal_failures";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome (success, failure, timeout).
    pub const RESULT: &str = "result";
    /// Phase before a transition.
    pub const FROM_STATE: &str = "from_state";
    /// Phase after a transition.
    pub const TO_STATE: &str = "to_state";
    /// Cluster resource kind.
    pub const KIND: &str = "kind";
}

/// Records pipeline metrics. Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records the outcome of one bucket poll.
    pub fn record_poll(&self, result: &str) {
        counter!(names::WATCHER_POLLS_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records a listed object that did not identify as an artifact.
    pub fn record_invalid_path(&self) {
        counter!(names::WATCHER_INVALID_PATHS_TOTAL).increment(1);
    }

    /// Records an emitted work item.
    pub fn record_work_item_emitted(&self) {
        counter!(names::WORK_ITEMS_EMITTED_TOTAL).increment(1);
    }

    /// Records a ledger phase transition. New entries transition from `none`.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::LEDGER_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Sets the number of in-flight pipelines.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_pipelines_in_flight(&self, count: usize) {
        gauge!(names::PIPELINES_IN_FLIGHT).set(count as f64);
    }

    /// Records how long a build took to reach a terminal state.
    pub fn observe_build_duration(&self, result: &str, duration: Duration) {
        histogram!(names::BUILD_DURATION_SECONDS, labels::RESULT => result.to_string())
            .record(duration.as_secs_f64());
    }

    /// Records one manifest apply.
    pub fn record_apply(&self, kind: &str, result: &str) {
        counter!(
            names::APPLY_TOTAL,
            labels::KIND => kind.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Sets the number of entries in terminal failure.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_terminal_failures(&self, count: usize) {
        gauge!(names::TERMINAL_FAILURES).set(count as f64);
    }
}

//! The queued work item and its kinds.

use std::collections::BTreeMap;

use arrow::record_batch::RecordBatch;
use data_types::{CorrelationId, DatasetName};

/// Bound call parameters carried by a task.
pub type Params = BTreeMap<String, String>;

/// Which queue a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Parallel network downloads, bounded by the rate-limit manager.
    Fast,

    /// Serialized planning and disk writes.
    Slow,

    /// Periodic low-priority housekeeping.
    Maint,
}

impl QueueName {
    /// Stable lowercase name for logs and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
            Self::Maint => "maint",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Housekeeping work accepted by the MAINT queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceKind {
    /// Rebuild the manifest of one dataset, or of every dataset.
    RebuildManifest {
        /// Restrict to one dataset; `None` covers the catalogue.
        dataset: Option<DatasetName>,
    },

    /// Merge multi-file year partitions of incremental datasets.
    Compact {
        /// Restrict to one dataset; `None` covers the catalogue.
        dataset: Option<DatasetName>,
    },

    /// Remove staging/old trees abandoned by interrupted full-replace
    /// swaps.
    Sweep,
}

impl MaintenanceKind {
    /// Stable name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RebuildManifest { .. } => "rebuild-manifest",
            Self::Compact { .. } => "compact",
            Self::Sweep => "sweep",
        }
    }
}

/// What a task does.
#[derive(Debug, Clone)]
pub(crate) enum TaskKind {
    /// Expand a task group into per-unit download tasks. Runs on SLOW.
    Plan {
        /// The group to expand.
        group: String,
    },

    /// One vendor fetch. Runs on FAST.
    Download {
        /// Dataset name.
        task_name: String,
        /// Bound call parameters.
        params: Params,
    },

    /// Apply a completed download's payload to the lake. Runs on SLOW.
    Persist {
        /// Dataset name.
        task_name: String,
        /// The parameters of the paired download, for tracing and
        /// dead-letter records.
        params: Params,
        /// The fetched rows, carried by value through the queue.
        payload: RecordBatch,
    },

    /// Housekeeping. Runs on MAINT.
    Maintenance(MaintenanceKind),
}

impl TaskKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Plan { .. } => "plan",
            Self::Download { .. } => "download",
            Self::Persist { .. } => "persist",
            Self::Maintenance(_) => "maintenance",
        }
    }

    /// The dataset/group the task concerns, for logs.
    pub(crate) fn subject(&self) -> &str {
        match self {
            Self::Plan { group } => group,
            Self::Download { task_name, .. } | Self::Persist { task_name, .. } => task_name,
            Self::Maintenance(kind) => kind.as_str(),
        }
    }
}

/// One queued work item.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub(crate) kind: TaskKind,

    /// Ties a download to its paired persist; assigned at creation.
    pub(crate) correlation_id: CorrelationId,

    /// 0-based retry counter.
    pub(crate) attempt: u32,
}

impl Task {
    pub(crate) fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            correlation_id: CorrelationId::new(),
            attempt: 0,
        }
    }

    pub(crate) fn with_correlation(kind: TaskKind, correlation_id: CorrelationId) -> Self {
        Self {
            kind,
            correlation_id,
            attempt: 0,
        }
    }

    /// The same task, one attempt later.
    pub(crate) fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }
}

//! Shared run state: pending-task tracking, per-queue counters, and the
//! run journal.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use data_types::CorrelationId;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::task::QueueName;

/// Tracks tasks between enqueue and terminal transition, so a driver can
/// wait for the pipeline to drain.
#[derive(Debug, Default)]
pub(crate) struct PendingTracker {
    count: AtomicUsize,
    notify: Notify,
}

impl PendingTracker {
    pub(crate) fn inc(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "pending tracker underflow");
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once no task is queued or running.
    pub(crate) async fn quiesce(&self) {
        loop {
            let notified = self.notify.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Terminal outcome of one task, for the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Completed its work.
    Succeeded,

    /// Exhausted retries or hit a permanent error; dead-lettered.
    DeadLettered,

    /// Observed the cancel signal; terminal no-op.
    Cancelled,

    /// Failed without dead-lettering (plan and maintenance failures).
    Failed,
}

impl TaskOutcome {
    /// Stable name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::DeadLettered => "dead-lettered",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// One journal entry: a task reaching a terminal state.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    /// Queue the task ran on.
    pub queue: &'static str,

    /// Task kind (`plan`, `download`, `persist`, `maintenance`).
    pub kind: &'static str,

    /// Dataset, group or maintenance kind concerned.
    pub subject: String,

    /// Correlation id carried by the task.
    pub correlation_id: CorrelationId,

    /// How it ended.
    pub outcome: TaskOutcome,

    /// Attempts consumed (0-based last attempt).
    pub attempt: u32,
}

/// In-memory record of every terminal transition in this run.
///
/// The structured log stream carries the same facts; the journal exists
/// so the driver can print an exit summary and tests can assert on
/// pipeline behavior without scraping logs.
#[derive(Debug, Default)]
pub(crate) struct RunJournal {
    entries: Mutex<Vec<TaskCompletion>>,
}

impl RunJournal {
    pub(crate) fn record(&self, entry: TaskCompletion) {
        self.entries.lock().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<TaskCompletion> {
        self.entries.lock().clone()
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) retried: AtomicU64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueSummary {
        QueueSummary {
            submitted: self.submitted.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
        }
    }
}

/// Per-queue counts surfaced at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    /// Tasks accepted onto the queue.
    pub submitted: u64,

    /// Tasks that completed their work.
    pub succeeded: u64,

    /// Plan/maintenance failures (not dead-lettered).
    pub failed: u64,

    /// Tasks dead-lettered after permanent failure or retry exhaustion.
    pub dead_lettered: u64,

    /// Tasks that terminated as cancellation no-ops.
    pub cancelled: u64,

    /// Retry re-enqueues performed.
    pub retried: u64,
}

/// The exit summary of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// FAST queue counts.
    pub fast: QueueSummary,

    /// SLOW queue counts.
    pub slow: QueueSummary,

    /// MAINT queue counts.
    pub maint: QueueSummary,
}

impl RunSummary {
    /// Whether any task dead-lettered or failed.
    pub fn has_failures(&self) -> bool {
        [self.fast, self.slow, self.maint]
            .iter()
            .any(|q| q.failed > 0 || q.dead_lettered > 0)
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, q) in [
            ("fast", &self.fast),
            ("slow", &self.slow),
            ("maint", &self.maint),
        ] {
            writeln!(
                f,
                "{name}: submitted={} succeeded={} failed={} dead_lettered={} cancelled={} retried={}",
                q.submitted, q.succeeded, q.failed, q.dead_lettered, q.cancelled, q.retried,
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    fast: QueueCounters,
    slow: QueueCounters,
    maint: QueueCounters,
}

impl Counters {
    pub(crate) fn queue(&self, queue: QueueName) -> &QueueCounters {
        match queue {
            QueueName::Fast => &self.fast,
            QueueName::Slow => &self.slow,
            QueueName::Maint => &self.maint,
        }
    }

    pub(crate) fn summary(&self) -> RunSummary {
        RunSummary {
            fast: self.fast.snapshot(),
            slow: self.slow.snapshot(),
            maint: self.maint.snapshot(),
        }
    }
}

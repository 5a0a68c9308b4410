//! The task orchestrator: three isolated queues, their worker pools, and
//! the plan → download → persist pipeline between them.
//!
//! ## Topology
//!
//! ```text
//!  submit_plan(group)
//!        │
//!        ▽ SLOW (1 worker)          FAST (N workers)
//!   ┌─────────┐  one per unit   ┌──────────┐
//!   │  plan   │────────────────▷│ download │──┐
//!   └─────────┘                 └──────────┘  │ payload + correlation id
//!   ┌─────────┐                               │
//!   │ persist │◁──────────────────────────────┘
//!   └─────────┘
//!        MAINT (1 worker): manifest rebuild, compaction, sweep
//! ```
//!
//! FAST holds the parallel network work, globally bounded by the
//! rate-limit manager. SLOW is deliberately single-worker so planning
//! and persistence for a dataset never interleave and per-plan ordering
//! of persists follows queue order. MAINT is the only path that deletes
//! published files.
//!
//! ## Lifecycle and failure containment
//!
//! Tasks move `queued → running → (succeeded | failed-transient |
//! failed-permanent | cancelled)`. Transient failures re-enqueue with
//! exponential backoff up to a per-kind attempt budget, then dead-letter;
//! permanent failures dead-letter immediately. Failures never unwind
//! across task boundaries, and a planning failure for one unit never
//! aborts the rest of the plan.
//!
//! Queues are in-process: pending tasks do not survive a crash, which is
//! acceptable because planning is idempotent — a restarted process
//! re-plans and converges on the same missing ranges. Dead-letter
//! records, in contrast, are durable (JSONL under the lake root).

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::todo,
    clippy::use_self,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub
)]

use std::sync::{atomic::Ordering, Arc};

use catalogue::Catalogue;
use data_types::CorrelationId;
use fetcher::FetcherFactory;
use market_time::TimeProvider;
use parquet_lake::Lake;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

mod config;
mod dead_letter;
mod planner;
mod state;
mod task;
mod worker;

pub use config::{OrchestratorConfig, PlannerConfig};
pub use dead_letter::{DeadLetterRecord, DeadLetterStore, DEAD_LETTER_FILE};
pub use state::{QueueSummary, RunSummary, TaskCompletion, TaskOutcome};
pub use task::{MaintenanceKind, Params, QueueName};

use state::{Counters, PendingTracker, RunJournal};
use task::{Task, TaskKind};

/// Errors surfaced at submit time.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The group name resolves to neither a group nor a dataset.
    #[error("unknown task group {name}")]
    UnknownGroup {
        /// The rejected name.
        name: String,
    },

    /// The orchestrator is shutting down and accepts no new work.
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

#[derive(Debug)]
pub(crate) struct Queue {
    tx: async_channel::Sender<Task>,
    rx: async_channel::Receiver<Task>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }
}

/// Shared state of a running orchestrator.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) catalogue: Arc<Catalogue>,
    pub(crate) lake: Arc<Lake>,
    pub(crate) fetchers: FetcherFactory,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) config: OrchestratorConfig,

    fast: Queue,
    slow: Queue,
    maint: Queue,

    pub(crate) cancel: CancellationToken,
    pub(crate) retries: TaskTracker,
    pending: PendingTracker,
    counters: Counters,
    journal: RunJournal,
    dead_letters: DeadLetterStore,
}

impl Inner {
    pub(crate) fn queue(&self, name: QueueName) -> &Queue {
        match name {
            QueueName::Fast => &self.fast,
            QueueName::Slow => &self.slow,
            QueueName::Maint => &self.maint,
        }
    }

    /// Accept a new task onto a queue.
    pub(crate) async fn enqueue(&self, queue: QueueName, task: Task) {
        let counters = self.counters.queue(queue);
        counters.submitted.fetch_add(1, Ordering::SeqCst);
        self.pending.inc();
        if self.queue(queue).tx.send(task).await.is_err() {
            // Shutdown closed the queue under us; account the task as
            // cancelled so quiesce still converges.
            counters.cancelled.fetch_add(1, Ordering::SeqCst);
            self.pending.dec();
        }
    }

    /// Put a retried task back on its queue; it is still pending.
    pub(crate) async fn requeue(&self, queue: QueueName, task: Task) {
        let counters = self.counters.queue(queue);
        counters.retried.fetch_add(1, Ordering::SeqCst);
        if self.queue(queue).tx.send(task).await.is_err() {
            counters.cancelled.fetch_add(1, Ordering::SeqCst);
            self.pending.dec();
        }
    }

    /// Record a task's terminal transition.
    pub(crate) fn terminal(&self, queue: QueueName, task: &Task, outcome: TaskOutcome) {
        let counters = self.counters.queue(queue);
        match outcome {
            TaskOutcome::Succeeded => counters.succeeded.fetch_add(1, Ordering::SeqCst),
            TaskOutcome::DeadLettered => counters.dead_lettered.fetch_add(1, Ordering::SeqCst),
            TaskOutcome::Cancelled => counters.cancelled.fetch_add(1, Ordering::SeqCst),
            TaskOutcome::Failed => counters.failed.fetch_add(1, Ordering::SeqCst),
        };
        self.journal.record(TaskCompletion {
            queue: queue.as_str(),
            kind: task.kind.as_str(),
            subject: task.kind.subject().to_string(),
            correlation_id: task.correlation_id,
            outcome,
            attempt: task.attempt,
        });
        self.pending.dec();
    }

    /// Dead-letter a task and mark it terminal.
    pub(crate) fn dead_letter(
        &self,
        queue: QueueName,
        task: &Task,
        error_kind: &str,
        message: String,
    ) {
        let params = match &task.kind {
            TaskKind::Download { params, .. } | TaskKind::Persist { params, .. } => params.clone(),
            TaskKind::Plan { .. } | TaskKind::Maintenance(_) => Params::new(),
        };
        self.dead_letters.record(DeadLetterRecord {
            task_kind: task.kind.as_str().to_string(),
            task_name: task.kind.subject().to_string(),
            params,
            attempts: task.attempt + 1,
            last_error_kind: error_kind.to_string(),
            last_error_message: message,
            correlation_id: task.correlation_id.to_string(),
        });
        self.terminal(queue, task, TaskOutcome::DeadLettered);
    }
}

/// A running orchestrator.
///
/// Built last in the component graph: every dependency is passed in
/// explicitly and the worker pools start immediately. Must be created
/// inside a tokio runtime.
#[derive(Debug)]
pub struct Orchestrator {
    inner: Arc<Inner>,
    workers: TaskTracker,
}

impl Orchestrator {
    /// Start the worker pools over the shared component graph.
    pub fn new(
        catalogue: Arc<Catalogue>,
        lake: Arc<Lake>,
        fetchers: FetcherFactory,
        time: Arc<dyn TimeProvider>,
        config: OrchestratorConfig,
    ) -> Self {
        let dead_letters = DeadLetterStore::new(lake.root());
        let inner = Arc::new(Inner {
            catalogue,
            lake,
            fetchers,
            time,
            config,
            fast: Queue::new(),
            slow: Queue::new(),
            maint: Queue::new(),
            cancel: CancellationToken::new(),
            retries: TaskTracker::new(),
            pending: PendingTracker::default(),
            counters: Counters::default(),
            journal: RunJournal::default(),
            dead_letters,
        });

        let workers = TaskTracker::new();
        for _ in 0..inner.config.fast_workers.max(1) {
            workers.spawn(worker::run(Arc::clone(&inner), QueueName::Fast));
        }
        workers.spawn(worker::run(Arc::clone(&inner), QueueName::Slow));
        workers.spawn(worker::run(Arc::clone(&inner), QueueName::Maint));
        workers.close();

        info!(
            fast_workers = inner.config.fast_workers.max(1),
            "orchestrator started",
        );
        Self { inner, workers }
    }

    /// Submit a plan for a task group. The group name is validated here;
    /// everything downstream is asynchronous.
    pub async fn submit_plan(&self, group: &str) -> Result<CorrelationId, SubmitError> {
        self.inner
            .catalogue
            .list_group(group)
            .map_err(|_| SubmitError::UnknownGroup {
                name: group.to_string(),
            })?;
        self.guard_running()?;

        let task = Task::new(TaskKind::Plan {
            group: group.to_string(),
        });
        let id = task.correlation_id;
        info!(group, correlation_id = %id, "plan submitted");
        self.inner.enqueue(QueueName::Slow, task).await;
        Ok(id)
    }

    /// Submit one ad-hoc download. Parameter validation happens when the
    /// task runs; a bad submission dead-letters rather than erroring
    /// here.
    pub async fn submit_download(
        &self,
        task_name: &str,
        params: Params,
    ) -> Result<CorrelationId, SubmitError> {
        self.guard_running()?;
        let task = Task::new(TaskKind::Download {
            task_name: task_name.to_string(),
            params,
        });
        let id = task.correlation_id;
        info!(task_name, correlation_id = %id, "download submitted");
        self.inner.enqueue(QueueName::Fast, task).await;
        Ok(id)
    }

    /// Submit a maintenance task.
    pub async fn submit_maintenance(
        &self,
        kind: MaintenanceKind,
    ) -> Result<CorrelationId, SubmitError> {
        self.guard_running()?;
        let task = Task::new(TaskKind::Maintenance(kind));
        let id = task.correlation_id;
        self.inner.enqueue(QueueName::Maint, task).await;
        Ok(id)
    }

    fn guard_running(&self) -> Result<(), SubmitError> {
        if self.inner.cancel.is_cancelled() || self.inner.fast.tx.is_closed() {
            return Err(SubmitError::ShuttingDown);
        }
        Ok(())
    }

    /// Flip the process-wide cancel signal. In-flight vendor calls and
    /// disk writes complete; queued work becomes terminal no-ops at
    /// shutdown.
    pub fn cancel(&self) {
        warn!("cancellation requested");
        self.inner.cancel.cancel();
    }

    /// Whether the cancel signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until no task is queued, running, or awaiting retry.
    pub async fn quiesce(&self) {
        self.inner.pending.quiesce().await;
    }

    /// Current per-queue counts.
    pub fn summary(&self) -> RunSummary {
        self.inner.counters.summary()
    }

    /// Terminal transitions recorded so far.
    pub fn journal(&self) -> Vec<TaskCompletion> {
        self.inner.journal.entries()
    }

    /// Dead-letter records accumulated this run.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.inner.dead_letters.records()
    }

    /// Stop accepting work, drain the pools, and return the exit
    /// summary.
    ///
    /// Without a prior [`Orchestrator::cancel`], workers finish
    /// everything already queued. After a cancel, workers stop at the
    /// next task boundary and whatever remains queued is accounted as
    /// cancelled.
    pub async fn shutdown(self) -> RunSummary {
        self.inner.fast.tx.close();
        self.inner.slow.tx.close();
        self.inner.maint.tx.close();

        self.inner.retries.close();
        self.workers.wait().await;
        self.inner.retries.wait().await;

        // Anything still queued was never started (cancellation path).
        for queue in [QueueName::Fast, QueueName::Slow, QueueName::Maint] {
            while let Ok(task) = self.inner.queue(queue).rx.try_recv() {
                self.inner.terminal(queue, &task, TaskOutcome::Cancelled);
            }
        }

        let summary = self.inner.counters.summary();
        info!(pending = self.inner.pending.pending(), "orchestrator stopped\n{summary}");
        summary
    }
}

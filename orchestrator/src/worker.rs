//! Worker loops and task execution.
//!
//! Every pool runs the same loop: pull one task, drive it to a terminal
//! state, repeat. The cancel signal is observed between tasks (and
//! inside the rate-limit wait via the fetcher); an in-flight vendor call
//! or disk write always completes before the worker re-checks.

use std::sync::Arc;

use backoff::Backoff;
use data_types::UpdateStrategy;
use fetcher::{BuildError, FetchError};
use tracing::{debug, info, warn};

use crate::{
    planner,
    state::TaskOutcome,
    task::{MaintenanceKind, QueueName, Task, TaskKind},
    Inner,
};

/// The worker routine for one pool member.
pub(crate) async fn run(inner: Arc<Inner>, queue: QueueName) {
    let rx = inner.queue(queue).rx.clone();
    loop {
        let task = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            task = rx.recv() => match task {
                Ok(task) => task,
                // Queue closed and drained: clean shutdown.
                Err(async_channel::RecvError) => break,
            },
        };
        dispatch(&inner, queue, task).await;
    }
    debug!(queue = %queue, "worker drained");
}

async fn dispatch(inner: &Arc<Inner>, queue: QueueName, task: Task) {
    debug!(
        queue = %queue,
        kind = task.kind.as_str(),
        subject = task.kind.subject(),
        correlation_id = %task.correlation_id,
        attempt = task.attempt,
        "task running",
    );
    match &task.kind {
        TaskKind::Plan { .. } => planner::run_plan(inner, task).await,
        TaskKind::Download { .. } => run_download(inner, task).await,
        TaskKind::Persist { .. } => run_persist(inner, task).await,
        TaskKind::Maintenance(_) => run_maintenance(inner, task).await,
    }
}

async fn run_download(inner: &Arc<Inner>, task: Task) {
    let TaskKind::Download { task_name, params } = &task.kind else {
        unreachable!("download runner got non-download task")
    };

    let built = match inner.fetchers.build(task_name, params) {
        Ok(f) => f,
        Err(e) => {
            let kind = match &e {
                BuildError::UnknownTask { .. } => "unknown_task",
                BuildError::BadParams { .. } => "bad_params",
            };
            inner.dead_letter(QueueName::Fast, &task, kind, e.to_string());
            return;
        }
    };

    match built.fetch(&inner.cancel).await {
        Ok(payload) => {
            info!(
                dataset = %task_name,
                correlation_id = %task.correlation_id,
                rows = payload.num_rows(),
                "download complete",
            );
            // An empty payload still persists (as a no-op), keeping the
            // download→persist correlation observable.
            let persist = Task::with_correlation(
                TaskKind::Persist {
                    task_name: task_name.clone(),
                    params: params.clone(),
                    payload,
                },
                task.correlation_id,
            );
            inner.enqueue(QueueName::Slow, persist).await;
            inner.terminal(QueueName::Fast, &task, TaskOutcome::Succeeded);
        }
        Err(FetchError::Cancelled) => {
            // Terminal no-op: not retried, not dead-lettered.
            inner.terminal(QueueName::Fast, &task, TaskOutcome::Cancelled);
        }
        Err(e) if e.is_transient() => {
            retry_or_dead_letter(
                inner,
                QueueName::Fast,
                task,
                "vendor",
                e.to_string(),
                inner.config.max_download_attempts,
            );
        }
        Err(e) => {
            let kind = match &e {
                FetchError::SchemaMismatch { .. } => "schema_mismatch",
                _ => "vendor",
            };
            inner.dead_letter(QueueName::Fast, &task, kind, e.to_string());
        }
    }
}

async fn run_persist(inner: &Arc<Inner>, task: Task) {
    let TaskKind::Persist {
        task_name,
        params: _,
        payload,
    } = &task.kind
    else {
        unreachable!("persist runner got non-persist task")
    };

    let descriptor = match inner.catalogue.get(task_name) {
        Ok(d) => Arc::clone(d),
        Err(e) => {
            inner.dead_letter(QueueName::Slow, &task, "unknown_task", e.to_string());
            return;
        }
    };

    let result = match descriptor.strategy {
        UpdateStrategy::Incremental => inner
            .lake
            .append(&descriptor, payload.clone())
            .await
            .map(|s| s.rows),
        UpdateStrategy::FullReplace => inner
            .lake
            .replace(&descriptor, payload.clone())
            .await
            .map(|s| s.rows),
    };

    match result {
        Ok(rows) => {
            info!(
                dataset = %task_name,
                correlation_id = %task.correlation_id,
                rows,
                strategy = ?descriptor.strategy,
                "persist complete",
            );
            inner.terminal(QueueName::Slow, &task, TaskOutcome::Succeeded);
        }
        Err(e) if e.is_transient() => {
            retry_or_dead_letter(
                inner,
                QueueName::Slow,
                task,
                "write",
                e.to_string(),
                inner.config.max_persist_attempts,
            );
        }
        Err(e) => {
            inner.dead_letter(QueueName::Slow, &task, "write", e.to_string());
        }
    }
}

async fn run_maintenance(inner: &Arc<Inner>, task: Task) {
    let TaskKind::Maintenance(kind) = &task.kind else {
        unreachable!("maintenance runner got non-maintenance task")
    };

    let result = match kind {
        MaintenanceKind::RebuildManifest { dataset } => {
            for_datasets(inner, dataset.as_ref().map(|d| d.as_str()), |descriptor| {
                let inner = Arc::clone(inner);
                async move {
                    inner.lake.rebuild_manifest(&descriptor).await?;
                    Ok(())
                }
            })
            .await
        }
        MaintenanceKind::Compact { dataset } => {
            for_datasets(inner, dataset.as_ref().map(|d| d.as_str()), |descriptor| {
                let inner = Arc::clone(inner);
                async move {
                    if descriptor.strategy == UpdateStrategy::Incremental {
                        inner.lake.compact(&descriptor).await?;
                    }
                    Ok(())
                }
            })
            .await
        }
        MaintenanceKind::Sweep => inner.lake.sweep().await.map(|_| ()),
    };

    match result {
        Ok(()) => {
            info!(kind = kind.as_str(), correlation_id = %task.correlation_id, "maintenance complete");
            inner.terminal(QueueName::Maint, &task, TaskOutcome::Succeeded);
        }
        Err(e) => {
            // Maintenance is periodic; a failed pass is logged and the
            // next pass tries again. No dead letter, no retry.
            warn!(kind = kind.as_str(), error = %e, "maintenance failed");
            inner.terminal(QueueName::Maint, &task, TaskOutcome::Failed);
        }
    }
}

async fn for_datasets<F, Fut>(
    inner: &Arc<Inner>,
    only: Option<&str>,
    mut f: F,
) -> Result<(), parquet_lake::Error>
where
    F: FnMut(data_types::DatasetDescriptor) -> Fut,
    Fut: std::future::Future<Output = Result<(), parquet_lake::Error>>,
{
    for descriptor in inner.catalogue.datasets() {
        if let Some(only) = only {
            if descriptor.name.as_str() != only {
                continue;
            }
        }
        f(descriptor.as_ref().clone()).await?;
    }
    Ok(())
}

/// Re-enqueue a transiently failed task after a backoff delay, or
/// dead-letter it once its attempt budget is spent.
fn retry_or_dead_letter(
    inner: &Arc<Inner>,
    queue: QueueName,
    task: Task,
    error_kind: &'static str,
    message: String,
    max_attempts: u32,
) {
    if task.attempt + 1 >= max_attempts {
        inner.dead_letter(
            queue,
            &task,
            error_kind,
            format!("retries exhausted: {message}"),
        );
        return;
    }

    let delay = Backoff::nominal_for_attempt(&inner.config.retry_backoff, task.attempt);
    warn!(
        queue = %queue,
        kind = task.kind.as_str(),
        subject = task.kind.subject(),
        correlation_id = %task.correlation_id,
        attempt = task.attempt,
        delay_ms = delay.as_millis() as u64,
        error = %message,
        "transient failure; will retry",
    );

    let retry = task.next_attempt();
    let inner = Arc::clone(inner);
    let tracker = inner.retries.clone();
    tracker.spawn(async move {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => {
                inner.terminal(queue, &retry, TaskOutcome::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {
                inner.requeue(queue, retry).await;
            }
        }
    });
}

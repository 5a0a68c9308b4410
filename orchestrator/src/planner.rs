//! Plan expansion: from a task group to per-unit download tasks.
//!
//! The planner is incremental: for every (dataset, symbol) it asks the
//! lake for the latest date already present and only enqueues the
//! missing `(latest, today]` range. A unit that is already up to date is
//! skipped entirely; a unit that fails to plan is logged and skipped —
//! one bad symbol never aborts the rest of the plan.

use std::sync::Arc;

use data_types::{DatasetDescriptor, DateRange, Symbol, TradeDate};
use market_time::TimeProvider;
use tracing::{debug, info, warn};

use crate::{
    state::TaskOutcome,
    task::{Params, QueueName, Task, TaskKind},
    Inner,
};

#[derive(Debug, thiserror::Error)]
enum PlanError {
    #[error(transparent)]
    Catalogue(#[from] catalogue::Error),

    #[error(transparent)]
    Lake(#[from] parquet_lake::Error),
}

pub(crate) async fn run_plan(inner: &Arc<Inner>, task: Task) {
    let TaskKind::Plan { group } = &task.kind else {
        unreachable!("plan runner got non-plan task")
    };

    let members = match inner.catalogue.list_group(group) {
        Ok(members) => members,
        Err(e) => {
            // Groups are validated at submit time, so this is only
            // reachable through races with nothing-at-all; treat it as a
            // failed plan rather than a process fault.
            warn!(group, error = %e, "plan expansion failed");
            inner.terminal(QueueName::Slow, &task, TaskOutcome::Failed);
            return;
        }
    };

    let today = inner.time.today();
    let mut symbols: Option<Arc<Vec<Symbol>>> = None;
    let mut planned = 0usize;

    for name in &members {
        if inner.cancel.is_cancelled() {
            inner.terminal(QueueName::Slow, &task, TaskOutcome::Cancelled);
            return;
        }

        let descriptor = match inner.catalogue.get(name.as_str()) {
            Ok(d) => Arc::clone(d),
            Err(e) => {
                warn!(group, dataset = %name, error = %e, "skipping unknown dataset in group");
                continue;
            }
        };

        if descriptor.per_symbol {
            let universe = match &symbols {
                Some(universe) => Arc::clone(universe),
                None => match resolve_symbols(inner).await {
                    Ok(universe) => {
                        let universe = Arc::new(universe);
                        symbols = Some(Arc::clone(&universe));
                        universe
                    }
                    Err(e) => {
                        warn!(
                            group,
                            dataset = %name,
                            error = %e,
                            "failed to enumerate symbols; skipping dataset",
                        );
                        continue;
                    }
                },
            };

            for symbol in universe.iter() {
                match plan_symbol(inner, &descriptor, symbol, today).await {
                    Ok(Some(download)) => {
                        inner.enqueue(QueueName::Fast, download).await;
                        planned += 1;
                    }
                    Ok(None) => {
                        debug!(dataset = %name, symbol = %symbol, "up to date; skipping");
                    }
                    Err(e) => {
                        warn!(dataset = %name, symbol = %symbol, error = %e, "planning unit failed");
                    }
                }
            }
        } else {
            match plan_whole_market(inner, &descriptor, today).await {
                Ok(Some(download)) => {
                    inner.enqueue(QueueName::Fast, download).await;
                    planned += 1;
                }
                Ok(None) => {
                    debug!(dataset = %name, "up to date; skipping");
                }
                Err(e) => {
                    warn!(dataset = %name, error = %e, "planning unit failed");
                }
            }
        }
    }

    info!(
        group,
        correlation_id = %task.correlation_id,
        datasets = members.len(),
        downloads = planned,
        "plan expanded",
    );
    inner.terminal(QueueName::Slow, &task, TaskOutcome::Succeeded);
}

/// The symbol universe: the operator override list if present, otherwise
/// the distinct symbols of the configured reference dataset.
async fn resolve_symbols(inner: &Arc<Inner>) -> Result<Vec<Symbol>, PlanError> {
    let planner = &inner.config.planner;
    if !planner.symbol_overrides.is_empty() {
        return Ok(planner.symbol_overrides.clone());
    }

    let source = inner.catalogue.get(&planner.symbol_source)?;
    let symbols = inner.lake.symbols(source, &planner.symbol_column).await?;
    if symbols.is_empty() {
        warn!(
            source = %planner.symbol_source,
            "symbol universe is empty; ingest the reference group first",
        );
    }
    Ok(symbols)
}

async fn plan_symbol(
    inner: &Arc<Inner>,
    descriptor: &DatasetDescriptor,
    symbol: &Symbol,
    today: TradeDate,
) -> Result<Option<Task>, PlanError> {
    let latest = inner.lake.latest_date(descriptor, Some(symbol)).await?;
    let Some(range) = DateRange::incremental(latest, today) else {
        return Ok(None);
    };

    let mut params = Params::new();
    bind(&mut params, &descriptor.api.symbol_param, symbol.as_str());
    bind_range(&mut params, descriptor, &range);

    Ok(Some(Task::new(TaskKind::Download {
        task_name: descriptor.name.to_string(),
        params,
    })))
}

async fn plan_whole_market(
    inner: &Arc<Inner>,
    descriptor: &DatasetDescriptor,
    today: TradeDate,
) -> Result<Option<Task>, PlanError> {
    let mut params = Params::new();

    if descriptor.date_column.is_some() {
        let latest = inner.lake.latest_date(descriptor, None).await?;
        let Some(range) = DateRange::incremental(latest, today) else {
            return Ok(None);
        };
        bind_range(&mut params, descriptor, &range);
    }

    Ok(Some(Task::new(TaskKind::Download {
        task_name: descriptor.name.to_string(),
        params,
    })))
}

fn bind_range(params: &mut Params, descriptor: &DatasetDescriptor, range: &DateRange) {
    bind(
        params,
        &descriptor.api.start_param,
        &range.start().to_string(),
    );
    bind(params, &descriptor.api.end_param, &range.end().to_string());
}

fn bind(params: &mut Params, name: &Option<String>, value: &str) {
    if let Some(name) = name {
        params.insert(name.clone(), value.to_string());
    }
}

//! The QuoteLake ingestion driver.
//!
//! Builds the component graph explicitly — catalogue → rate limiter →
//! lake → fetcher factory → orchestrator — then submits the requested
//! work and waits for the pipeline to drain (or for SIGINT, which flips
//! the cancel signal and drains gracefully).
//!
//! Exit codes: 0 clean, 1 configuration error, 2 fatal runtime error,
//! 130 cancelled by signal.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(clippy::clone_on_ref_ptr, clippy::dbg_macro, clippy::todo)]

use std::{path::PathBuf, sync::Arc};

use catalogue::Catalogue;
use clap::{Parser, Subcommand, ValueEnum};
use fetcher::FetcherFactory;
use market_time::SystemProvider;
use orchestrator::{MaintenanceKind, Orchestrator};
use parquet_lake::Lake;
use rate_limit::RateLimiter;
use tracing::{error, info, warn};
use vendor_api::HttpVendorClient;

mod config;

use config::Config;

/// Environment variable holding the vendor credential. Read once at
/// startup; never logged, never written to disk.
const TOKEN_ENV: &str = "QUOTELAKE_VENDOR_TOKEN";

const EXIT_CLEAN: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_RUNTIME: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Parser)]
#[clap(name = "quotelaked", about = "A-share market data lake ingestion driver")]
struct Cli {
    /// Path to the TOML config file. Defaults apply when omitted.
    #[clap(long = "config", env = "QUOTELAKE_CONFIG")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit plans for the given task groups and wait for the pipeline
    /// to drain.
    Plan {
        /// Task groups (or bare dataset names) to plan.
        #[clap(required = true)]
        groups: Vec<String>,
    },

    /// Run one maintenance pass and wait for it to finish.
    Maint {
        /// Which housekeeping task to run.
        #[clap(value_enum)]
        kind: MaintKind,

        /// Restrict to one dataset; all datasets when omitted.
        #[clap(long = "dataset")]
        dataset: Option<String>,
    },

    /// Print the dead-letter records accumulated on disk.
    DeadLetters,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MaintKind {
    /// Rebuild dataset manifests from the directory trees.
    RebuildManifest,

    /// Merge multi-file year partitions of incremental datasets.
    Compact,

    /// Remove staging/old trees left by interrupted full-replace swaps.
    Sweep,
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "configuration error");
                return EXIT_CONFIG;
            }
        },
        None => Config::default(),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return EXIT_RUNTIME;
        }
    };

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> i32 {
    let catalogue = match &config.catalogue {
        Some(path) => Catalogue::from_path(path),
        None => Ok(Catalogue::builtin()),
    };
    let catalogue = match catalogue {
        Ok(catalogue) => Arc::new(catalogue),
        Err(e) => {
            error!(error = %e, "catalogue error");
            return EXIT_CONFIG;
        }
    };

    let lake = match Lake::new(&config.lake_root) {
        Ok(lake) => Arc::new(lake),
        Err(e) => {
            error!(error = %e, "failed to open lake root");
            return EXIT_CONFIG;
        }
    };

    if let Command::DeadLetters = command {
        return print_dead_letters(&lake);
    }

    let token = std::env::var(TOKEN_ENV).unwrap_or_default();
    if token.is_empty() && matches!(command, Command::Plan { .. }) {
        error!("{TOKEN_ENV} is not set; refusing to plan downloads without a credential");
        return EXIT_CONFIG;
    }

    let vendor = match HttpVendorClient::new(config.vendor_config(token)) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to construct vendor client");
            return EXIT_CONFIG;
        }
    };

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
    let fetchers = FetcherFactory::new(Arc::clone(&catalogue), rate_limiter, vendor as _);
    let time = Arc::new(SystemProvider::new());

    let orchestrator = Orchestrator::new(
        Arc::clone(&catalogue),
        Arc::clone(&lake),
        fetchers,
        time as _,
        config.orchestrator_config(),
    );

    let submitted = match &command {
        Command::Plan { groups } => {
            let mut ok = true;
            for group in groups {
                match orchestrator.submit_plan(group).await {
                    Ok(id) => info!(group, correlation_id = %id, "plan accepted"),
                    Err(e) => {
                        error!(group, error = %e, "plan rejected");
                        ok = false;
                    }
                }
            }
            ok
        }
        Command::Maint { kind, dataset } => {
            let dataset = match dataset
                .as_deref()
                .map(data_types::DatasetName::try_new)
                .transpose()
            {
                Ok(dataset) => dataset,
                Err(e) => {
                    error!(error = %e, "invalid dataset name");
                    return EXIT_CONFIG;
                }
            };
            let kind = match kind {
                MaintKind::RebuildManifest => MaintenanceKind::RebuildManifest { dataset },
                MaintKind::Compact => MaintenanceKind::Compact { dataset },
                MaintKind::Sweep => MaintenanceKind::Sweep,
            };
            orchestrator.submit_maintenance(kind).await.is_ok()
        }
        Command::DeadLetters => unreachable!("handled above"),
    };
    if !submitted {
        orchestrator.shutdown().await;
        return EXIT_CONFIG;
    }

    // Wait for the pipeline to drain, or for the operator to interrupt.
    let cancelled = tokio::select! {
        _ = orchestrator.quiesce() => false,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for SIGINT");
            }
            warn!("interrupt received; draining in-flight work");
            orchestrator.cancel();
            true
        }
    };

    let summary = orchestrator.shutdown().await;
    info!("run summary:\n{summary}");

    if cancelled {
        return EXIT_CANCELLED;
    }
    if summary.has_failures() {
        warn!("run completed with failures; see dead-letter records");
    }
    EXIT_CLEAN
}

fn print_dead_letters(lake: &Lake) -> i32 {
    let store = orchestrator::DeadLetterStore::new(lake.root());
    match store.load_all() {
        Ok(records) if records.is_empty() => {
            println!("no dead letters");
            EXIT_CLEAN
        }
        Ok(records) => {
            for record in records {
                println!(
                    "{} {} {} attempts={} {}: {}",
                    record.correlation_id,
                    record.task_kind,
                    record.task_name,
                    record.attempts,
                    record.last_error_kind,
                    record.last_error_message,
                );
            }
            EXIT_CLEAN
        }
        Err(e) => {
            error!(error = %e, "failed to read dead letters");
            EXIT_RUNTIME
        }
    }
}

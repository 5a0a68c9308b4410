//! End-to-end pipeline scenarios: real planner, queues, lake and rate
//! limiter; scripted vendor.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use arrow::record_batch::RecordBatch;
use catalogue::Catalogue;
use data_types::Symbol;
use fetcher::FetcherFactory;
use market_time::{mock_at, MockProvider};
use orchestrator::{
    MaintenanceKind, Orchestrator, OrchestratorConfig, Params, PlannerConfig, SubmitError,
};
use parquet_lake::Lake;
use rate_limit::{RateLimitConfig, RateLimiter};
use test_helpers::utf8_batch;
use vendor_api::{MockVendorClient, VendorError};

const CATALOGUE: &str = r#"
    [[dataset]]
    name = "daily"
    primary_key = ["ts_code", "trade_date"]
    date_column = "trade_date"
    strategy = "incremental"
    per_symbol = true

    [dataset.api]
    method = "daily"
    fields = ["ts_code", "trade_date", "close"]
    symbol_param = "ts_code"
    start_param = "start_date"
    end_param = "end_date"

    [[dataset]]
    name = "stock_basic"
    primary_key = ["ts_code"]
    strategy = "full_replace"
    per_symbol = false

    [dataset.api]
    method = "stock_basic"
    fields = ["ts_code", "name", "list_date"]
"#;

const MOUTAI: &str = "600519.SH";
const PINGAN: &str = "000001.SZ";

struct Harness {
    _dir: tempfile::TempDir,
    catalogue: Arc<Catalogue>,
    lake: Arc<Lake>,
    vendor: Arc<MockVendorClient>,
    time: Arc<MockProvider>,
    orchestrator: Orchestrator,
}

fn start(fast_workers: usize, per_minute: usize, symbols: &[&str]) -> Harness {
    let dir = test_helpers::tmp_dir().unwrap();
    let catalogue = Arc::new(Catalogue::from_toml(CATALOGUE).unwrap());
    let lake = Arc::new(Lake::new(dir.path()).unwrap());
    let vendor = Arc::new(MockVendorClient::default());
    let time = Arc::new(mock_at(2024, 3, 15, 4)); // midday in Shanghai

    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        default_per_minute: NonZeroUsize::new(per_minute).unwrap(),
        per_task: Default::default(),
    }));
    let fetchers = FetcherFactory::new(
        Arc::clone(&catalogue),
        rate_limiter,
        Arc::clone(&vendor) as _,
    );

    let config = OrchestratorConfig {
        fast_workers,
        planner: PlannerConfig {
            symbol_overrides: symbols.iter().map(|s| Symbol::from(*s)).collect(),
            ..PlannerConfig::default()
        },
        ..OrchestratorConfig::default()
    };

    let orchestrator = Orchestrator::new(
        Arc::clone(&catalogue),
        Arc::clone(&lake),
        fetchers,
        Arc::clone(&time) as _,
        config,
    );

    Harness {
        _dir: dir,
        catalogue,
        lake,
        vendor,
        time,
        orchestrator,
    }
}

fn daily_payload(symbol: &str, dates: &[&str]) -> RecordBatch {
    utf8_batch(
        &["ts_code", "trade_date", "close"],
        dates
            .iter()
            .map(|d| vec![Some(symbol), Some(*d), Some("10.0")])
            .collect(),
    )
}

const WEEK: &[&str] = &["20240311", "20240312", "20240313", "20240314", "20240315"];

async fn rows_on_disk(harness: &Harness, dataset: &str) -> usize {
    let descriptor = harness.catalogue.get(dataset).unwrap();
    harness
        .lake
        .read_dataset(descriptor)
        .await
        .unwrap()
        .iter()
        .map(|b| b.num_rows())
        .sum()
}

/// S1 — first-run incremental: empty disk, two symbols, five days each.
#[tokio::test]
async fn s1_first_run_incremental() {
    let harness = start(1, 500, &[MOUTAI, PINGAN]);
    harness
        .vendor
        .push_response(Ok(daily_payload(MOUTAI, WEEK)));
    harness
        .vendor
        .push_response(Ok(daily_payload(PINGAN, WEEK)));

    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    // 2 downloads, 2 persists, 1 plan — all succeeded.
    let journal = harness.orchestrator.journal();
    let downloads: Vec<_> = journal.iter().filter(|e| e.kind == "download").collect();
    let persists: Vec<_> = journal.iter().filter(|e| e.kind == "persist").collect();
    assert_eq!(downloads.len(), 2);
    assert_eq!(persists.len(), 2);
    assert!(journal
        .iter()
        .all(|e| e.outcome == orchestrator::TaskOutcome::Succeeded));

    // The planner asked for the full history up to today.
    let calls = harness.vendor.get_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].request.params["ts_code"], MOUTAI);
    assert_eq!(calls[0].request.params["start_date"], "19901219");
    assert_eq!(calls[0].request.params["end_date"], "20240315");

    // 10 rows on disk, partitioned under year=2024, one file per persist.
    assert_eq!(rows_on_disk(&harness, "daily").await, 10);
    let year_dir = harness.lake.root().join("daily/year=2024");
    assert_eq!(std::fs::read_dir(&year_dir).unwrap().count(), 2);

    let daily = harness.catalogue.get("daily").unwrap();
    let latest = harness
        .lake
        .latest_date(daily, Some(&Symbol::from(MOUTAI)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.to_string(), "20240315");

    // Every persist's correlation id matches exactly one download's.
    for persist in &persists {
        let matching: Vec<_> = downloads
            .iter()
            .filter(|d| d.correlation_id == persist.correlation_id)
            .collect();
        assert_eq!(matching.len(), 1);
    }

    let summary = harness.orchestrator.shutdown().await;
    assert_eq!(summary.fast.succeeded, 2);
    assert_eq!(summary.slow.succeeded, 3); // plan + 2 persists
    assert!(!summary.has_failures());
}

/// S2 — re-running the same plan immediately is a no-op.
#[tokio::test]
async fn s2_rerun_is_noop() {
    let harness = start(1, 500, &[MOUTAI, PINGAN]);
    harness
        .vendor
        .push_response(Ok(daily_payload(MOUTAI, WEEK)));
    harness
        .vendor
        .push_response(Ok(daily_payload(PINGAN, WEEK)));

    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;
    assert_eq!(harness.vendor.call_count(), 2);
    assert_eq!(rows_on_disk(&harness, "daily").await, 10);

    // Both symbols are current through "today": empty ranges, zero
    // downloads, disk untouched.
    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    assert_eq!(harness.vendor.call_count(), 2);
    assert_eq!(rows_on_disk(&harness, "daily").await, 10);

    let summary = harness.orchestrator.shutdown().await;
    assert_eq!(summary.fast.submitted, 2);
    assert_eq!(summary.slow.succeeded, 4); // 2 plans + 2 persists
}

/// S2b — a new trading day re-opens exactly the missing range.
#[tokio::test]
async fn s2b_next_day_fetches_delta() {
    let harness = start(1, 500, &[MOUTAI]);
    harness
        .vendor
        .push_response(Ok(daily_payload(MOUTAI, WEEK)));

    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    harness.time.inc(chrono::Duration::days(3));
    harness
        .vendor
        .push_response(Ok(daily_payload(MOUTAI, &["20240318"])));

    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    let calls = harness.vendor.get_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].request.params["start_date"], "20240316");
    assert_eq!(calls[1].request.params["end_date"], "20240318");
    assert_eq!(rows_on_disk(&harness, "daily").await, 6);

    harness.orchestrator.shutdown().await;
}

/// S3 — a transient vendor failure is retried and converges without
/// duplicating the symbol that succeeded first.
#[tokio::test(start_paused = true)]
async fn s3_partial_failure_retries() {
    let harness = start(1, 500, &[MOUTAI, PINGAN]);
    harness
        .vendor
        .push_response(Ok(daily_payload(MOUTAI, WEEK)));
    harness.vendor.push_response(Err(VendorError::Timeout));
    harness
        .vendor
        .push_response(Ok(daily_payload(PINGAN, WEEK)));

    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    assert_eq!(harness.vendor.call_count(), 3);
    assert_eq!(rows_on_disk(&harness, "daily").await, 10);

    let daily = harness.catalogue.get("daily").unwrap();
    for symbol in [MOUTAI, PINGAN] {
        let latest = harness
            .lake
            .latest_date(daily, Some(&Symbol::from(symbol)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.to_string(), "20240315");
    }

    let summary = harness.orchestrator.shutdown().await;
    assert_eq!(summary.fast.retried, 1);
    assert_eq!(summary.fast.succeeded, 2);
    assert_eq!(summary.fast.dead_lettered, 0);
}

/// S3b — retries exhaust into a dead letter; the other symbol is
/// unaffected.
#[tokio::test(start_paused = true)]
async fn s3b_retry_exhaustion_dead_letters() {
    let harness = start(1, 500, &[MOUTAI, PINGAN]);
    harness
        .vendor
        .push_response(Ok(daily_payload(MOUTAI, WEEK)));
    for _ in 0..3 {
        harness.vendor.push_response(Err(VendorError::Timeout));
    }

    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    // 1 (moutai) + 3 attempts for pingan.
    assert_eq!(harness.vendor.call_count(), 4);
    assert_eq!(rows_on_disk(&harness, "daily").await, 5);

    let dead = harness.orchestrator.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_name, "daily");
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].params["ts_code"], PINGAN);
    assert_eq!(dead[0].last_error_kind, "vendor");

    let summary = harness.orchestrator.shutdown().await;
    assert_eq!(summary.fast.retried, 2);
    assert_eq!(summary.fast.dead_lettered, 1);
}

/// S4 — full replace publishes the new reference list atomically.
#[tokio::test]
async fn s4_full_replace() {
    let harness = start(2, 500, &[]);

    // Previous contents on disk.
    let reference = harness.catalogue.get("stock_basic").unwrap();
    let old = utf8_batch(
        &["ts_code", "name", "list_date"],
        vec![
            vec![Some(MOUTAI), Some("kweichow moutai"), Some("20010827")],
            vec![Some("600000.SH"), Some("spd bank"), Some("19991110")],
        ],
    );
    harness.lake.replace(reference, old).await.unwrap();

    let new = utf8_batch(
        &["ts_code", "name", "list_date"],
        vec![
            vec![Some(MOUTAI), Some("kweichow moutai"), Some("20010827")],
            vec![Some(PINGAN), Some("ping an bank"), Some("19910403")],
            vec![Some("300750.SZ"), Some("catl"), Some("20180611")],
        ],
    );
    harness.vendor.push_response(Ok(new));

    harness
        .orchestrator
        .submit_download("stock_basic", Params::new())
        .await
        .unwrap();
    harness.orchestrator.quiesce().await;

    // Exactly the new rows; the retired tree is gone.
    assert_eq!(rows_on_disk(&harness, "stock_basic").await, 3);
    let residue = std::fs::read_dir(harness.lake.root())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(".old-") || name.starts_with(".staging-")
        })
        .count();
    assert_eq!(residue, 0);

    harness.orchestrator.shutdown().await;
}

/// S5 — the per-minute budget holds in every trailing window.
#[tokio::test(start_paused = true)]
async fn s5_rate_cap_compliance() {
    const CAP: usize = 3;
    const SYMBOLS: &[&str] = &[
        "600519.SH",
        "000001.SZ",
        "300750.SZ",
        "600000.SH",
        "601318.SH",
        "000858.SZ",
        "601012.SH",
        "002594.SZ",
        "688981.SH",
        "600036.SH",
    ];

    let harness = start(4, CAP, SYMBOLS);
    harness
        .vendor
        .set_default_response(Ok(daily_payload("batch", &["20240315"])));

    let started = tokio::time::Instant::now();
    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    let calls = harness.vendor.get_calls();
    assert_eq!(calls.len(), SYMBOLS.len());

    // No trailing 60 s window holds more than CAP calls.
    for call in &calls {
        let in_window = calls
            .iter()
            .filter(|other| {
                other.at <= call.at && call.at.duration_since(other.at) < Duration::from_secs(60)
            })
            .count();
        assert!(in_window <= CAP, "window holds {in_window} calls");
    }

    // 10 calls at 3/min cannot finish faster than 3 whole windows.
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(180),
        "finished too fast: {elapsed:?}"
    );

    let summary = harness.orchestrator.shutdown().await;
    assert_eq!(summary.fast.succeeded, SYMBOLS.len() as u64);
    assert!(!summary.has_failures());
}

/// S6 — bad parameters dead-letter immediately, without a vendor call
/// and without retries.
#[tokio::test]
async fn s6_dead_letter_on_bad_params() {
    let harness = start(1, 500, &[MOUTAI]);
    harness
        .vendor
        .push_response(Ok(daily_payload(MOUTAI, WEEK)));

    // An ad-hoc download binding a parameter the descriptor does not
    // declare.
    harness
        .orchestrator
        .submit_download(
            "daily",
            Params::from([("bananas".to_string(), "yes".to_string())]),
        )
        .await
        .unwrap();

    // The plan alongside it proceeds untouched.
    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    let dead = harness.orchestrator.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_kind, "download");
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].last_error_kind, "bad_params");

    // Only the planned download reached the vendor.
    assert_eq!(harness.vendor.call_count(), 1);
    assert_eq!(rows_on_disk(&harness, "daily").await, 5);

    let summary = harness.orchestrator.shutdown().await;
    assert_eq!(summary.fast.dead_lettered, 1);
    assert_eq!(summary.fast.succeeded, 1);
    assert_eq!(summary.fast.retried, 0);
}

/// An empty vendor payload still flows through persist, so the pipeline
/// stays observable end to end.
#[tokio::test]
async fn empty_payload_still_persists() {
    let harness = start(1, 500, &[MOUTAI]);
    harness.vendor.push_response(Err(VendorError::Empty));

    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    let journal = harness.orchestrator.journal();
    let persists: Vec<_> = journal.iter().filter(|e| e.kind == "persist").collect();
    assert_eq!(persists.len(), 1);
    assert_eq!(persists[0].outcome, orchestrator::TaskOutcome::Succeeded);

    // Nothing on disk, and the next plan asks again from the start.
    assert_eq!(rows_on_disk(&harness, "daily").await, 0);

    harness.orchestrator.shutdown().await;
}

/// Unknown groups are rejected at submit time.
#[tokio::test]
async fn unknown_group_rejected_at_submit() {
    let harness = start(1, 500, &[]);
    let err = harness
        .orchestrator
        .submit_plan("bananas")
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::UnknownGroup { .. }));
    harness.orchestrator.shutdown().await;
}

/// Schema mismatches are permanent: one dead letter, no retries.
#[tokio::test]
async fn schema_mismatch_dead_letters() {
    let harness = start(1, 500, &[MOUTAI]);
    // Response lacks the expected `close` column.
    harness.vendor.push_response(Ok(utf8_batch(
        &["ts_code", "trade_date"],
        vec![vec![Some(MOUTAI), Some("20240315")]],
    )));

    harness.orchestrator.submit_plan("daily").await.unwrap();
    harness.orchestrator.quiesce().await;

    let dead = harness.orchestrator.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error_kind, "schema_mismatch");
    assert_eq!(harness.vendor.call_count(), 1);

    let summary = harness.orchestrator.shutdown().await;
    assert_eq!(summary.fast.retried, 0);
    assert_eq!(summary.fast.dead_lettered, 1);
}

/// Cancellation: in-flight work completes, queued work terminates as
/// no-ops, and the summary accounts for every submitted task.
#[tokio::test(start_paused = true)]
async fn cancellation_drains_gracefully() {
    // A tight budget so queued downloads are still waiting when the
    // cancel lands.
    let harness = start(2, 1, &[MOUTAI, PINGAN, "300750.SZ"]);
    harness
        .vendor
        .set_default_response(Ok(daily_payload("batch", &["20240315"])));

    harness.orchestrator.submit_plan("daily").await.unwrap();

    // Let the first download through, then cancel.
    tokio::time::sleep(Duration::from_secs(1)).await;
    harness.orchestrator.cancel();

    let summary = harness.orchestrator.shutdown().await;

    let fast = summary.fast;
    assert_eq!(fast.submitted, 3);
    assert_eq!(
        fast.submitted,
        fast.succeeded + fast.failed + fast.dead_lettered + fast.cancelled,
    );
    assert!(fast.cancelled >= 1, "{fast:?}");

    let slow = summary.slow;
    assert_eq!(
        slow.submitted,
        slow.succeeded + slow.failed + slow.dead_lettered + slow.cancelled,
    );
}

/// Maintenance: compaction over the catalogue merges appended files.
#[tokio::test]
async fn maintenance_compacts_incremental_datasets() {
    let harness = start(1, 500, &[MOUTAI]);
    let daily = Arc::clone(harness.catalogue.get("daily").unwrap());

    harness
        .lake
        .append(&daily, daily_payload(MOUTAI, &["20240314"]))
        .await
        .unwrap();
    harness
        .lake
        .append(&daily, daily_payload(MOUTAI, &["20240314", "20240315"]))
        .await
        .unwrap();

    harness
        .orchestrator
        .submit_maintenance(MaintenanceKind::Compact { dataset: None })
        .await
        .unwrap();
    harness
        .orchestrator
        .submit_maintenance(MaintenanceKind::RebuildManifest { dataset: None })
        .await
        .unwrap();
    harness.orchestrator.quiesce().await;

    // One merged file, duplicates resolved.
    let year_dir = harness.lake.root().join("daily/year=2024");
    let files: Vec<_> = std::fs::read_dir(&year_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 1);
    assert_eq!(rows_on_disk(&harness, "daily").await, 2);

    let manifest = harness.lake.load_manifest(&daily).await.unwrap().unwrap();
    assert_eq!(manifest.total_rows(), 2);

    let summary = harness.orchestrator.shutdown().await;
    assert_eq!(summary.maint.succeeded, 2);
}

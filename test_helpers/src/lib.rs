//! Shared helpers for tests: temp dirs, logging, record-batch builders.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(clippy::clone_on_ref_ptr, clippy::dbg_macro, unreachable_pub)]

use std::{collections::BTreeMap, sync::Arc};

use arrow::{
    array::{ArrayRef, Float64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use data_types::{ApiDescriptor, DatasetDescriptor, DatasetName, UpdateStrategy};

/// A self-deleting temp dir.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    maybe_start_logging();
    tempfile::Builder::new().prefix("quotelake").tempdir()
}

/// Initialise test logging from `RUST_LOG`, once.
pub fn maybe_start_logging() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Build a string-typed record batch from column names and row tuples.
///
/// `None` cells become nulls; every column is `Utf8`.
pub fn utf8_batch(columns: &[&str], rows: Vec<Vec<Option<&str>>>) -> RecordBatch {
    let fields = columns
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, true))
        .collect::<Vec<_>>();
    let schema = Arc::new(Schema::new(fields));

    let arrays: Vec<ArrayRef> = (0..columns.len())
        .map(|col| {
            let values: StringArray =
                StringArray::from_iter(rows.iter().map(|row| row[col]));
            Arc::new(values) as ArrayRef
        })
        .collect();

    RecordBatch::try_new(schema, arrays).expect("valid test batch")
}

/// Build a batch with leading string columns and one trailing `Float64`
/// column, the shape of a typical vendor quote table.
pub fn quote_batch(
    string_columns: &[&str],
    float_column: &str,
    rows: Vec<(Vec<&str>, Option<f64>)>,
) -> RecordBatch {
    let mut fields = string_columns
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, true))
        .collect::<Vec<_>>();
    fields.push(Field::new(float_column, DataType::Float64, true));
    let schema = Arc::new(Schema::new(fields));

    let mut arrays: Vec<ArrayRef> = (0..string_columns.len())
        .map(|col| {
            let values: StringArray =
                StringArray::from_iter(rows.iter().map(|(strings, _)| Some(strings[col])));
            Arc::new(values) as ArrayRef
        })
        .collect();
    let floats: Float64Array = rows.iter().map(|(_, f)| *f).collect::<Vec<_>>().into();
    arrays.push(Arc::new(floats));

    RecordBatch::try_new(schema, arrays).expect("valid test batch")
}

/// A per-symbol incremental daily-bars descriptor, the workhorse of the
/// test suite.
pub fn daily_descriptor() -> DatasetDescriptor {
    DatasetDescriptor {
        name: DatasetName::try_new("daily").unwrap(),
        primary_key: vec!["ts_code".into(), "trade_date".into()],
        date_column: Some("trade_date".into()),
        api: ApiDescriptor {
            method: "daily".into(),
            base: None,
            fields: vec!["ts_code".into(), "trade_date".into(), "close".into()],
            symbol_param: Some("ts_code".into()),
            start_param: Some("start_date".into()),
            end_param: Some("end_date".into()),
            defaults: BTreeMap::new(),
        },
        strategy: UpdateStrategy::Incremental,
        per_symbol: true,
    }
}

/// A whole-market full-replace reference-list descriptor.
pub fn reference_descriptor() -> DatasetDescriptor {
    DatasetDescriptor {
        name: DatasetName::try_new("stock_basic").unwrap(),
        primary_key: vec!["ts_code".into()],
        date_column: None,
        api: ApiDescriptor {
            method: "stock_basic".into(),
            base: None,
            fields: vec!["ts_code".into(), "name".into(), "list_date".into()],
            symbol_param: None,
            start_param: None,
            end_param: None,
            defaults: BTreeMap::new(),
        },
        strategy: UpdateStrategy::FullReplace,
        per_symbol: false,
    }
}

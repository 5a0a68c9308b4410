//! Metadata reads over the live partition files, through the embedded
//! DataFusion engine.
//!
//! Every query lists the dataset's files fresh, so answers are always
//! consistent with what is currently visible on disk — a file published
//! a microsecond ago is included; a tree swapped out by a full replace
//! is not.

use std::{path::Path, sync::Arc};

use arrow::{
    array::StringArray,
    compute::kernels::{aggregate::max_string, comparison::eq_utf8_scalar, filter::filter},
    record_batch::RecordBatch,
};
use data_types::{DatasetDescriptor, Symbol, TradeDate};
use datafusion::{
    config::ConfigOptions,
    datasource::{
        file_format::{parquet::ParquetFormat, FileFormat},
        listing::PartitionedFile,
        object_store::ObjectStoreUrl,
    },
    execution::context::TaskContext,
    physical_plan::{
        execute_stream,
        file_format::{FileScanConfig, ParquetExec},
        SendableRecordBatchStream, Statistics,
    },
    prelude::{SessionConfig, SessionContext},
};
use futures::StreamExt;
use object_store::{path::Path as ObjectStorePath, ObjectMeta, ObjectStore};
use snafu::ResultExt;

use crate::{
    layout, ArrowSnafu, Error, InferSchemaSnafu, LakePathSnafu, ListFilesSnafu, Result, ScanSnafu,
};

/// List the published partition files of a dataset, in location order.
pub(crate) async fn list_partition_files(
    root: &Path,
    store: &Arc<dyn ObjectStore>,
    descriptor: &DatasetDescriptor,
) -> Result<Vec<ObjectMeta>> {
    let dataset_dir = layout::dataset_dir(root, &descriptor.name);
    if !dataset_dir.exists() {
        return Ok(Vec::new());
    }

    let prefix = ObjectStorePath::from_filesystem_path(&dataset_dir).context(LakePathSnafu {
        path: dataset_dir.clone(),
    })?;

    let mut entries = store.list(Some(&prefix)).await.context(ListFilesSnafu)?;
    let mut metas = Vec::new();
    while let Some(entry) = entries.next().await {
        let meta = entry.context(ListFilesSnafu)?;
        let Some(name) = meta.location.filename() else {
            continue;
        };
        if layout::is_partition_file(name) {
            metas.push(meta);
        }
    }

    // Location order == publication order, thanks to the timestamped
    // file names. Compaction and reader-side dedup rely on it.
    metas.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));
    Ok(metas)
}

/// Stream the given partition files as record batches.
pub(crate) async fn scan(
    store: Arc<dyn ObjectStore>,
    metas: Vec<ObjectMeta>,
) -> Result<SendableRecordBatchStream> {
    let format = ParquetFormat::new(Arc::new(parking_lot::RwLock::new(ConfigOptions::new())))
        .with_skip_metadata(Some(false));
    let file_schema = format
        .infer_schema(&store, &metas)
        .await
        .context(InferSchemaSnafu)?;

    let base_config = FileScanConfig {
        object_store_url: ObjectStoreUrl::local_filesystem(),
        file_schema,
        file_groups: vec![metas
            .into_iter()
            .map(|object_meta| PartitionedFile {
                object_meta,
                partition_values: vec![],
                range: None,
                extensions: None,
            })
            .collect()],
        statistics: Statistics::default(),
        projection: None,
        limit: None,
        table_partition_cols: vec![],
        output_ordering: None,
        config_options: ConfigOptions::new().into_shareable(),
    };

    let exec = ParquetExec::new(base_config, None, None);
    let session_ctx = SessionContext::with_config(SessionConfig::new().with_batch_size(8192));

    let task_ctx = Arc::new(TaskContext::from(&session_ctx));
    task_ctx
        .runtime_env()
        .register_object_store("file", "", store);

    execute_stream(Arc::new(exec), task_ctx)
        .await
        .context(ScanSnafu)
}

/// Max of the dataset's date column, optionally restricted to one
/// symbol. `None` when the dataset has no rows (or no date column).
pub(crate) async fn latest_date(
    root: &Path,
    store: Arc<dyn ObjectStore>,
    descriptor: &DatasetDescriptor,
    symbol: Option<&Symbol>,
) -> Result<Option<TradeDate>> {
    let Some(date_column) = descriptor.date_column.as_deref() else {
        return Ok(None);
    };

    let metas = list_partition_files(root, &store, descriptor).await?;
    if metas.is_empty() {
        return Ok(None);
    }

    let symbol_column = descriptor.symbol_column();
    let mut stream = scan(store, metas).await?;
    let mut best: Option<String> = None;

    while let Some(batch) = stream.next().await {
        let batch = batch.context(ArrowSnafu)?;
        let dates = string_column(descriptor, &batch, date_column)?;

        let batch_max = match (symbol, symbol_column) {
            (Some(symbol), Some(symbol_column)) => {
                let symbols = string_column(descriptor, &batch, symbol_column)?;
                let mask = eq_utf8_scalar(symbols, symbol.as_str()).context(ArrowSnafu)?;
                let filtered = filter(dates, &mask).context(ArrowSnafu)?;
                let filtered = filtered
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .expect("filter preserves array type");
                max_string(filtered).map(str::to_string)
            }
            _ => max_string(dates).map(str::to_string),
        };

        if let Some(value) = batch_max {
            if best.as_deref().map(|b| value.as_str() > b).unwrap_or(true) {
                best = Some(value);
            }
        }
    }

    match best {
        None => Ok(None),
        Some(value) => value
            .parse::<TradeDate>()
            .map(Some)
            .map_err(|_| Error::InvalidDate {
                dataset: descriptor.name.to_string(),
                value,
            }),
    }
}

/// Distinct values of `column` across the dataset, sorted.
pub(crate) async fn symbols(
    root: &Path,
    store: Arc<dyn ObjectStore>,
    descriptor: &DatasetDescriptor,
    column: &str,
) -> Result<Vec<Symbol>> {
    let metas = list_partition_files(root, &store, descriptor).await?;
    if metas.is_empty() {
        return Ok(Vec::new());
    }

    let mut stream = scan(store, metas).await?;
    let mut distinct = std::collections::BTreeSet::new();
    while let Some(batch) = stream.next().await {
        let batch = batch.context(ArrowSnafu)?;
        let values = string_column(descriptor, &batch, column)?;
        for value in values.iter().flatten() {
            if !distinct.contains(value) {
                distinct.insert(value.to_string());
            }
        }
    }

    Ok(distinct.into_iter().map(Symbol::new).collect())
}

/// Every row of the dataset, as a vector of batches.
pub(crate) async fn read_all(
    root: &Path,
    store: Arc<dyn ObjectStore>,
    descriptor: &DatasetDescriptor,
) -> Result<Vec<RecordBatch>> {
    let metas = list_partition_files(root, &store, descriptor).await?;
    if metas.is_empty() {
        return Ok(Vec::new());
    }

    let mut stream = scan(store, metas).await?;
    let mut batches = Vec::new();
    while let Some(batch) = stream.next().await {
        batches.push(batch.context(ArrowSnafu)?);
    }
    Ok(batches)
}

fn string_column<'a>(
    descriptor: &DatasetDescriptor,
    batch: &'a RecordBatch,
    column: &str,
) -> Result<&'a StringArray> {
    let index = batch
        .schema()
        .index_of(column)
        .map_err(|_| Error::MissingColumn {
            dataset: descriptor.name.to_string(),
            column: column.to_string(),
        })?;
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::NotAStringColumn {
            dataset: descriptor.name.to_string(),
            column: column.to_string(),
        })
}

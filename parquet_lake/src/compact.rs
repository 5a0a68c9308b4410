//! Year-partition compaction for incremental datasets.
//!
//! Appending produces one small file per (plan run, year); over time a
//! year partition accumulates many files, possibly overlapping on
//! primary key. Compaction merges each multi-file partition into a
//! single file, resolving duplicate primary keys the same way readers
//! must: the row from the later-published file wins.
//!
//! The merged file is published with the usual temp+rename discipline
//! before the input files are deleted, so a crash at any point leaves
//! readers with (at worst) duplicated rows, never missing rows. This is
//! the only path, besides the full-replace swap, that deletes published
//! files.

use std::{collections::HashMap, path::Path};

use arrow::{
    array::UInt32Array,
    compute::{concat_batches, take},
    record_batch::RecordBatch,
    util::display::array_value_to_string,
};
use data_types::DatasetDescriptor;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use snafu::ResultExt;
use tracing::{info, warn};

use crate::{layout, manifest, write, ArrowSnafu, Error, IoSnafu, ReadParquetSnafu, Result};

/// Outcome of a compaction pass over one dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactSummary {
    /// Year partitions merged.
    pub partitions_compacted: usize,

    /// Input files deleted.
    pub files_removed: usize,

    /// Duplicate rows dropped during merges.
    pub rows_deduplicated: usize,
}

pub(crate) fn compact(root: &Path, descriptor: &DatasetDescriptor) -> Result<CompactSummary> {
    let dataset_dir = layout::dataset_dir(root, &descriptor.name);
    let mut summary = CompactSummary::default();
    if !dataset_dir.exists() {
        return Ok(summary);
    }

    // Group files by year partition, in publication (name) order.
    let mut paths = manifest::partition_paths(&dataset_dir)?;
    paths.sort();
    let mut by_year: HashMap<Option<i32>, Vec<std::path::PathBuf>> = HashMap::new();
    for (year, path) in paths {
        by_year.entry(year).or_default().push(path);
    }

    for (year, files) in by_year {
        if files.len() < 2 {
            continue;
        }

        let dir = match year {
            Some(year) => layout::year_dir(&dataset_dir, year),
            None => dataset_dir.clone(),
        };

        let mut batches = Vec::new();
        for path in &files {
            batches.extend(read_file(path)?);
        }

        let schema = batches[0].schema();
        if batches.iter().any(|b| b.schema() != schema) {
            // Files written from vendor payloads that inferred different
            // column types cannot be merged losslessly; leave the
            // partition alone rather than guess at casts.
            warn!(
                dataset = %descriptor.name,
                ?year,
                "skipping compaction of partition with drifted schemas",
            );
            continue;
        }

        let merged = concat_batches(&schema, &batches).context(ArrowSnafu)?;
        let (deduped, dropped) = dedup_last_wins(descriptor, &merged)?;

        write::write_partition_file(&dir, &deduped)?;
        for path in &files {
            std::fs::remove_file(path).context(IoSnafu { path: path.clone() })?;
        }

        info!(
            dataset = %descriptor.name,
            ?year,
            inputs = files.len(),
            rows = deduped.num_rows(),
            dropped,
            "compacted year partition",
        );

        summary.partitions_compacted += 1;
        summary.files_removed += files.len();
        summary.rows_deduplicated += dropped;
    }

    Ok(summary)
}

fn read_file(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = std::fs::File::open(path).context(IoSnafu {
        path: path.to_path_buf(),
    })?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .context(ReadParquetSnafu {
            path: path.to_path_buf(),
        })?
        .build()
        .context(ReadParquetSnafu {
            path: path.to_path_buf(),
        })?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.context(ArrowSnafu)?);
    }
    Ok(batches)
}

/// Drop rows whose primary key reappears later in the batch, keeping the
/// last occurrence and the original row order of the survivors.
fn dedup_last_wins(
    descriptor: &DatasetDescriptor,
    batch: &RecordBatch,
) -> Result<(RecordBatch, usize)> {
    let key_columns = descriptor
        .primary_key
        .iter()
        .map(|name| {
            batch
                .schema()
                .index_of(name)
                .map_err(|_| Error::MissingColumn {
                    dataset: descriptor.name.to_string(),
                    column: name.clone(),
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut last_by_key: HashMap<String, u32> = HashMap::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut key = String::new();
        for &col in &key_columns {
            let value =
                array_value_to_string(batch.column(col), row).context(ArrowSnafu)?;
            key.push_str(&value);
            key.push('\u{1f}');
        }
        last_by_key.insert(key, row as u32);
    }

    let dropped = batch.num_rows() - last_by_key.len();
    if dropped == 0 {
        return Ok((batch.clone(), 0));
    }

    let mut survivors: Vec<u32> = last_by_key.into_values().collect();
    survivors.sort_unstable();

    let indices = UInt32Array::from(survivors);
    let columns = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context(ArrowSnafu)?;
    let deduped = RecordBatch::try_new(batch.schema(), columns).context(ArrowSnafu)?;
    Ok((deduped, dropped))
}

//! Append and full-replace writers.
//!
//! Both strategies share one low-level step: write a batch into a
//! directory as a temp file, fsync it, rename it to its final unique
//! name, and fsync the directory. A published file is never opened for
//! writing again.

use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

use arrow::{
    array::{Array, StringArray, UInt32Array},
    compute::take,
    record_batch::RecordBatch,
};
use data_types::{DatasetDescriptor, TradeDate};
use parquet::{
    arrow::ArrowWriter,
    basic::Compression,
    file::properties::WriterProperties,
};
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::{layout, ArrowSnafu, Error, IoSnafu, Result, WriteParquetSnafu};

/// Outcome of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendSummary {
    /// Newly published partition files.
    pub files: Vec<PathBuf>,

    /// Rows written across all files.
    pub rows: usize,
}

/// Outcome of a full replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceSummary {
    /// Rows published in the new tree.
    pub rows: usize,

    /// Whether a swap happened (false for an empty payload no-op).
    pub swapped: bool,
}

pub(crate) fn append(
    root: &Path,
    descriptor: &DatasetDescriptor,
    batch: RecordBatch,
) -> Result<AppendSummary> {
    if batch.num_rows() == 0 {
        debug!(dataset = %descriptor.name, "append of empty payload is a no-op");
        return Ok(AppendSummary {
            files: Vec::new(),
            rows: 0,
        });
    }

    let dataset_dir = layout::dataset_dir(root, &descriptor.name);
    let mut files = Vec::new();
    let rows = batch.num_rows();

    for (year, part) in partition_by_year(descriptor, &batch)? {
        let dir = match year {
            Some(year) => layout::year_dir(&dataset_dir, year),
            None => dataset_dir.clone(),
        };
        let path = write_partition_file(&dir, &part)?;
        info!(
            dataset = %descriptor.name,
            file = %path.display(),
            rows = part.num_rows(),
            "published partition file",
        );
        files.push(path);
    }

    Ok(AppendSummary { files, rows })
}

pub(crate) fn replace(
    root: &Path,
    descriptor: &DatasetDescriptor,
    batch: RecordBatch,
) -> Result<ReplaceSummary> {
    if batch.num_rows() == 0 {
        // An empty vendor payload must never wipe published data.
        debug!(dataset = %descriptor.name, "replace of empty payload is a no-op");
        return Ok(ReplaceSummary {
            rows: 0,
            swapped: false,
        });
    }

    let rows = batch.num_rows();
    let staging = layout::staging_dir(root, &descriptor.name);
    std::fs::create_dir_all(&staging).context(IoSnafu {
        path: staging.clone(),
    })?;

    for (year, part) in partition_by_year(descriptor, &batch)? {
        let dir = match year {
            Some(year) => layout::year_dir(&staging, year),
            None => staging.clone(),
        };
        write_partition_file(&dir, &part)?;
    }

    let live = layout::dataset_dir(root, &descriptor.name);
    if live.exists() {
        let old = layout::old_dir(root, &descriptor.name);
        std::fs::rename(&live, &old).context(IoSnafu { path: live.clone() })?;
        std::fs::rename(&staging, &live).context(IoSnafu { path: live.clone() })?;
        if let Err(e) = std::fs::remove_dir_all(&old) {
            // Residue is harmless; the sweep maintenance task will
            // collect it.
            warn!(path = %old.display(), error = %e, "failed to remove retired tree");
        }
    } else {
        std::fs::rename(&staging, &live).context(IoSnafu { path: live.clone() })?;
    }
    fsync_dir(root)?;

    info!(dataset = %descriptor.name, rows, "published replacement tree");
    Ok(ReplaceSummary {
        rows,
        swapped: true,
    })
}

/// Remove swap residue under the lake root, returning how many trees
/// were deleted.
pub(crate) fn sweep(root: &Path) -> Result<usize> {
    let mut removed = 0;
    let entries = std::fs::read_dir(root).context(IoSnafu {
        path: root.to_path_buf(),
    })?;
    for entry in entries {
        let entry = entry.context(IoSnafu {
            path: root.to_path_buf(),
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if layout::is_swap_residue(name) {
            let path = entry.path();
            std::fs::remove_dir_all(&path).context(IoSnafu { path: path.clone() })?;
            info!(path = %path.display(), "swept swap residue");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Split a payload by the year of the dataset's date column.
///
/// Datasets without a date column place all rows in one unpartitioned
/// group.
fn partition_by_year(
    descriptor: &DatasetDescriptor,
    batch: &RecordBatch,
) -> Result<Vec<(Option<i32>, RecordBatch)>> {
    let Some(date_column) = descriptor.date_column.as_deref() else {
        return Ok(vec![(None, batch.clone())]);
    };

    let dates = date_array(descriptor, batch, date_column)?;

    let mut by_year: BTreeMap<i32, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        if dates.is_null(row) {
            return Err(Error::InvalidDate {
                dataset: descriptor.name.to_string(),
                value: "<null>".to_string(),
            });
        }
        let value = dates.value(row);
        let date: TradeDate = value.parse().map_err(|_| Error::InvalidDate {
            dataset: descriptor.name.to_string(),
            value: value.to_string(),
        })?;
        by_year.entry(date.year()).or_default().push(row as u32);
    }

    let mut parts = Vec::with_capacity(by_year.len());
    for (year, rows) in by_year {
        let indices = UInt32Array::from(rows);
        let columns = batch
            .columns()
            .iter()
            .map(|c| take(c.as_ref(), &indices, None))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context(ArrowSnafu)?;
        let part = RecordBatch::try_new(batch.schema(), columns).context(ArrowSnafu)?;
        parts.push((Some(year), part));
    }
    Ok(parts)
}

pub(crate) fn date_array<'a>(
    descriptor: &DatasetDescriptor,
    batch: &'a RecordBatch,
    date_column: &str,
) -> Result<&'a StringArray> {
    let index =
        batch
            .schema()
            .index_of(date_column)
            .map_err(|_| Error::MissingColumn {
                dataset: descriptor.name.to_string(),
                column: date_column.to_string(),
            })?;
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::NotAStringColumn {
            dataset: descriptor.name.to_string(),
            column: date_column.to_string(),
        })
}

/// Write one batch into `dir` as a new uniquely-named partition file.
///
/// Temp-write + fsync + rename + directory fsync: a crash leaves at most
/// a `.tmp-` file that listings ignore, never a partial published file.
pub(crate) fn write_partition_file(dir: &Path, batch: &RecordBatch) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).context(IoSnafu {
        path: dir.to_path_buf(),
    })?;

    let final_name = layout::partition_file_name();
    let tmp_path = dir.join(format!("{}{final_name}", layout::TMP_PREFIX));
    let final_path = dir.join(&final_name);

    let file = File::create(&tmp_path).context(IoSnafu {
        path: tmp_path.clone(),
    })?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).context(
        WriteParquetSnafu {
            path: tmp_path.clone(),
        },
    )?;
    writer.write(batch).context(WriteParquetSnafu {
        path: tmp_path.clone(),
    })?;
    writer.close().context(WriteParquetSnafu {
        path: tmp_path.clone(),
    })?;

    let reopened = File::open(&tmp_path).context(IoSnafu {
        path: tmp_path.clone(),
    })?;
    reopened.sync_all().context(IoSnafu {
        path: tmp_path.clone(),
    })?;

    std::fs::rename(&tmp_path, &final_path).context(IoSnafu {
        path: final_path.clone(),
    })?;
    fsync_dir(dir)?;

    Ok(final_path)
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir).context(IoSnafu {
        path: dir.to_path_buf(),
    })?;
    handle.sync_all().context(IoSnafu {
        path: dir.to_path_buf(),
    })
}

//! The advisory manifest: a rebuildable index of a dataset's partition
//! files.
//!
//! The manifest is never the source of truth for row data — the
//! directory tree is. It exists so planners and analytical readers can
//! answer "which files, which years, which columns" without opening
//! every footer, and it can be rebuilt from the tree at any time by the
//! maintenance queue.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use data_types::DatasetDescriptor;
use parquet::file::{
    reader::{FileReader, SerializedFileReader},
    statistics::Statistics,
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::info;

use crate::{layout, DecodeManifestSnafu, EncodeManifestSnafu, IoSnafu, ReadParquetSnafu, Result};

/// One partition file as seen at rebuild time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the dataset directory.
    pub path: String,

    /// Year partition the file lives in; `None` for unpartitioned
    /// reference datasets.
    pub year: Option<i32>,

    /// Row count from the file footer.
    pub rows: i64,

    /// File size in bytes.
    pub bytes: u64,

    /// Minimum of the date column, from footer statistics.
    pub min_date: Option<String>,

    /// Maximum of the date column, from footer statistics.
    pub max_date: Option<String>,
}

/// One column of the dataset schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,

    /// Rendered arrow data type.
    pub data_type: String,
}

/// The manifest of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Dataset this manifest describes.
    pub dataset: String,

    /// When the manifest was rebuilt (RFC 3339).
    pub rebuilt_at: String,

    /// Column schema, from the first file footer.
    pub columns: Vec<ColumnMeta>,

    /// All partition files, in publication order.
    pub files: Vec<FileEntry>,
}

impl Manifest {
    /// Total rows across all files (before reader-side dedup).
    pub fn total_rows(&self) -> i64 {
        self.files.iter().map(|f| f.rows).sum()
    }
}

/// Walk the dataset tree and rebuild the manifest, persisting it at the
/// dataset root via temp-write + rename.
pub(crate) fn rebuild(root: &Path, descriptor: &DatasetDescriptor) -> Result<Manifest> {
    let dataset_dir = layout::dataset_dir(root, &descriptor.name);
    let mut files = Vec::new();
    let mut columns = Vec::new();

    if dataset_dir.exists() {
        let mut paths = partition_paths(&dataset_dir)?;
        paths.sort();
        for (year, path) in paths {
            let entry = read_footer(descriptor, &dataset_dir, &path, year, &mut columns)?;
            files.push(entry);
        }
    }

    let manifest = Manifest {
        dataset: descriptor.name.to_string(),
        rebuilt_at: chrono::Utc::now().to_rfc3339(),
        columns,
        files,
    };

    if dataset_dir.exists() {
        let encoded = serde_json::to_vec_pretty(&manifest).context(EncodeManifestSnafu)?;
        let final_path = layout::manifest_path(root, &descriptor.name);
        let tmp_path = dataset_dir.join(format!("{}manifest.json", layout::TMP_PREFIX));
        std::fs::write(&tmp_path, encoded).context(IoSnafu {
            path: tmp_path.clone(),
        })?;
        std::fs::rename(&tmp_path, &final_path).context(IoSnafu {
            path: final_path.clone(),
        })?;
        info!(
            dataset = %descriptor.name,
            files = manifest.files.len(),
            rows = manifest.total_rows(),
            "rebuilt manifest",
        );
    }

    Ok(manifest)
}

/// Load a stored manifest, `None` if never built.
pub(crate) fn load(path: &Path) -> Result<Option<Manifest>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).context(IoSnafu {
                path: path.to_path_buf(),
            })
        }
    };
    serde_json::from_reader(file)
        .map(Some)
        .context(DecodeManifestSnafu {
            path: path.to_path_buf(),
        })
}

/// All published partition files under a dataset directory, with their
/// year partition.
pub(crate) fn partition_paths(dataset_dir: &Path) -> Result<Vec<(Option<i32>, PathBuf)>> {
    let mut out = Vec::new();
    let entries = std::fs::read_dir(dataset_dir).context(IoSnafu {
        path: dataset_dir.to_path_buf(),
    })?;
    for entry in entries {
        let entry = entry.context(IoSnafu {
            path: dataset_dir.to_path_buf(),
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let path = entry.path();

        if path.is_dir() {
            if let Some(year) = layout::parse_year_dir(name) {
                let inner = std::fs::read_dir(&path).context(IoSnafu { path: path.clone() })?;
                for file in inner {
                    let file = file.context(IoSnafu { path: path.clone() })?;
                    let file_name = file.file_name();
                    let Some(file_name) = file_name.to_str() else {
                        continue;
                    };
                    if layout::is_partition_file(file_name) {
                        out.push((Some(year), file.path()));
                    }
                }
            }
        } else if layout::is_partition_file(name) {
            out.push((None, path));
        }
    }
    Ok(out)
}

fn read_footer(
    descriptor: &DatasetDescriptor,
    dataset_dir: &Path,
    path: &Path,
    year: Option<i32>,
    columns: &mut Vec<ColumnMeta>,
) -> Result<FileEntry> {
    let bytes = std::fs::metadata(path)
        .context(IoSnafu {
            path: path.to_path_buf(),
        })?
        .len();

    let file = File::open(path).context(IoSnafu {
        path: path.to_path_buf(),
    })?;
    let reader = SerializedFileReader::new(file).context(ReadParquetSnafu {
        path: path.to_path_buf(),
    })?;
    let metadata = reader.metadata();
    let file_metadata = metadata.file_metadata();

    if columns.is_empty() {
        let schema = parquet::arrow::parquet_to_arrow_schema(
            file_metadata.schema_descr(),
            file_metadata.key_value_metadata(),
        )
        .context(ReadParquetSnafu {
            path: path.to_path_buf(),
        })?;
        *columns = schema
            .fields()
            .iter()
            .map(|f| ColumnMeta {
                name: f.name().clone(),
                data_type: format!("{:?}", f.data_type()),
            })
            .collect();
    }

    let (min_date, max_date) = descriptor
        .date_column
        .as_deref()
        .map(|col| date_stats(metadata, col))
        .unwrap_or((None, None));

    Ok(FileEntry {
        path: path
            .strip_prefix(dataset_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned(),
        year,
        rows: file_metadata.num_rows(),
        bytes,
        min_date,
        max_date,
    })
}

/// Min/max of a string date column from row-group footer statistics.
fn date_stats(
    metadata: &parquet::file::metadata::ParquetMetaData,
    column: &str,
) -> (Option<String>, Option<String>) {
    let mut min: Option<String> = None;
    let mut max: Option<String> = None;

    for row_group in metadata.row_groups() {
        for column_chunk in row_group.columns() {
            if column_chunk.column_path().string() != column {
                continue;
            }
            let Some(Statistics::ByteArray(stats)) = column_chunk.statistics() else {
                continue;
            };
            if !stats.has_min_max_set() {
                continue;
            }
            if let Ok(value) = stats.min().as_utf8() {
                if min.as_deref().map(|m| value < m).unwrap_or(true) {
                    min = Some(value.to_string());
                }
            }
            if let Ok(value) = stats.max().as_utf8() {
                if max.as_deref().map(|m| value > m).unwrap_or(true) {
                    max = Some(value.to_string());
                }
            }
        }
    }
    (min, max)
}

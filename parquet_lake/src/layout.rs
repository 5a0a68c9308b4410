//! Path construction and parsing for the on-disk lake layout.

use std::path::{Path, PathBuf};

use data_types::DatasetName;
use rand::Rng;

/// Prefix of in-progress temp files; never visible to readers, skipped
/// by listings.
pub(crate) const TMP_PREFIX: &str = ".tmp-";

/// Extension of published partition files.
pub(crate) const PARQUET_EXT: &str = "parquet";

/// Name of the advisory manifest file at the dataset root.
pub(crate) const MANIFEST_FILE: &str = ".manifest.json";

pub(crate) fn dataset_dir(root: &Path, name: &DatasetName) -> PathBuf {
    root.join(name.as_str())
}

pub(crate) fn year_dir(dataset_dir: &Path, year: i32) -> PathBuf {
    dataset_dir.join(format!("year={year:04}"))
}

pub(crate) fn manifest_path(root: &Path, name: &DatasetName) -> PathBuf {
    dataset_dir(root, name).join(MANIFEST_FILE)
}

/// A unique partition file name: publication timestamp plus a random
/// suffix so concurrent appends never collide.
pub(crate) fn partition_file_name() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("{millis}-{suffix:08x}.{PARQUET_EXT}")
}

pub(crate) fn staging_dir(root: &Path, name: &DatasetName) -> PathBuf {
    root.join(format!(".staging-{}-{}", name.as_str(), uuid::Uuid::new_v4()))
}

pub(crate) fn old_dir(root: &Path, name: &DatasetName) -> PathBuf {
    root.join(format!(".old-{}-{}", name.as_str(), uuid::Uuid::new_v4()))
}

/// Whether a root-level directory entry is residue of a full-replace
/// swap (interrupted or merely not yet cleaned up).
pub(crate) fn is_swap_residue(file_name: &str) -> bool {
    file_name.starts_with(".staging-") || file_name.starts_with(".old-")
}

/// Whether a file name is a published partition file.
pub(crate) fn is_partition_file(file_name: &str) -> bool {
    !file_name.starts_with(TMP_PREFIX)
        && !file_name.starts_with('.')
        && Path::new(file_name)
            .extension()
            .map(|e| e == PARQUET_EXT)
            .unwrap_or(false)
}

/// Parse the year out of a `year=YYYY` directory name.
pub(crate) fn parse_year_dir(file_name: &str) -> Option<i32> {
    file_name.strip_prefix("year=")?.parse().ok()
}

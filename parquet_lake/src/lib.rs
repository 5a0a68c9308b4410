//! The year-partitioned Parquet data lake.
//!
//! On-disk layout, per dataset:
//!
//! ```text
//! <root>/<dataset>/year=<YYYY>/<millis>-<rand>.parquet   (dated datasets)
//! <root>/<dataset>/<millis>-<rand>.parquet               (reference datasets)
//! <root>/.staging-<dataset>-<uuid>/…                     (full-replace build area)
//! <root>/.old-<dataset>-<uuid>/…                         (full-replace retired tree)
//! ```
//!
//! Published partition files are immutable: appends only ever create new
//! uniquely-named files (temp-write + fsync + rename), and the
//! full-replace strategy publishes a complete staging tree with an atomic
//! directory rename. Readers that hold an open file handle across a swap
//! keep reading their snapshot.
//!
//! Metadata questions — "latest date present for (dataset, symbol)",
//! "what is the symbol universe" — are answered by scanning the live
//! partition files through the embedded DataFusion engine, so answers are
//! always consistent with what is visible on disk.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::todo,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub
)]

use std::{path::PathBuf, sync::Arc};

use data_types::{DatasetDescriptor, Symbol, TradeDate};
use object_store::{local::LocalFileSystem, ObjectStore};
use snafu::{ResultExt, Snafu};

mod compact;
mod layout;
mod manifest;
mod read;
mod write;

pub use compact::CompactSummary;
pub use manifest::{ColumnMeta, FileEntry, Manifest};
pub use write::{AppendSummary, ReplaceSummary};

/// Errors from lake operations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("io error on {path:?}: {source}"))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to write parquet {path:?}: {source}"))]
    WriteParquet {
        path: PathBuf,
        source: parquet::errors::ParquetError,
    },

    #[snafu(display("failed to read parquet {path:?}: {source}"))]
    ReadParquet {
        path: PathBuf,
        source: parquet::errors::ParquetError,
    },

    #[snafu(display("dataset {dataset} payload is missing column {column}"))]
    MissingColumn { dataset: String, column: String },

    #[snafu(display("dataset {dataset} column {column} is not a string column"))]
    NotAStringColumn { dataset: String, column: String },

    #[snafu(display("dataset {dataset} has row with invalid date {value:?}"))]
    InvalidDate { dataset: String, value: String },

    #[snafu(display("arrow error: {source}"))]
    Arrow { source: arrow::error::ArrowError },

    #[snafu(display("invalid lake path {path:?}: {source}"))]
    LakePath {
        path: PathBuf,
        source: object_store::path::Error,
    },

    #[snafu(display("failed to list partition files: {source}"))]
    ListFiles { source: object_store::Error },

    #[snafu(display("failed to infer dataset schema: {source}"))]
    InferSchema {
        source: datafusion::error::DataFusionError,
    },

    #[snafu(display("failed to scan dataset: {source}"))]
    Scan {
        source: datafusion::error::DataFusionError,
    },

    #[snafu(display("failed to encode manifest: {source}"))]
    EncodeManifest { source: serde_json::Error },

    #[snafu(display("failed to decode manifest {path:?}: {source}"))]
    DecodeManifest {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("background write task panicked: {source}"))]
    Join { source: tokio::task::JoinError },
}

impl Error {
    /// Whether a persist hitting this error is worth retrying.
    ///
    /// I/O failures may be transient (e.g. ENOSPC recovered by the
    /// operator); payload-shape failures are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::WriteParquet { .. }
                | Self::ListFiles { .. }
                | Self::Join { .. }
        )
    }
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Handle to the data lake rooted at one directory.
///
/// Shared process-wide; all mutation flows through the orchestrator's
/// single persist worker, but nothing here relies on that — appends use
/// unique file names and replaces use atomic renames, so external
/// analytical readers are always safe.
#[derive(Debug)]
pub struct Lake {
    root: PathBuf,
    store: Arc<dyn ObjectStore>,
}

impl Lake {
    /// Open (creating if needed) the lake rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).context(IoSnafu { path: root.clone() })?;
        // Canonicalise so object-store paths and rename sources agree.
        let root = root
            .canonicalize()
            .context(IoSnafu { path: root.clone() })?;
        Ok(Self {
            root,
            store: Arc::new(LocalFileSystem::new()),
        })
    }

    /// The lake root directory.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Append a batch of rows to an incremental dataset.
    ///
    /// Rows are partitioned by the year of the dataset's date column and
    /// written as one new immutable file per touched year. Not
    /// idempotent: appending the same payload twice duplicates rows, and
    /// readers that need uniqueness deduplicate on the primary key.
    ///
    /// Rows dated outside whatever range was requested from the vendor
    /// are written as-is; the vendor response is treated as source truth.
    pub async fn append(
        &self,
        descriptor: &DatasetDescriptor,
        batch: arrow::record_batch::RecordBatch,
    ) -> Result<AppendSummary> {
        let root = self.root.clone();
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || write::append(&root, &descriptor, batch))
            .await
            .context(JoinSnafu)?
    }

    /// Atomically replace the full contents of a dataset.
    ///
    /// The new tree is staged as a hidden sibling of the dataset
    /// directory and published by rename, so a reader sees either the
    /// whole old tree or the whole new tree. An empty payload is a no-op:
    /// it never wipes previously published data.
    pub async fn replace(
        &self,
        descriptor: &DatasetDescriptor,
        batch: arrow::record_batch::RecordBatch,
    ) -> Result<ReplaceSummary> {
        let root = self.root.clone();
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || write::replace(&root, &descriptor, batch))
            .await
            .context(JoinSnafu)?
    }

    /// The latest value of the dataset's date column on disk, optionally
    /// restricted to one symbol. `None` means no matching rows exist and
    /// a full-history fetch is needed.
    pub async fn latest_date(
        &self,
        descriptor: &DatasetDescriptor,
        symbol: Option<&Symbol>,
    ) -> Result<Option<TradeDate>> {
        read::latest_date(&self.root, Arc::clone(&self.store), descriptor, symbol).await
    }

    /// The distinct values of `column` across a dataset, sorted. Used by
    /// the planner to enumerate the symbol universe from a reference
    /// dataset.
    pub async fn symbols(
        &self,
        descriptor: &DatasetDescriptor,
        column: &str,
    ) -> Result<Vec<Symbol>> {
        read::symbols(&self.root, Arc::clone(&self.store), descriptor, column).await
    }

    /// Read every row of a dataset. Diagnostic / test aid.
    pub async fn read_dataset(
        &self,
        descriptor: &DatasetDescriptor,
    ) -> Result<Vec<arrow::record_batch::RecordBatch>> {
        read::read_all(&self.root, Arc::clone(&self.store), descriptor).await
    }

    /// Rebuild the dataset's manifest from the directory tree and store
    /// it at the dataset root.
    pub async fn rebuild_manifest(&self, descriptor: &DatasetDescriptor) -> Result<Manifest> {
        let root = self.root.clone();
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || manifest::rebuild(&root, &descriptor))
            .await
            .context(JoinSnafu)?
    }

    /// Load the stored manifest for a dataset, if one has been built.
    pub async fn load_manifest(&self, descriptor: &DatasetDescriptor) -> Result<Option<Manifest>> {
        let path = layout::manifest_path(&self.root, &descriptor.name);
        tokio::task::spawn_blocking(move || manifest::load(&path))
            .await
            .context(JoinSnafu)?
    }

    /// Merge multi-file year partitions of an incremental dataset into
    /// one file per year, deduplicating on the primary key
    /// (last-published file wins).
    pub async fn compact(&self, descriptor: &DatasetDescriptor) -> Result<CompactSummary> {
        let root = self.root.clone();
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || compact::compact(&root, &descriptor))
            .await
            .context(JoinSnafu)?
    }

    /// Delete staging/old trees left behind by interrupted full-replace
    /// swaps. Returns the number of trees removed.
    pub async fn sweep(&self) -> Result<usize> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || write::sweep(&root))
            .await
            .context(JoinSnafu)?
    }
}

//! The metadata-driven fetcher factory.
//!
//! [`FetcherFactory::build`] turns a task name plus bound parameters into
//! a [`Fetcher`]: a parameterless unit of network work that, when
//! invoked, passes the rate-limit gate and performs exactly one vendor
//! call described by the dataset's catalogue entry. Because everything a
//! call needs is in the catalogue, adding a dataset adds no code here.
//!
//! `build` is pure — all validation happens up front, so a task with bad
//! parameters fails before any I/O and can be dead-lettered immediately.

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

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use arrow::record_batch::RecordBatch;
use catalogue::Catalogue;
use data_types::{DatasetDescriptor, DatasetName};
use rate_limit::RateLimiter;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vendor_api::{empty_table, VendorClient, VendorError, VendorRequest};

/// Errors constructing a fetcher. All permanent: never retried.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The task name is not in the catalogue.
    #[error("unknown task {name}")]
    UnknownTask {
        /// The missing name.
        name: String,
    },

    /// The bound parameters do not fit the dataset's API descriptor.
    #[error("bad params for task {name}: {reason}")]
    BadParams {
        /// The task.
        name: String,
        /// What was wrong.
        reason: String,
    },
}

/// Errors from invoking a fetcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The vendor call failed.
    #[error(transparent)]
    Vendor(#[from] VendorError),

    /// The response is missing expected columns.
    #[error("schema mismatch for {dataset}: missing columns {missing:?}")]
    SchemaMismatch {
        /// The dataset.
        dataset: String,
        /// Expected columns absent from the response.
        missing: Vec<String>,
    },

    /// Cancelled while waiting for a rate-limit token; no vendor call
    /// was made.
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the orchestrator should retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Vendor(e) => e.is_transient(),
            Self::SchemaMismatch { .. } | Self::Cancelled => false,
        }
    }
}

/// Builds [`Fetcher`]s from catalogue metadata.
#[derive(Debug)]
pub struct FetcherFactory {
    catalogue: Arc<Catalogue>,
    rate_limiter: Arc<RateLimiter>,
    vendor: Arc<dyn VendorClient>,
}

impl FetcherFactory {
    /// Create a factory over the shared component graph.
    pub fn new(
        catalogue: Arc<Catalogue>,
        rate_limiter: Arc<RateLimiter>,
        vendor: Arc<dyn VendorClient>,
    ) -> Self {
        Self {
            catalogue,
            rate_limiter,
            vendor,
        }
    }

    /// Bind `params` onto the named dataset's API descriptor.
    ///
    /// Rejects parameters the descriptor does not declare bindable, and
    /// missing required ones: the symbol for per-symbol datasets, the
    /// range bounds for dated datasets.
    pub fn build(
        &self,
        task_name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Fetcher, BuildError> {
        let descriptor = self
            .catalogue
            .get(task_name)
            .map_err(|_| BuildError::UnknownTask {
                name: task_name.to_string(),
            })?;

        let bindable: BTreeSet<&str> = descriptor.api.bindable_params().collect();
        for key in params.keys() {
            if !bindable.contains(key.as_str()) {
                return Err(BuildError::BadParams {
                    name: task_name.to_string(),
                    reason: format!("parameter {key} is not bindable for this dataset"),
                });
            }
        }

        let mut required: Vec<&str> = Vec::new();
        if descriptor.per_symbol {
            required.extend(descriptor.api.symbol_param.as_deref());
        }
        if descriptor.date_column.is_some() {
            required.extend(descriptor.api.start_param.as_deref());
            required.extend(descriptor.api.end_param.as_deref());
        }
        let missing: Vec<&str> = required
            .into_iter()
            .filter(|r| !params.contains_key(*r))
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::BadParams {
                name: task_name.to_string(),
                reason: format!("missing required parameters {missing:?}"),
            });
        }

        let mut merged = descriptor.api.defaults.clone();
        merged.extend(params.clone());

        Ok(Fetcher {
            descriptor: Arc::clone(descriptor),
            request: VendorRequest {
                method: descriptor.api.method.clone(),
                base: descriptor.api.base.clone(),
                params: merged,
                fields: descriptor.api.fields.clone(),
            },
            rate_limiter: Arc::clone(&self.rate_limiter),
            vendor: Arc::clone(&self.vendor),
        })
    }
}

/// One fully-bound unit of vendor work.
#[derive(Debug)]
pub struct Fetcher {
    descriptor: Arc<DatasetDescriptor>,
    request: VendorRequest,
    rate_limiter: Arc<RateLimiter>,
    vendor: Arc<dyn VendorClient>,
}

impl Fetcher {
    /// The dataset this fetcher serves.
    pub fn dataset(&self) -> &DatasetName {
        &self.descriptor.name
    }

    /// The bound request, for logging and tests.
    pub fn request(&self) -> &VendorRequest {
        &self.request
    }

    /// Acquire a rate-limit token, then perform the vendor call.
    ///
    /// A vendor `Empty` outcome becomes an empty batch carrying the
    /// expected column set, so downstream persists stay observable.
    /// Extra response columns are kept; missing expected columns are a
    /// [`FetchError::SchemaMismatch`].
    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<RecordBatch, FetchError> {
        self.rate_limiter
            .acquire(self.descriptor.name.as_str(), cancel)
            .await
            .map_err(|_| FetchError::Cancelled)?;

        let batch = match self.vendor.invoke(&self.request).await {
            Ok(batch) => batch,
            Err(VendorError::Empty) => {
                debug!(dataset = %self.descriptor.name, "vendor returned no rows");
                return Ok(empty_table(&self.request.fields));
            }
            Err(e) => return Err(e.into()),
        };

        let schema = batch.schema();
        let missing: Vec<String> = self
            .request
            .fields
            .iter()
            .filter(|f| schema.index_of(f).is_err())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(FetchError::SchemaMismatch {
                dataset: self.descriptor.name.to_string(),
                missing,
            });
        }

        Ok(batch)
    }
}

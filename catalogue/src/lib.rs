//! The declarative table catalogue.
//!
//! The catalogue is the single source of dispatch metadata for the whole
//! pipeline: which datasets exist, how each is fetched from the vendor,
//! and how each is persisted. Adding a dataset means adding a catalogue
//! entry and restarting — no new fetch or write code.
//!
//! The catalogue is loaded once at startup, validated in full, and
//! read-only afterwards. Any inconsistency (unknown keys, groups naming
//! missing datasets, incremental datasets without a date column) is a
//! startup error, so the invariant "every task name a group references
//! resolves" holds for the life of the process.

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
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use data_types::{DatasetDescriptor, DatasetName, UpdateStrategy};
use serde::Deserialize;

/// Errors loading or querying the catalogue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The catalogue file could not be read.
    #[error("failed to read catalogue {path:?}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The catalogue file is not valid TOML for the expected shape
    /// (includes unknown keys, which are rejected).
    #[error("failed to parse catalogue: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two entries share a dataset name.
    #[error("duplicate dataset {name}")]
    DuplicateDataset {
        /// The duplicated name.
        name: DatasetName,
    },

    /// A dataset has an empty primary key.
    #[error("dataset {name} has an empty primary key")]
    EmptyPrimaryKey {
        /// The offending dataset.
        name: DatasetName,
    },

    /// An incremental dataset without a date column cannot be planned.
    #[error("incremental dataset {name} has no date_column")]
    MissingDateColumn {
        /// The offending dataset.
        name: DatasetName,
    },

    /// A per-symbol dataset whose API binds no symbol parameter.
    #[error("per-symbol dataset {name} has no api.symbol_param")]
    MissingSymbolParam {
        /// The offending dataset.
        name: DatasetName,
    },

    /// A dataset with a date column whose API cannot bind a range.
    #[error("dataset {name} has a date_column but no api.start_param/end_param")]
    MissingRangeParams {
        /// The offending dataset.
        name: DatasetName,
    },

    /// A group references a dataset that does not exist.
    #[error("group {group} references unknown dataset {name}")]
    UnknownTaskInGroup {
        /// The group.
        group: String,
        /// The missing dataset.
        name: DatasetName,
    },

    /// Lookup of a task name that is not in the catalogue.
    #[error("unknown task {name}")]
    UnknownTask {
        /// The missing name.
        name: String,
    },

    /// Lookup of a group name that is neither a group nor a dataset.
    #[error("unknown task group {name}")]
    UnknownGroup {
        /// The missing name.
        name: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogueFile {
    #[serde(default, rename = "dataset")]
    datasets: Vec<DatasetDescriptor>,

    #[serde(default)]
    groups: BTreeMap<String, Vec<DatasetName>>,
}

/// The validated, read-only table catalogue.
#[derive(Debug)]
pub struct Catalogue {
    datasets: BTreeMap<DatasetName, Arc<DatasetDescriptor>>,
    groups: BTreeMap<String, Vec<DatasetName>>,
}

impl Catalogue {
    /// Parse and validate a catalogue from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let file: CatalogueFile = toml::from_str(text)?;

        let mut datasets = BTreeMap::new();
        for descriptor in file.datasets {
            validate_descriptor(&descriptor)?;
            let name = descriptor.name.clone();
            if datasets.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(Error::DuplicateDataset { name });
            }
        }

        for (group, members) in &file.groups {
            for member in members {
                if !datasets.contains_key(member) {
                    return Err(Error::UnknownTaskInGroup {
                        group: group.clone(),
                        name: member.clone(),
                    });
                }
            }
        }

        Ok(Self {
            datasets,
            groups: file.groups,
        })
    }

    /// Load a catalogue file from disk.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// The catalogue shipped with the binary, covering the production
    /// vendor tables.
    pub fn builtin() -> Self {
        Self::from_toml(include_str!("builtin.toml")).expect("builtin catalogue is valid")
    }

    /// Look up a dataset by task name.
    pub fn get(&self, task_name: &str) -> Result<&Arc<DatasetDescriptor>, Error> {
        self.datasets.get(task_name).ok_or_else(|| Error::UnknownTask {
            name: task_name.to_string(),
        })
    }

    /// Resolve a task-group alias to its member datasets.
    ///
    /// A name that is not a group but is a dataset resolves to a
    /// singleton, so `plan daily` works without declaring a one-element
    /// group.
    pub fn list_group(&self, group_name: &str) -> Result<Vec<DatasetName>, Error> {
        if let Some(members) = self.groups.get(group_name) {
            return Ok(members.clone());
        }
        if let Some(descriptor) = self.datasets.get(group_name) {
            return Ok(vec![descriptor.name.clone()]);
        }
        Err(Error::UnknownGroup {
            name: group_name.to_string(),
        })
    }

    /// All dataset descriptors, in name order.
    pub fn datasets(&self) -> impl Iterator<Item = &Arc<DatasetDescriptor>> {
        self.datasets.values()
    }
}

fn validate_descriptor(descriptor: &DatasetDescriptor) -> Result<(), Error> {
    let name = descriptor.name.clone();
    if descriptor.primary_key.is_empty() {
        return Err(Error::EmptyPrimaryKey { name });
    }
    if descriptor.strategy == UpdateStrategy::Incremental && descriptor.date_column.is_none() {
        return Err(Error::MissingDateColumn { name });
    }
    if descriptor.per_symbol && descriptor.api.symbol_param.is_none() {
        return Err(Error::MissingSymbolParam { name });
    }
    if descriptor.date_column.is_some()
        && (descriptor.api.start_param.is_none() || descriptor.api.end_param.is_none())
    {
        return Err(Error::MissingRangeParams { name });
    }
    Ok(())
}

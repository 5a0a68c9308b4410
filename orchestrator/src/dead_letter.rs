//! The dead-letter store: durable records of permanently failed tasks.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::task::Params;

/// File name of the dead-letter log under the lake root.
pub const DEAD_LETTER_FILE: &str = ".dead_letters.jsonl";

/// A permanently failed task, for human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// `download` or `persist`.
    pub task_kind: String,

    /// Dataset the task concerned.
    pub task_name: String,

    /// Bound parameters of the task.
    pub params: Params,

    /// Attempts consumed before giving up (1-based count).
    pub attempts: u32,

    /// Stable error kind, e.g. `bad_params`, `schema_mismatch`,
    /// `vendor`, `write`.
    pub last_error_kind: String,

    /// Rendered last error.
    pub last_error_message: String,

    /// Correlation id of the failed task.
    pub correlation_id: String,
}

/// Appends records to a JSONL file and keeps them in memory for the exit
/// summary.
///
/// Unlike the queues, dead letters survive a restart: the file is the
/// operator's worklist.
#[derive(Debug)]
pub struct DeadLetterStore {
    path: PathBuf,
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl DeadLetterStore {
    /// Store appending to `<root>/.dead_letters.jsonl`.
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(DEAD_LETTER_FILE),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Record a permanently failed task.
    ///
    /// A failure to write the file is logged but never propagated; the
    /// in-memory record still exists, and failing the caller would turn
    /// a bookkeeping error into a pipeline error.
    pub fn record(&self, record: DeadLetterRecord) {
        error!(
            task_kind = %record.task_kind,
            task_name = %record.task_name,
            correlation_id = %record.correlation_id,
            attempts = record.attempts,
            error_kind = %record.last_error_kind,
            error = %record.last_error_message,
            "task dead-lettered",
        );

        match serde_json::to_string(&record) {
            Ok(line) => {
                let result = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .and_then(|mut f| writeln!(f, "{line}"));
                if let Err(e) = result {
                    error!(path = %self.path.display(), error = %e, "failed to append dead letter");
                }
            }
            Err(e) => error!(error = %e, "failed to encode dead letter"),
        }

        self.records.lock().push(record);
    }

    /// Records accumulated this run.
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }

    /// Load all records ever written to the file.
    pub fn load_all(&self) -> std::io::Result<Vec<DeadLetterRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeadLetterStore::new(dir.path());

        let record = DeadLetterRecord {
            task_kind: "download".into(),
            task_name: "daily".into(),
            params: Params::from([("ts_code".to_string(), "600519.SH".to_string())]),
            attempts: 3,
            last_error_kind: "vendor".into(),
            last_error_message: "vendor call timed out".into(),
            correlation_id: "a-b-c".into(),
        };
        store.record(record.clone());
        store.record(DeadLetterRecord {
            task_name: "income".into(),
            ..record.clone()
        });

        assert_eq!(store.records().len(), 2);

        // A fresh store over the same root sees the durable records.
        let reloaded = DeadLetterStore::new(dir.path()).load_all().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[0], record);
        assert_eq!(reloaded[1].task_name, "income");
    }
}

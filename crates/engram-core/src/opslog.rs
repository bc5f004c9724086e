//! Operations log.
//!
//! Append-only, line-delimited JSON records of consolidation runs and
//! health repairs, next to the database file. Rotation is size-based: when
//! the file exceeds the configured threshold it is renamed to `<path>.1`
//! (replacing any previous rotation) and a fresh file is started.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{MemoryError, Result};

/// One log line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsRecord {
    pub at: DateTime<Utc>,
    /// `consolidation` or `health`.
    pub kind: String,
    /// Pass horizon or check name.
    pub name: String,
    /// `completed`, `failed`, `cancelled`, or `repaired`.
    pub status: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counts: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl OpsRecord {
    pub fn consolidation(
        name: &str,
        status: &str,
        counts: BTreeMap<String, i64>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            at,
            kind: "consolidation".to_string(),
            name: name.to_string(),
            status: status.to_string(),
            counts,
            detail: None,
        }
    }

    pub fn health(status: &str, detail: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            at,
            kind: "health".to_string(),
            name: "check".to_string(),
            status: status.to_string(),
            counts: BTreeMap::new(),
            detail: Some(detail.into()),
        }
    }
}

/// Size-rotated JSONL writer.
pub struct OpsLog {
    path: PathBuf,
    max_bytes: u64,
    file: Mutex<File>,
}

impl OpsLog {
    /// Open (appending) or create the log at `path`.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            max_bytes,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, rotating first if the file is over budget.
    pub fn append(&self, record: &OpsRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| MemoryError::Corruption(format!("ops record serialization: {e}")))?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| MemoryError::Corruption("ops log lock poisoned".to_string()))?;

        if file.metadata()?.len() > self.max_bytes {
            let rotated = self.path.with_extension("jsonl.1");
            let _ = std::fs::remove_file(&rotated);
            std::fs::rename(&self.path, &rotated)?;
            *file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            tracing::info!(path = %rotated.display(), "rotated ops log");
        }

        writeln!(file, "{line}")?;
        Ok(())
    }
}

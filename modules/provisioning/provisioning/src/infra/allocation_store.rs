//! Persistence for the port allocation table.
//!
//! The allocator keeps the authoritative table in memory and writes the whole
//! snapshot through an [`AllocationStore`] on every mutation. The table is
//! small (one row per pool port) so full rewrites are cheap.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use provisioning_sdk::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const FORMAT_VERSION: u32 = 1;

/// One row of the allocation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt allocation table {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported allocation table version {version} in {path}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

/// Synchronous snapshot store. Called with the allocator lock held, so
/// implementations must be quick and must not block on the async runtime.
pub trait AllocationStore: Send + Sync {
    /// Load the last saved table, `None` if nothing was ever saved.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the table exists but cannot be read.
    fn load(&self) -> Result<Option<Vec<PortRecord>>, StoreError>;

    /// Replace the saved table.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the table cannot be written.
    fn save(&self, records: &[PortRecord]) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize)]
struct TableFile {
    version: u32,
    ports: Vec<PortRecord>,
}

/// JSON file replaced atomically (temp file in the same directory + rename).
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl AllocationStore for JsonFileStore {
    fn load(&self) -> Result<Option<Vec<PortRecord>>, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };

        let file: TableFile = serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        if file.version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: self.path.clone(),
                version: file.version,
            });
        }

        Ok(Some(file.ports))
    }

    fn save(&self, records: &[PortRecord]) -> Result<(), StoreError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;

        let file = TableFile {
            version: FORMAT_VERSION,
            ports: records.to_vec(),
        };
        let body = serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_err(e))?;
        tmp.write_all(&body).map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }
}

/// Volatile store for tests and `--mock` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Option<Vec<PortRecord>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AllocationStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<PortRecord>>, StoreError> {
        Ok(self.records.lock().clone())
    }

    fn save(&self, records: &[PortRecord]) -> Result<(), StoreError> {
        *self.records.lock() = Some(records.to_vec());
        Ok(())
    }
}

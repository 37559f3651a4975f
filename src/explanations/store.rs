// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence for the explanation table.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{InterpError, Result};

use super::ExplanationTable;

/// Where a cached explanation table lives.
pub trait ExplanationStore {
    /// Whether a cache artifact is present.
    fn exists(&self) -> bool;

    /// Read the cached table.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Cache`] if the artifact cannot be decoded.
    fn load(&self) -> Result<ExplanationTable>;

    /// Persist `table`.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::Io`] or [`InterpError::Cache`] on write failure.
    fn save(&self, table: &ExplanationTable) -> Result<()>;
}

/// JSON file on local (or attached) storage.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Store at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The cache artifact path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling path the table is written to before being renamed into place.
    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}

impl ExplanationStore for FileStore {
    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn load(&self) -> Result<ExplanationTable> {
        let bytes = std::fs::read(&self.path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| InterpError::Cache(format!("{}: {e}", self.path.display())))
    }

    fn save(&self, table: &ExplanationTable) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec(table)
            .map_err(|e| InterpError::Cache(format!("serialize explanations: {e}")))?;

        // Readers only ever see a missing file or a complete one.
        let staging = self.staging_path();
        std::fs::write(&staging, bytes)?;
        std::fs::rename(&staging, &self.path)?;
        debug!(path = %self.path.display(), rows = table.len(), "wrote explanations cache");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::explanations::ExplanationRecord;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested/explanations.json"));
        assert!(!store.exists());

        let table = ExplanationTable::from_records(vec![
            ExplanationRecord::new(42, "foxes"),
            ExplanationRecord::new(3, "dogs"),
        ]);
        store.save(&table).unwrap();
        assert!(store.exists());
        assert_eq!(store.load().unwrap(), table);

        // No staging file left behind.
        let leftovers = std::fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn corrupt_cache_is_a_cache_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("explanations.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = FileStore::new(path).load().unwrap_err();
        assert!(matches!(err, InterpError::Cache(_)));
    }
}

//! JSON snapshot persistence.
//!
//! Each collection lives in one JSON array file that is read whole at
//! startup and rewritten whole after every mutation. Writes go to a
//! sibling temp file that is then renamed over the target, so a crash
//! mid-write leaves the previous snapshot intact.

use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// One collection persisted as a JSON array.
#[derive(Debug, Clone)]
pub struct JsonSnapshot<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSnapshot<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Snapshot file `name` inside directory `dir`.
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::new(dir.join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is an empty collection.
    pub fn load(&self) -> Result<Vec<T>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::persistence(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|source| Error::CorruptSnapshot {
            path: self.path.clone(),
            source,
        })
    }

    /// Read the snapshot, logging and discarding any failure.
    pub fn load_or_empty(&self) -> Vec<T> {
        match self.load() {
            Ok(items) => {
                debug!(path = %self.path.display(), count = items.len(), "Loaded snapshot");
                items
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot unreadable, starting empty");
                Vec::new()
            }
        }
    }

    /// Rewrite the whole snapshot atomically.
    pub fn write(&self, items: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::persistence(parent, e))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(items)?;
        {
            let mut file =
                fs::File::create(&temp_path).map_err(|e| Error::persistence(&temp_path, e))?;
            file.write_all(&json)
                .and_then(|_| file.sync_all())
                .map_err(|e| Error::persistence(&temp_path, e))?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| Error::persistence(&self.path, e))?;
        Ok(())
    }

    /// Rewrite the snapshot; failures are logged and in-memory state is kept.
    pub fn write_or_log(&self, items: &[T]) {
        if let Err(e) = self.write(items) {
            error!(path = %self.path.display(), error = %e, "Failed to persist snapshot");
        }
    }
}

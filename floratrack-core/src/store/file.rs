//! JSON persistence for [`LocalStore`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{LocalStore, StoreError, StoreSnapshot};

const STORE_FILENAME: &str = "store.json";

/// Location of the persisted store.
#[derive(Debug, Clone)]
pub struct StoreFile {
    path: PathBuf,
}

impl StoreFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store file inside a data directory.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(STORE_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the store from disk.
    ///
    /// Returns `Ok(None)` if the file doesn't exist. A file that cannot be
    /// parsed, or whose contents disagree with themselves, is reported as
    /// [`StoreError::Corruption`].
    pub fn load(&self) -> Result<Option<LocalStore>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(self.path.clone(), e)),
        };

        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Corruption(format!("cannot parse {}: {}", self.path.display(), e))
        })?;
        LocalStore::from_snapshot(snapshot).map(Some)
    }

    /// Writes the store to disk, replacing the previous file atomically.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self, store: &LocalStore) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
        }

        let json = serde_json::to_vec_pretty(&store.to_snapshot())
            .map_err(|e| StoreError::Io(self.path.clone(), io::Error::other(e)))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| StoreError::Io(tmp.clone(), e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(self.path.clone(), e))?;

        Ok(())
    }

    /// Deletes the file. Missing files are not an error.
    pub fn remove(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(self.path.clone(), e)),
        }
    }
}

// Persistent artifact storage. A store maps a unit's qualified name to the bytes of a
// previously generated image. Lookups are by name only; the fingerprint recorded inside
// the image is what the static loader compares against the requested unit, so a store
// never has to know about IR versions. DirectoryStore is what a static deployment ships:
// one `<name>.o` file per unit under a root directory, each write going through its own
// temporary file that is renamed into place, so a concurrent reader sees either the old
// image or the new one and concurrent writers never share a temporary path. MemoryStore
// keeps images in a hashbrown map and is what tests and embedders use.

//! Artifact stores for precompiled images.

use crate::core::unit::UnitId;
use hashbrown::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{operation} {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("store root {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// Persistent lookup of images by unit identity.
pub trait ArtifactStore: Send + Sync {
    fn lookup(&self, unit: &UnitId) -> Result<Option<Vec<u8>>, StoreError>;

    fn persist(&self, unit: &UnitId, bytes: &[u8]) -> Result<(), StoreError>;
}

const TEMP_PREFIX: &str = ".modgen-";

/// One `<qualified.name>.o` file per unit under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(StoreError::NotADirectory(root));
        }
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            operation: "create",
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, unit: &UnitId) -> PathBuf {
        self.root.join(format!("{}.o", unit.name()))
    }

    /// Write into a fresh temporary file beside `target`, then rename it into
    /// place. Every writer gets its own temporary file; one that fails before
    /// the rename is removed when it drops.
    fn write_atomically(&self, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let io_err = |operation: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| StoreError::Io {
                operation,
                path,
                source,
            }
        };

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.root)
            .map_err(io_err("create", &self.root))?;
        temp.write_all(bytes).map_err(io_err("write", temp.path()))?;
        temp.as_file().sync_all().map_err(io_err("sync", temp.path()))?;

        temp.persist(target)
            .map_err(|err| io_err("rename", target)(err.error))?;
        Ok(())
    }
}

impl ArtifactStore for DirectoryStore {
    fn lookup(&self, unit: &UnitId) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(unit);
        match fs::read(&path) {
            Ok(bytes) => {
                log::trace!("store hit for {} at {}", unit, path.display());
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                operation: "read",
                path,
                source,
            }),
        }
    }

    fn persist(&self, unit: &UnitId, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(unit);
        self.write_atomically(&path, bytes)?;
        log::debug!("persisted {} ({} bytes) to {}", unit, bytes.len(), path.display());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    images: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store raw bytes under a name, bypassing any validation.
    pub fn insert_raw(&self, name: &str, bytes: Vec<u8>) {
        self.images
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), bytes);
    }
}

impl ArtifactStore for MemoryStore {
    fn lookup(&self, unit: &UnitId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit.name())
            .cloned())
    }

    fn persist(&self, unit: &UnitId, bytes: &[u8]) -> Result<(), StoreError> {
        self.insert_raw(unit.name(), bytes.to_vec());
        Ok(())
    }
}

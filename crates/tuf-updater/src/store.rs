//! Local persistence for verified metadata.
//!
//! Bytes are saved exactly as they were verified and re-verified on load;
//! the cache only provides rollback floors and saves bandwidth, it is never
//! trusted on its own. Two backends are provided: one file per role in a
//! directory ([`FsMetadataStore`]) and an embedded sled database
//! ([`SledMetadataStore`]).

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use sled::{Config as SledConfig, Db, Tree};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Tree holding metadata keyed by role name.
const METADATA_TREE: &str = "metadata";

/// Errors emitted by the local stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to persist file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Role-keyed byte storage.
pub trait LocalStore: Send + Sync {
    /// Returns the bytes last saved for `role`.
    fn load(&self, role: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically replaces the bytes saved for `role`.
    fn save(&self, role: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Forgets `role`; removing a missing role is not an error.
    fn remove(&self, role: &str) -> Result<(), StoreError>;
}

/// One `<role>.json` file per role in a directory.
#[derive(Debug, Clone)]
pub struct FsMetadataStore {
    dir: PathBuf,
}

impl FsMetadataStore {
    /// Opens `dir`, creating it when needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, role: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(role)))
    }
}

impl LocalStore for FsMetadataStore {
    fn load(&self, role: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.file_path(role)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, role: &str, bytes: &[u8]) -> Result<(), StoreError> {
        // Write next to the destination so the rename stays on one filesystem.
        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(self.file_path(role))?;
        Ok(())
    }

    fn remove(&self, role: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.file_path(role)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Metadata cache inside an embedded sled database.
#[derive(Debug, Clone)]
pub struct SledMetadataStore {
    db: Db,
    tree: Tree,
    path: PathBuf,
}

impl SledMetadataStore {
    /// Opens (or creates) a store at `path`.
    ///
    /// A database that cannot be opened because of an IO error (stale lock,
    /// damaged files) is wiped and recreated; the cache holds nothing that
    /// cannot be fetched again.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }

        let db = match sled_config(&path).open() {
            Ok(db) => db,
            Err(sled::Error::Io(err)) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "tuf: resetting unreadable metadata cache"
                );
                reset_path(&path)?;
                sled_config(&path).open()?
            }
            Err(other) => return Err(StoreError::Db(other)),
        };
        let tree = db.open_tree(METADATA_TREE)?;
        Ok(Self { db, tree, path })
    }

    /// Opens an in-memory store (ephemeral across restarts).
    pub fn open_ephemeral() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        let tree = db.open_tree(METADATA_TREE)?;
        Ok(Self {
            db,
            tree,
            path: PathBuf::new(),
        })
    }

    /// Returns the filesystem path backing the store.
    ///
    /// Ephemeral stores return an empty path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Roles currently cached.
    pub fn roles(&self) -> Result<Vec<String>, StoreError> {
        self.tree
            .iter()
            .keys()
            .map(|key| {
                key.map(|key| String::from_utf8_lossy(&key).into_owned())
                    .map_err(StoreError::from)
            })
            .collect()
    }

    /// Drops every cached role.
    pub fn reset_data(&self) -> Result<(), StoreError> {
        self.tree.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

impl LocalStore for SledMetadataStore {
    fn load(&self, role: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(role.as_bytes())?.map(|value| value.to_vec()))
    }

    fn save(&self, role: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.tree.insert(role.as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, role: &str) -> Result<(), StoreError> {
        self.tree.remove(role.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}

/// Builds a sled configuration using the provided filesystem path.
fn sled_config(path: &Path) -> SledConfig {
    SledConfig::new().path(path).cache_capacity(8 * 1024 * 1024)
}

/// Deletes the database file or directory to start from a clean slate.
fn reset_path(path: &Path) -> Result<(), StoreError> {
    if path.exists() {
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

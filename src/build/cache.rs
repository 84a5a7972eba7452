//! Persistence layer for built artifacts.
//!
//! Keys are derived from the store fingerprint and every parameter that
//! changes the artifact, so an entry is only ever reused for identical input.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::vector::{INDEX_FORMAT_VERSION, IndexParams, Projector};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}\nSuggestion: Check permissions on the cache directory")]
    Io(#[from] io::Error),

    #[error("Invalid cache key '{0}'\nSuggestion: Keys may only contain ASCII letters, digits, '-' and '.'")]
    InvalidKey(String),
}

/// File-name-safe cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for an index built from `fingerprint` with `params`.
    pub fn for_index(fingerprint: &str, params: &IndexParams) -> Self {
        let seed = params.seed.map_or_else(|| "random".to_string(), |s| s.to_string());
        let digest = hex_digest(&format!(
            "index:v{INDEX_FORMAT_VERSION}:{fingerprint}:{}:{}:{seed}",
            params.ef_construction, params.m
        ));
        Self(format!("index-{digest}.vsix"))
    }

    /// Key for a projection of `fingerprint` computed by `projector`.
    pub fn for_projection(fingerprint: &str, projector: &Projector) -> Self {
        let digest = hex_digest(&format!(
            "projection:{fingerprint}:{}:{:?}",
            projector.iterations(),
            projector.seed()
        ));
        Self(format!("projection-{digest}.json"))
    }

    /// Validates a caller-chosen key.
    pub fn custom(name: impl Into<String>) -> Result<Self, CacheError> {
        let name = name.into();
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if valid {
            Ok(Self(name))
        } else {
            Err(CacheError::InvalidKey(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex_digest(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Byte store for serialized artifacts.
pub trait ArtifactCache: Send + Sync {
    /// Returns `Ok(None)` on a miss.
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError>;
}

/// One file per key under a directory. Writes are atomic.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }
}

impl ArtifactCache for FileCache {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Process-local cache, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Overwrites an entry, bypassing the usual write path.
    pub fn insert_raw(&self, key: CacheKey, bytes: Vec<u8>) {
        self.entries.write().insert(key, bytes);
    }
}

impl ArtifactCache for MemoryCache {
    fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), CacheError> {
        self.entries.write().insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}

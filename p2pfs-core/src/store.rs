//! Content-addressed chunk storage. A chunk is stored under the hex SHA-256 of its bytes
//! and never mutated afterwards; `evict` is the only way one disappears.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::integrity;

/// Storage error (filesystem, missing key, rejected key, metadata encoding).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid chunk hash {0:?}")]
    InvalidHash(String),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("metadata encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Backend for chunk bytes keyed by hash. Implementations must tolerate concurrent callers.
///
/// `put` does not verify that `hash` matches `data`; callers that receive bytes from
/// elsewhere verify first (see `FileStore::store_chunk`).
pub trait ChunkStore: Send + Sync {
    /// Store `data` under `hash`. Storing an existing hash again is a no-op.
    fn put(&self, hash: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Raw bytes for `hash`, or `NotFound`.
    fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError>;

    fn contains(&self, hash: &str) -> bool;

    /// Drop a chunk. Returns whether it was present. Nothing calls this on its own;
    /// it is the hook for a retention policy.
    fn evict(&self, hash: &str) -> Result<bool, StoreError>;
}

fn check_hash(hash: &str) -> Result<(), StoreError> {
    if integrity::is_valid_hash(hash) {
        Ok(())
    } else {
        Err(StoreError::InvalidHash(hash.to_owned()))
    }
}

/// Write `data` to a sibling temp file, sync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);
    let result = (|| {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// One file per chunk in a directory, named by its hex hash, raw bytes as content.
#[derive(Debug)]
pub struct DiskChunkStore {
    dir: PathBuf,
    /// Guards the directory namespace: writers (put/evict) exclusive, readers shared.
    lock: RwLock<()>,
}

impl DiskChunkStore {
    /// Open (creating if needed) a chunk directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("create chunk dir {}", dir.display()), e))?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    fn path_for(&self, hash: &str) -> Result<PathBuf, StoreError> {
        check_hash(hash)?;
        Ok(self.dir.join(hash))
    }
}

impl ChunkStore for DiskChunkStore {
    fn put(&self, hash: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(hash)?;
        let _guard = self.lock.write();
        if path.is_file() {
            return Ok(());
        }
        write_atomic(&path, data).map_err(|e| StoreError::io(format!("write chunk {hash}"), e))
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(hash)?;
        let _guard = self.lock.read();
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_owned()))
            }
            Err(e) => Err(StoreError::io(format!("read chunk {hash}"), e)),
        }
    }

    fn contains(&self, hash: &str) -> bool {
        let Ok(path) = self.path_for(hash) else {
            return false;
        };
        let _guard = self.lock.read();
        path.is_file()
    }

    fn evict(&self, hash: &str) -> Result<bool, StoreError> {
        let path = self.path_for(hash)?;
        let _guard = self.lock.write();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(format!("evict chunk {hash}"), e)),
        }
    }
}

/// In-process chunk map. Same contract as the disk store, nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, hash: &str, data: &[u8]) -> Result<(), StoreError> {
        check_hash(hash)?;
        self.chunks
            .write()
            .entry(hash.to_owned())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        self.chunks
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(hash.to_owned()))
    }

    fn contains(&self, hash: &str) -> bool {
        self.chunks.read().contains_key(hash)
    }

    fn evict(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.chunks.write().remove(hash).is_some())
    }
}

//! Chunk engine: split a file into content-addressed chunks, reassemble it from metadata.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::integrity;
use crate::metadata::{FileMetadata, MetadataError, MetadataStore};
use crate::store::{ChunkStore, DiskChunkStore, StoreError};

/// Chunk size in bytes (1 MiB). The last chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 1024 * 1024;

const CHUNK_DIR: &str = "chunks";
const METADATA_DIR: &str = "metadata";

/// Split or reassembly failure.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("chunk size mismatch for {hash}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        hash: String,
        expected: u64,
        actual: u64,
    },
    #[error("chunk hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),
}

impl ChunkError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        ChunkError::Io {
            context: context.into(),
            source,
        }
    }

    /// Size or hash mismatch: the bytes on hand are not the bytes the metadata promised.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ChunkError::SizeMismatch { .. } | ChunkError::HashMismatch { .. }
        )
    }
}

/// Chunks plus metadata sidecars for one node. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct FileStore {
    chunks: Arc<dyn ChunkStore>,
    metadata: Arc<MetadataStore>,
    chunk_size: usize,
}

impl FileStore {
    /// Open a store rooted at `root`: chunks under `root/chunks`, metadata under `root/metadata`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let chunks = DiskChunkStore::open(root.join(CHUNK_DIR))?;
        let metadata = MetadataStore::open(root.join(METADATA_DIR))?;
        Ok(Self::with_backend(Arc::new(chunks), metadata))
    }

    /// Use any chunk backend (e.g. `MemoryChunkStore`) with a metadata directory.
    pub fn with_backend(chunks: Arc<dyn ChunkStore>, metadata: MetadataStore) -> Self {
        Self {
            chunks,
            metadata: Arc::new(metadata),
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Override the split window. 0 means the default `CHUNK_SIZE`.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = if chunk_size == 0 {
            CHUNK_SIZE
        } else {
            chunk_size
        };
        self
    }

    /// Split `path` into chunks, store each under its hash, then persist the metadata.
    /// Metadata is written only after every chunk is stored.
    pub fn split(&self, path: impl AsRef<Path>) -> Result<FileMetadata, ChunkError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::InvalidName(path.display().to_string()))?;
        let mut file =
            File::open(path).map_err(|e| ChunkError::io(format!("open {}", path.display()), e))?;

        let mut metadata = FileMetadata::new(file_name);
        let mut window = vec![0u8; self.chunk_size];
        loop {
            let n = read_window(&mut file, &mut window)
                .map_err(|e| ChunkError::io(format!("read {}", path.display()), e))?;
            if n == 0 {
                break;
            }
            let chunk = &window[..n];
            let hash = integrity::hash_chunk(chunk);
            self.chunks.put(&hash, chunk)?;
            tracing::trace!(hash = %hash, size = n, "stored chunk");
            metadata.push_chunk(hash, n as u64);
            if n < window.len() {
                break;
            }
        }

        self.metadata.save(&metadata)?;
        tracing::debug!(
            file = %metadata.file_name,
            size = metadata.total_size,
            chunks = metadata.chunk_count(),
            "split file"
        );
        Ok(metadata)
    }

    /// Rebuild a file from `metadata` into `output`, verifying each chunk's size and hash
    /// before writing it. Data goes to `<output>.part` first and is renamed only on success,
    /// so a failed reassembly never leaves a truncated file at `output`.
    pub fn reassemble(
        &self,
        metadata: &FileMetadata,
        output: impl AsRef<Path>,
    ) -> Result<(), ChunkError> {
        metadata.validate()?;
        let output = output.as_ref();
        let partial = partial_path(output);

        let written = self.write_chunks(metadata, &partial);
        let result = written.and_then(|()| {
            fs::rename(&partial, output)
                .map_err(|e| ChunkError::io(format!("rename to {}", output.display()), e))
        });
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }

    fn write_chunks(&self, metadata: &FileMetadata, partial: &Path) -> Result<(), ChunkError> {
        let file = File::create(partial)
            .map_err(|e| ChunkError::io(format!("create {}", partial.display()), e))?;
        let mut out = BufWriter::new(file);
        for (hash, expected) in metadata.chunks() {
            let data = self.chunks.get(hash)?;
            verify(hash, expected, &data)?;
            out.write_all(&data)
                .map_err(|e| ChunkError::io(format!("write {}", partial.display()), e))?;
        }
        let file = out
            .into_inner()
            .map_err(|e| ChunkError::io(format!("flush {}", partial.display()), e.into_error()))?;
        file.sync_all()
            .map_err(|e| ChunkError::io(format!("sync {}", partial.display()), e))
    }

    /// Load persisted metadata by file name.
    pub fn read_metadata(&self, file_name: &str) -> Result<FileMetadata, StoreError> {
        self.metadata.load(file_name)
    }

    pub fn store_metadata(&self, metadata: &FileMetadata) -> Result<(), StoreError> {
        self.metadata.save(metadata)
    }

    /// Raw bytes of a stored chunk, or `NotFound`.
    pub fn read_chunk(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        self.chunks.get(hash)
    }

    /// Store bytes obtained elsewhere under `hash`, after checking they actually hash to it.
    pub fn store_chunk(&self, hash: &str, data: &[u8]) -> Result<(), ChunkError> {
        let actual = integrity::hash_chunk(data);
        if actual != hash {
            return Err(ChunkError::HashMismatch {
                expected: hash.to_owned(),
                actual,
            });
        }
        self.chunks.put(hash, data)?;
        Ok(())
    }

    pub fn has_chunk(&self, hash: &str) -> bool {
        self.chunks.contains(hash)
    }
}

/// Verify one chunk against its metadata entry: size first, then digest.
pub fn verify(hash: &str, expected_size: u64, data: &[u8]) -> Result<(), ChunkError> {
    let actual_size = data.len() as u64;
    if actual_size != expected_size {
        return Err(ChunkError::SizeMismatch {
            hash: hash.to_owned(),
            expected: expected_size,
            actual: actual_size,
        });
    }
    let actual = integrity::hash_chunk(data);
    if actual != hash {
        return Err(ChunkError::HashMismatch {
            expected: hash.to_owned(),
            actual,
        });
    }
    Ok(())
}

/// Fill `buf` from `reader` until it is full or the reader hits EOF. Returns bytes read.
fn read_window(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn partial_path(output: &Path) -> PathBuf {
    let mut p = output.as_os_str().to_owned();
    p.push(".part");
    PathBuf::from(p)
}

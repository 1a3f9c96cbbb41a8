//! File metadata: how a file maps onto an ordered list of chunk hashes and sizes,
//! and the sidecar directory that persists it as `<fileName>.json`.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::integrity;
use crate::store::{write_atomic, StoreError};

/// Ordered chunk map of one file. Field names match the persisted and wire JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_hashes: Vec<String>,
    pub chunk_sizes: Vec<u64>,
}

impl FileMetadata {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            total_size: 0,
            chunk_hashes: Vec::new(),
            chunk_sizes: Vec::new(),
        }
    }

    /// Append the next chunk in file order.
    pub fn push_chunk(&mut self, hash: String, size: u64) {
        self.chunk_hashes.push(hash);
        self.chunk_sizes.push(size);
        self.total_size += size;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    /// `(hash, size)` pairs in file order.
    pub fn chunks(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.chunk_hashes
            .iter()
            .map(String::as_str)
            .zip(self.chunk_sizes.iter().copied())
    }

    /// Check the structural invariants. Metadata from a peer is untrusted until this passes.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if !is_valid_file_name(&self.file_name) {
            return Err(MetadataError::InvalidName(self.file_name.clone()));
        }
        if self.chunk_hashes.len() != self.chunk_sizes.len() {
            return Err(MetadataError::LengthMismatch {
                hashes: self.chunk_hashes.len(),
                sizes: self.chunk_sizes.len(),
            });
        }
        if let Some(bad) = self.chunk_hashes.iter().find(|h| !integrity::is_valid_hash(h)) {
            return Err(MetadataError::InvalidHash(bad.clone()));
        }
        let actual = self
            .chunk_sizes
            .iter()
            .try_fold(0u64, |acc, &s| acc.checked_add(s))
            .ok_or(MetadataError::SizeOverflow)?;
        if actual != self.total_size {
            return Err(MetadataError::TotalMismatch {
                declared: self.total_size,
                actual,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("{hashes} chunk hashes but {sizes} chunk sizes")]
    LengthMismatch { hashes: usize, sizes: usize },
    #[error("invalid chunk hash {0:?}")]
    InvalidHash(String),
    #[error("chunk sizes overflow")]
    SizeOverflow,
    #[error("total size {declared} does not match sum of chunk sizes {actual}")]
    TotalMismatch { declared: u64, actual: u64 },
}

/// A file name is a single, plain path component.
pub fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(&['/', '\\', '\0'][..])
}

/// Sidecar directory: one `<fileName>.json` document per split file.
#[derive(Debug)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    /// Open (creating if needed) a metadata directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("create metadata dir {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    fn path_for(&self, file_name: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_file_name(file_name) {
            return Err(StoreError::InvalidName(file_name.to_owned()));
        }
        Ok(self.dir.join(format!("{file_name}.json")))
    }

    /// Persist metadata in one atomic write. An existing entry for the same name is replaced.
    pub fn save(&self, metadata: &FileMetadata) -> Result<(), StoreError> {
        let path = self.path_for(&metadata.file_name)?;
        let data = serde_json::to_vec(metadata)?;
        write_atomic(&path, &data)
            .map_err(|e| StoreError::io(format!("write metadata {}", path.display()), e))
    }

    /// Load metadata for `file_name`; `NotFound` if it was never saved.
    pub fn load(&self, file_name: &str) -> Result<FileMetadata, StoreError> {
        let path = self.path_for(file_name)?;
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(file_name.to_owned()))
            }
            Err(e) => {
                return Err(StoreError::io(
                    format!("read metadata {}", path.display()),
                    e,
                ))
            }
        };
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.path_for(file_name).map(|p| p.is_file()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileMetadata {
        let mut m = FileMetadata::new("report.pdf");
        m.push_chunk(integrity::hash_chunk(b"one"), 3);
        m.push_chunk(integrity::hash_chunk(b"four"), 4);
        m
    }

    #[test]
    fn push_chunk_tracks_total() {
        let m = sample();
        assert_eq!(m.total_size, 7);
        assert_eq!(m.chunk_count(), 2);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn persisted_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        for key in ["fileName", "totalSize", "chunkHashes", "chunkSizes"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn validate_catches_broken_invariants() {
        let mut m = sample();
        m.chunk_sizes.pop();
        assert!(matches!(
            m.validate(),
            Err(MetadataError::LengthMismatch { .. })
        ));

        let mut m = sample();
        m.total_size = 100;
        assert!(matches!(
            m.validate(),
            Err(MetadataError::TotalMismatch { .. })
        ));

        let mut m = sample();
        m.chunk_hashes[0] = "../secret".into();
        assert!(matches!(m.validate(), Err(MetadataError::InvalidHash(_))));

        let mut m = sample();
        m.file_name = "../escape".into();
        assert!(matches!(m.validate(), Err(MetadataError::InvalidName(_))));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata")).unwrap();
        let m = sample();
        store.save(&m).unwrap();
        assert!(store.contains("report.pdf"));
        assert!(dir.path().join("metadata/report.pdf.json").is_file());
        assert_eq!(store.load("report.pdf").unwrap(), m);
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load("nope.bin"),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.load("../nope"),
            Err(StoreError::InvalidName(_))
        ));
    }
}

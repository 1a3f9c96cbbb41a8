//! HTTP client for a bootstrap server that keeps chunks on behalf of joining peers.
//! `POST /store` with `{chunk_id, data}` (data base64), `GET /retrieve?chunk_id=..` for raw bytes.

use std::time::Duration;

use p2pfs_core::{ChunkError, FileStore, StoreError};
use reqwest::StatusCode;
use serde::Serialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bootstrap {url} answered {status}")]
    Status { status: StatusCode, url: String },
    #[error("chunk {0} not held by bootstrap")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Serialize)]
struct StoreRequest<'a> {
    chunk_id: &'a str,
    #[serde(with = "p2pfs_core::protocol::base64_bytes")]
    data: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct BootstrapClient {
    base: String,
    http: reqwest::Client,
}

impl BootstrapClient {
    /// `base` is the server root, e.g. `http://10.0.0.1:8080`.
    pub fn new(base: impl Into<String>) -> Result<Self, BootstrapError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let base = base.into().trim_end_matches('/').to_owned();
        Ok(Self { base, http })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub async fn store_chunk(&self, chunk_id: &str, data: &[u8]) -> Result<(), BootstrapError> {
        let url = format!("{}/store", self.base);
        let resp = self
            .http
            .post(&url)
            .json(&StoreRequest { chunk_id, data })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BootstrapError::Status {
                status: resp.status(),
                url,
            });
        }
        tracing::debug!(chunk = %chunk_id, bytes = data.len(), "stored chunk on bootstrap");
        Ok(())
    }

    pub async fn retrieve_chunk(&self, chunk_id: &str) -> Result<Vec<u8>, BootstrapError> {
        let url = format!("{}/retrieve", self.base);
        let resp = self
            .http
            .get(&url)
            .query(&[("chunk_id", chunk_id)])
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(BootstrapError::NotFound(chunk_id.to_owned())),
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            status => Err(BootstrapError::Status { status, url }),
        }
    }

    /// Upload every chunk of a locally split file. Returns the number of chunks sent.
    pub async fn push_file(
        &self,
        store: &FileStore,
        file_name: &str,
    ) -> Result<usize, BootstrapError> {
        let reader = store.clone();
        let name = file_name.to_owned();
        let metadata = tokio::task::spawn_blocking(move || reader.read_metadata(&name)).await??;
        for hash in &metadata.chunk_hashes {
            let reader = store.clone();
            let h = hash.clone();
            let data = tokio::task::spawn_blocking(move || reader.read_chunk(&h)).await??;
            self.store_chunk(hash, &data).await?;
        }
        tracing::info!(
            file = %file_name,
            chunks = metadata.chunk_count(),
            base = %self.base,
            "pushed file to bootstrap"
        );
        Ok(metadata.chunk_count())
    }

    /// Download one chunk and store it locally once its bytes hash to `chunk_id`.
    pub async fn pull_chunk(
        &self,
        store: &FileStore,
        chunk_id: &str,
    ) -> Result<(), BootstrapError> {
        let data = self.retrieve_chunk(chunk_id).await?;
        let writer = store.clone();
        let hash = chunk_id.to_owned();
        tokio::task::spawn_blocking(move || writer.store_chunk(&hash, &data)).await??;
        Ok(())
    }
}

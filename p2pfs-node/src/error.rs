//! Node-level errors: talking to peers and running the listener.

use std::io;

use p2pfs_core::{ChunkError, StoreError};

/// Failure of an outbound request or of one inbound exchange. Never retried here.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("network error with {peer}: {source}")]
    Network {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out {op} {peer}")]
    Timeout { peer: String, op: &'static str },
    #[error("connection closed by {0}")]
    Closed(String),
    #[error("protocol error from {peer}: {reason}")]
    Protocol { peer: String, reason: String },
    #[error("{resource} not found on {peer}")]
    NotFound { peer: String, resource: String },
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl TransferError {
    pub(crate) fn protocol(peer: &str, reason: impl Into<String>) -> Self {
        TransferError::Protocol {
            peer: peer.to_owned(),
            reason: reason.into(),
        }
    }

    /// Received bytes did not match the size or hash they were requested under.
    pub fn is_integrity(&self) -> bool {
        matches!(self, TransferError::Chunk(e) if e.is_integrity())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout { .. })
    }
}

/// Listener lifecycle error.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("node already started")]
    AlreadyStarted,
}

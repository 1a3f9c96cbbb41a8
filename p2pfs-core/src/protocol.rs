//! p2pfs wire protocol: message types and payload shapes.

use serde::{Deserialize, Serialize};

use crate::metadata::FileMetadata;

/// Every `type` tag the decoder accepts. Anything else is skipped, not fatal.
pub const MESSAGE_TYPES: &[&str] = &[
    "ping",
    "pong",
    "file_request",
    "file_response",
    "chunk_request",
    "chunk_response",
    "not_found",
];

/// All wire messages. Encoded as `{"type": <tag>, "data": <payload>}`; see the wire module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// Liveness check.
    Ping,
    /// Answer to `Ping`.
    Pong,
    /// Ask a peer for the metadata of a file it has split.
    FileRequest(String),
    /// Metadata answering a `FileRequest`. Older peers also answer chunk requests with it.
    FileResponse(FilePayload),
    /// Ask a peer for one chunk by hash.
    ChunkRequest(ChunkRequest),
    /// Chunk bytes answering a `ChunkRequest`.
    ChunkResponse(ChunkResponse),
    /// The requested file or chunk is not held by the responder.
    NotFound(NotFound),
}

impl Message {
    /// The wire tag of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::FileRequest(_) => "file_request",
            Message::FileResponse(_) => "file_response",
            Message::ChunkRequest(_) => "chunk_request",
            Message::ChunkResponse(_) => "chunk_response",
            Message::NotFound(_) => "not_found",
        }
    }
}

/// Payload of a `file_response`, told apart by shape: metadata has `fileName`,
/// a chunk has `hash` and `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilePayload {
    Metadata(FileMetadata),
    Chunk(ChunkResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub hash: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotFound {
    /// File name or chunk hash that was asked for.
    pub resource: String,
}

/// Byte payloads travel as standard base64 strings inside JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

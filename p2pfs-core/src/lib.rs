//! p2pfs core: content-addressed chunk storage, file metadata, and the peer wire protocol.
//! Sockets live in the node crate; everything here is transport-agnostic.

pub mod chunk;
pub mod core;
pub mod directory;
pub mod integrity;
pub mod metadata;
pub mod protocol;
pub mod store;
pub mod wire;

pub use chunk::{ChunkError, FileStore, CHUNK_SIZE};
pub use self::core::Responder;
pub use directory::{DirectoryError, Peer, PeerDirectory};
pub use metadata::{FileMetadata, MetadataError, MetadataStore};
pub use protocol::{ChunkRequest, ChunkResponse, FilePayload, Message, NotFound};
pub use store::{ChunkStore, DiskChunkStore, MemoryChunkStore, StoreError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, FrameScanner};

//! Host-driven dispatch: the host decodes a message off a socket, hands it here,
//! and writes back whatever reply comes out. No I/O beyond the local store.

use crate::chunk::FileStore;
use crate::protocol::{ChunkRequest, ChunkResponse, FilePayload, Message, NotFound};
use crate::store::StoreError;

/// Answers inbound requests from the local `FileStore`.
#[derive(Clone)]
pub struct Responder {
    store: FileStore,
}

impl Responder {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }

    /// Process one inbound message. Returns the reply to send, if any.
    /// Responses arriving unsolicited on a serving connection are dropped.
    pub fn on_message(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::Ping => Some(Message::Pong),
            Message::FileRequest(file_name) => Some(self.on_file_request(&file_name)),
            Message::ChunkRequest(req) => Some(self.on_chunk_request(req)),
            other @ (Message::Pong
            | Message::FileResponse(_)
            | Message::ChunkResponse(_)
            | Message::NotFound(_)) => {
                tracing::debug!(kind = other.type_name(), "ignoring unsolicited message");
                None
            }
        }
    }

    fn on_file_request(&self, file_name: &str) -> Message {
        match self.store.read_metadata(file_name) {
            Ok(metadata) => Message::FileResponse(FilePayload::Metadata(metadata)),
            Err(e) => not_found(file_name, e),
        }
    }

    fn on_chunk_request(&self, req: ChunkRequest) -> Message {
        match self.store.read_chunk(&req.hash) {
            Ok(data) => Message::ChunkResponse(ChunkResponse {
                hash: req.hash,
                data,
            }),
            Err(e) => not_found(&req.hash, e),
        }
    }
}

fn not_found(resource: &str, err: StoreError) -> Message {
    if err.is_not_found() {
        tracing::debug!(resource, "requested resource not held");
    } else {
        tracing::warn!(resource, error = %err, "failed to serve request");
    }
    Message::NotFound(NotFound {
        resource: resource.to_owned(),
    })
}

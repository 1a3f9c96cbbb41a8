//! Peer node: TCP listener serving chunks and metadata, plus outbound fetches from other peers.
//!
//! Inbound: one accept-loop task, one handler task per accepted connection. Handlers are
//! tracked in a `JoinSet` owned by the accept loop, and all of them observe a shared
//! cancellation token, so `stop()` returns only after every handler has exited.
//!
//! Outbound: each request dials a fresh connection, sends one message, reads one reply
//! and closes. A file fetch is metadata first, then each chunk in order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use p2pfs_core::chunk;
use p2pfs_core::{
    ChunkRequest, FileMetadata, FilePayload, FileStore, Message, PeerDirectory, Responder,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, TransferError};
use crate::registry::{Connection, ConnectionRegistry};
use crate::transport::{FramedStream, DEFAULT_DIAL_TIMEOUT, DEFAULT_IO_TIMEOUT};

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Listening,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Address to bind; port 0 picks any free port.
    pub listen_addr: String,
    pub io_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_owned(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// State shared by every inbound handler.
#[derive(Clone)]
struct HandlerContext {
    responder: Responder,
    registry: Arc<ConnectionRegistry>,
    io_timeout: Duration,
}

pub struct PeerNode {
    id: String,
    options: NodeOptions,
    store: FileStore,
    responder: Responder,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<PeerDirectory>,
    state: NodeState,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl PeerNode {
    pub fn new(options: NodeOptions, store: FileStore) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            options,
            responder: Responder::new(store.clone()),
            store,
            registry: Arc::new(ConnectionRegistry::new()),
            directory: Arc::new(PeerDirectory::new()),
            state: NodeState::Created,
            local_addr: None,
            shutdown: CancellationToken::new(),
            accept_task: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// The address actually bound, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Bind the listen address and start accepting. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, NodeError> {
        if self.state != NodeState::Created {
            return Err(NodeError::AlreadyStarted);
        }
        let bind_err = |source| NodeError::Bind {
            addr: self.options.listen_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.options.listen_addr)
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let ctx = HandlerContext {
            responder: self.responder.clone(),
            registry: self.registry.clone(),
            io_timeout: self.options.io_timeout,
        };
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            ctx,
            self.shutdown.clone(),
        )));
        self.local_addr = Some(local_addr);
        self.state = NodeState::Listening;
        tracing::info!(node = %self.id, addr = %local_addr, "listening");
        Ok(local_addr)
    }

    /// Close the listener and wait for the accept loop and every connection handler to exit.
    /// Calling it again, or on a node that never started, is a no-op.
    pub async fn stop(&mut self) {
        match self.state {
            NodeState::Created => {
                self.state = NodeState::Stopped;
                return;
            }
            NodeState::Stopping | NodeState::Stopped => return,
            NodeState::Listening => {}
        }
        self.state = NodeState::Stopping;
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "accept loop ended abnormally");
            }
        }
        self.state = NodeState::Stopped;
        tracing::info!(node = %self.id, "stopped");
    }

    /// Register the bootstrap peer in this node's directory.
    pub fn join_network(&self, bootstrap_address: &str) {
        self.directory.join_network(bootstrap_address);
    }

    /// Fetch `file_name` from `peer`: metadata, then every chunk in order, each verified
    /// and stored locally. The first failing chunk aborts the fetch. On success the
    /// metadata is saved locally too, so this node can reassemble and serve the file.
    pub async fn request_file(
        &self,
        peer: &str,
        file_name: &str,
    ) -> Result<FileMetadata, TransferError> {
        let metadata = self.request_metadata(peer, file_name).await?;
        tracing::debug!(
            peer,
            file = %file_name,
            chunks = metadata.chunk_count(),
            "fetching file"
        );
        for (hash, size) in metadata.chunks() {
            if self.store.has_chunk(hash) {
                continue;
            }
            self.fetch_chunk(peer, hash, Some(size)).await?;
        }

        let store = self.store.clone();
        let saved = metadata.clone();
        tokio::task::spawn_blocking(move || store.store_metadata(&saved)).await??;
        tracing::info!(peer, file = %file_name, size = metadata.total_size, "fetched file");
        Ok(metadata)
    }

    /// Ask `peer` for the metadata of `file_name`. Nothing is stored.
    pub async fn request_metadata(
        &self,
        peer: &str,
        file_name: &str,
    ) -> Result<FileMetadata, TransferError> {
        match self
            .round_trip(peer, Message::FileRequest(file_name.to_owned()))
            .await?
        {
            Message::FileResponse(FilePayload::Metadata(metadata)) => {
                metadata
                    .validate()
                    .map_err(|e| TransferError::protocol(peer, format!("bad metadata: {e}")))?;
                if metadata.file_name != file_name {
                    return Err(TransferError::protocol(
                        peer,
                        format!(
                            "asked for {file_name:?}, got metadata for {:?}",
                            metadata.file_name
                        ),
                    ));
                }
                Ok(metadata)
            }
            Message::NotFound(nf) => Err(TransferError::NotFound {
                peer: peer.to_owned(),
                resource: nf.resource,
            }),
            Message::FileResponse(FilePayload::Chunk(_)) => Err(TransferError::protocol(
                peer,
                "expected file metadata, got a chunk",
            )),
            other => Err(unexpected(peer, "file_response", &other)),
        }
    }

    /// Fetch one chunk by hash from `peer`, verify it, and store it.
    pub async fn request_chunk(&self, peer: &str, hash: &str) -> Result<(), TransferError> {
        self.fetch_chunk(peer, hash, None).await
    }

    async fn fetch_chunk(
        &self,
        peer: &str,
        hash: &str,
        expected_size: Option<u64>,
    ) -> Result<(), TransferError> {
        let request = Message::ChunkRequest(ChunkRequest {
            hash: hash.to_owned(),
        });
        let response = match self.round_trip(peer, request).await? {
            Message::ChunkResponse(response)
            | Message::FileResponse(FilePayload::Chunk(response)) => response,
            Message::NotFound(nf) => {
                return Err(TransferError::NotFound {
                    peer: peer.to_owned(),
                    resource: nf.resource,
                })
            }
            other => return Err(unexpected(peer, "chunk_response", &other)),
        };
        if response.hash != hash {
            return Err(TransferError::protocol(
                peer,
                format!("received chunk {} for requested {hash}", response.hash),
            ));
        }

        let store = self.store.clone();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || {
            if let Some(expected) = expected_size {
                chunk::verify(&hash, expected, &response.data)?;
            }
            store.store_chunk(&hash, &response.data)
        })
        .await??;
        Ok(())
    }

    /// Liveness check. Returns the round-trip time.
    pub async fn ping(&self, peer: &str) -> Result<Duration, TransferError> {
        let started = Instant::now();
        match self.round_trip(peer, Message::Ping).await? {
            Message::Pong => Ok(started.elapsed()),
            other => Err(unexpected(peer, "pong", &other)),
        }
    }

    /// One request, one reply, on a connection of its own.
    async fn round_trip(&self, peer: &str, request: Message) -> Result<Message, TransferError> {
        let mut stream =
            FramedStream::connect(peer, self.options.dial_timeout, self.options.io_timeout)
                .await?;
        stream.send(&request).await?;
        stream.recv().await
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn unexpected(peer: &str, wanted: &str, got: &Message) -> TransferError {
    TransferError::protocol(peer, format!("expected {wanted}, got {}", got.type_name()))
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after the `failures`-th consecutive accept error: doubling from 10 ms, capped at 1 s.
fn accept_backoff(failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN.saturating_mul(factor).min(ACCEPT_BACKOFF_MAX)
}

async fn accept_loop(listener: TcpListener, ctx: HandlerContext, shutdown: CancellationToken) {
    let mut handlers = JoinSet::new();
    let mut failures = 0u32;
    loop {
        let mut pause = None;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = finished {
                    tracing::warn!(error = %e, "connection handler panicked");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    failures = 0;
                    handlers.spawn(handle_connection(
                        stream,
                        remote,
                        ctx.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    tracing::warn!(error = %e, failures, retry_in = ?delay, "failed to accept connection");
                    pause = Some(delay);
                }
            },
        }

        // Persistent errors such as EMFILE would otherwise spin.
        if let Some(delay) = pause {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    drop(listener);
    while let Some(finished) = handlers.join_next().await {
        if let Err(e) = finished {
            tracing::warn!(error = %e, "connection handler panicked");
        }
    }
}

/// Serve one inbound connection: receive, dispatch, reply, in arrival order,
/// until the peer goes quiet, closes, sends garbage, or the node stops.
async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: HandlerContext,
    cancel: CancellationToken,
) {
    let conn = Connection::new(remote, cancel.clone());
    ctx.registry.add(conn.clone());
    tracing::debug!(peer = %remote, "connection opened");

    let mut framed = FramedStream::new(stream, remote.to_string(), ctx.io_timeout);
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            received = framed.recv() => match received {
                Ok(msg) => msg,
                Err(e @ (TransferError::Timeout { .. } | TransferError::Closed(_))) => {
                    tracing::debug!(peer = %remote, reason = %e, "connection idle or closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(peer = %remote, error = %e, "dropping connection");
                    break;
                }
            },
        };

        let responder = ctx.responder.clone();
        let reply = match tokio::task::spawn_blocking(move || responder.on_message(msg)).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(peer = %remote, error = %e, "request handler failed");
                break;
            }
        };
        if let Some(reply) = reply {
            if let Err(e) = framed.send(&reply).await {
                tracing::warn!(peer = %remote, error = %e, "failed to send reply");
                break;
            }
        }
    }

    ctx.registry.remove(&conn);
    tracing::debug!(peer = %remote, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2pfs_core::wire::{decode_frame, encode_frame};
    use p2pfs_core::{integrity, ChunkResponse, CHUNK_SIZE};
    use rand::RngCore;
    use std::fs;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct TestNode {
        node: PeerNode,
        dir: tempfile::TempDir,
    }

    fn new_node() -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        TestNode {
            node: PeerNode::new(NodeOptions::default(), store),
            dir,
        }
    }

    fn random_file(dir: &std::path::Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        let path = dir.join(name);
        fs::write(&path, &data).unwrap();
        (path, data)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// A peer that answers every request with `reply`, whatever was asked.
    async fn scripted_peer(reply: Message) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let frame = encode_frame(&reply).unwrap();
        let task = tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(&frame).await;
            }
        });
        (addr, task)
    }

    #[tokio::test]
    async fn start_binds_and_accepts() {
        let mut a = new_node();
        let addr = a.node.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(a.node.local_addr(), Some(addr));
        assert_eq!(a.node.state(), NodeState::Listening);
        TcpStream::connect(addr).await.unwrap();
        assert!(matches!(a.node.start().await, Err(NodeError::AlreadyStarted)));
        a.node.stop().await;
        assert_eq!(a.node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn two_nodes_transfer_a_file() {
        let mut a = new_node();
        let b = new_node();
        let addr = a.node.start().await.unwrap().to_string();

        let (src, data) = random_file(a.dir.path(), "transfer.dat", 2 * CHUNK_SIZE);
        let meta = a.node.store().split(&src).unwrap();
        assert_eq!(meta.chunk_count(), 2);

        let fetched = b.node.request_file(&addr, "transfer.dat").await.unwrap();
        assert_eq!(fetched, meta);
        for hash in &meta.chunk_hashes {
            assert!(b.node.store().has_chunk(hash));
        }

        let out = b.dir.path().join("received.dat");
        let local_meta = b.node.store().read_metadata("transfer.dat").unwrap();
        b.node.store().reassemble(&local_meta, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), data);

        a.node.stop().await;
    }

    #[tokio::test]
    async fn missing_file_fails_and_stores_nothing() {
        let mut a = new_node();
        let b = new_node();
        let addr = a.node.start().await.unwrap().to_string();

        let err = b.node.request_file(&addr, "never-split.bin").await.unwrap_err();
        assert!(
            matches!(&err, TransferError::NotFound { resource, .. } if resource == "never-split.bin"),
            "{err}"
        );
        assert!(b.node.store().read_metadata("never-split.bin").is_err());
        let chunk_dir = b.dir.path().join("store/chunks");
        assert_eq!(fs::read_dir(chunk_dir).unwrap().count(), 0);

        a.node.stop().await;
    }

    #[tokio::test]
    async fn request_chunk_fetches_single_chunk() {
        let mut a = new_node();
        let b = new_node();
        let addr = a.node.start().await.unwrap().to_string();
        let (src, data) = random_file(a.dir.path(), "one.bin", 1000);
        let meta = a.node.store().split(&src).unwrap();

        b.node.request_chunk(&addr, &meta.chunk_hashes[0]).await.unwrap();
        assert_eq!(b.node.store().read_chunk(&meta.chunk_hashes[0]).unwrap(), data);

        let absent = integrity::hash_chunk(b"nobody has this");
        let err = b.node.request_chunk(&addr, &absent).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound { .. }), "{err}");

        a.node.stop().await;
    }

    #[tokio::test]
    async fn chunk_answered_as_file_response_is_accepted() {
        let b = new_node();
        let hash = integrity::hash_chunk(b"hi");
        let (addr, peer) = scripted_peer(Message::FileResponse(FilePayload::Chunk(ChunkResponse {
            hash: hash.clone(),
            data: b"hi".to_vec(),
        })))
        .await;

        b.node.request_chunk(&addr, &hash).await.unwrap();
        assert_eq!(b.node.store().read_chunk(&hash).unwrap(), b"hi");
        peer.abort();
    }

    #[tokio::test]
    async fn file_response_chunk_with_wrong_hash_is_rejected() {
        let b = new_node();
        let wanted = integrity::hash_chunk(b"wanted");
        let (addr, peer) = scripted_peer(Message::FileResponse(FilePayload::Chunk(ChunkResponse {
            hash: integrity::hash_chunk(b"hi"),
            data: b"hi".to_vec(),
        })))
        .await;

        let err = b.node.request_chunk(&addr, &wanted).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol { .. }), "{err}");
        assert!(!b.node.store().has_chunk(&integrity::hash_chunk(b"hi")));
        peer.abort();
    }

    #[tokio::test]
    async fn chunk_with_wrong_hash_is_rejected() {
        let b = new_node();
        let wanted = integrity::hash_chunk(b"wanted");
        let other = integrity::hash_chunk(b"other");
        let (addr, peer) = scripted_peer(Message::ChunkResponse(ChunkResponse {
            hash: other.clone(),
            data: b"other".to_vec(),
        }))
        .await;

        let err = b.node.request_chunk(&addr, &wanted).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol { .. }), "{err}");
        assert!(!b.node.store().has_chunk(&wanted));
        assert!(!b.node.store().has_chunk(&other));
        peer.abort();
    }

    #[tokio::test]
    async fn chunk_with_forged_bytes_is_rejected() {
        let b = new_node();
        let wanted = integrity::hash_chunk(b"wanted");
        let (addr, peer) = scripted_peer(Message::ChunkResponse(ChunkResponse {
            hash: wanted.clone(),
            data: b"forged".to_vec(),
        }))
        .await;

        let err = b.node.request_chunk(&addr, &wanted).await.unwrap_err();
        assert!(err.is_integrity(), "{err}");
        assert!(!b.node.store().has_chunk(&wanted));
        peer.abort();
    }

    #[tokio::test]
    async fn inconsistent_metadata_is_rejected_before_fetching() {
        let b = new_node();
        let mut meta = FileMetadata::new("lies.bin");
        meta.push_chunk(integrity::hash_chunk(b"abc"), 3);
        meta.total_size = 999;
        let (addr, peer) = scripted_peer(Message::FileResponse(FilePayload::Metadata(meta))).await;

        let err = b.node.request_file(&addr, "lies.bin").await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol { .. }), "{err}");
        assert!(b.node.store().read_metadata("lies.bin").is_err());
        peer.abort();
    }

    #[tokio::test]
    async fn ping_pong() {
        let mut a = new_node();
        let b = new_node();
        let addr = a.node.start().await.unwrap().to_string();
        b.node.ping(&addr).await.unwrap();
        a.node.stop().await;
    }

    #[tokio::test]
    async fn stop_without_connections_is_prompt_and_port_is_reusable() {
        let mut a = new_node();
        let addr = a.node.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), a.node.stop())
            .await
            .expect("stop did not return promptly");

        let dir = tempfile::tempdir().unwrap();
        let options = NodeOptions {
            listen_addr: addr.to_string(),
            ..NodeOptions::default()
        };
        let mut again = PeerNode::new(options, FileStore::open(dir.path()).unwrap());
        assert_eq!(again.start().await.unwrap(), addr);
        again.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_open_connections() {
        let mut a = new_node();
        let addr = a.node.start().await.unwrap();
        let mut idle = TcpStream::connect(addr).await.unwrap();
        let registry = a.node.registry().clone();
        wait_for(|| registry.len() == 1).await;

        tokio::time::timeout(Duration::from_secs(2), a.node.stop())
            .await
            .expect("stop blocked on an idle connection");
        assert!(registry.is_empty());

        let mut buf = [0u8; 1];
        let n = idle.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "handler closed the socket");
    }

    #[tokio::test]
    async fn connection_survives_unknown_type_but_not_bad_payload() {
        let mut a = new_node();
        let addr = a.node.start().await.unwrap();
        let mut sock = TcpStream::connect(addr).await.unwrap();

        sock.write_all(b"{\"type\":\"gossip\",\"data\":null}\n{\"type\":\"ping\"}\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = sock.read(&mut buf).await.unwrap();
        let (reply, _) = decode_frame(&buf[..n]).unwrap();
        assert_eq!(reply, Message::Pong);

        sock.write_all(b"{\"type\":\"file_request\",\"data\":{\"nope\":1}}\n")
            .await
            .unwrap();
        let n = sock.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "connection dropped after undecodable payload");

        let registry = a.node.registry().clone();
        wait_for(|| registry.is_empty()).await;
        a.node.stop().await;
    }

    #[tokio::test]
    async fn registry_close_drops_one_connection() {
        let mut a = new_node();
        let addr = a.node.start().await.unwrap();
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let key = sock.local_addr().unwrap().to_string();
        let registry = a.node.registry().clone();
        wait_for(|| registry.get(&key).is_some()).await;

        assert!(registry.close(&key));
        let mut buf = [0u8; 1];
        assert_eq!(sock.read(&mut buf).await.unwrap_or(0), 0);
        wait_for(|| registry.get(&key).is_none()).await;
        a.node.stop().await;
    }

    #[test]
    fn accept_errors_back_off() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(5), Duration::from_millis(160));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
        let mut last = Duration::ZERO;
        for n in 1..40 {
            let d = accept_backoff(n);
            assert!(d >= last && d <= Duration::from_secs(1));
            last = d;
        }
    }

    #[tokio::test]
    async fn join_network_records_bootstrap() {
        let a = new_node();
        a.node.join_network("198.51.100.7:7070");
        assert_eq!(
            a.node.directory().get_peer("bootstrap").unwrap(),
            "198.51.100.7:7070"
        );
    }
}

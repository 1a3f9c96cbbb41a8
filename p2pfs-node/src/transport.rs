//! Local transport: a stream of JSON messages over one TCP connection.
//! Every send and every receive is bounded by a deadline.

use std::time::Duration;

use p2pfs_core::wire::{decode_frame, encode_frame, FrameDecodeError, FrameScanner, MAX_FRAME_LEN};
use p2pfs_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TransferError;

/// Deadline for one send or one receive (10 s).
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for establishing an outbound connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 64 * 1024;

/// Message stream over a socket. Bytes past the current message stay buffered for the next `recv`.
pub struct FramedStream<S = TcpStream> {
    stream: S,
    peer: String,
    buf: Vec<u8>,
    scanner: FrameScanner,
    timeout: Duration,
}

impl FramedStream<TcpStream> {
    /// Dial `peer` (host:port), bounded by `dial_timeout`.
    pub async fn connect(
        peer: &str,
        dial_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, TransferError> {
        let stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransferError::Network {
                    peer: peer.to_owned(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransferError::Timeout {
                    peer: peer.to_owned(),
                    op: "dialing",
                })
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream, peer, io_timeout))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    pub fn new(stream: S, peer: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream,
            peer: peer.into(),
            buf: Vec::new(),
            scanner: FrameScanner::new(),
            timeout,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Encode and write one message.
    pub async fn send(&mut self, msg: &Message) -> Result<(), TransferError> {
        let frame =
            encode_frame(msg).map_err(|e| TransferError::protocol(&self.peer, e.to_string()))?;
        let stream = &mut self.stream;
        let written = tokio::time::timeout(self.timeout, async move {
            stream.write_all(&frame).await?;
            stream.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(TransferError::Network {
                peer: self.peer.clone(),
                source,
            }),
            Err(_) => Err(TransferError::Timeout {
                peer: self.peer.clone(),
                op: "sending to",
            }),
        }
    }

    /// Read the next message. Unknown message types are skipped; any other decode
    /// failure is a protocol error and the stream should be dropped.
    pub async fn recv(&mut self) -> Result<Message, TransferError> {
        let received = tokio::time::timeout(self.timeout, self.recv_inner()).await;
        match received {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout {
                peer: self.peer.clone(),
                op: "receiving from",
            }),
        }
    }

    async fn recv_inner(&mut self) -> Result<Message, TransferError> {
        loop {
            if let Some(end) = self.scanner.scan(&self.buf) {
                match decode_frame(&self.buf) {
                    Ok((msg, consumed)) => {
                        self.consume(consumed);
                        return Ok(msg);
                    }
                    Err(FrameDecodeError::UnknownType {
                        type_name,
                        consumed,
                    }) => {
                        tracing::warn!(peer = %self.peer, kind = %type_name, "skipping unknown message type");
                        self.consume(consumed);
                        continue;
                    }
                    Err(FrameDecodeError::NeedMore) => {
                        return Err(TransferError::protocol(
                            &self.peer,
                            format!("malformed frame within first {end} bytes"),
                        ))
                    }
                    Err(e) => return Err(TransferError::protocol(&self.peer, e.to_string())),
                }
            }
            if self.buf.len() > MAX_FRAME_LEN {
                return Err(TransferError::protocol(
                    &self.peer,
                    FrameDecodeError::TooLarge.to_string(),
                ));
            }

            self.buf.reserve(READ_CHUNK);
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|source| TransferError::Network {
                    peer: self.peer.clone(),
                    source,
                })?;
            if n == 0 {
                return Err(TransferError::Closed(self.peer.clone()));
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.scanner.reset();
    }
}

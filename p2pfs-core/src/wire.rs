//! Framing: one JSON document per message, written back to back. No length prefix;
//! the document structure delimits each message.

use serde_json::Value;

use crate::protocol::{Message, MESSAGE_TYPES};

/// Upper bound on a single encoded message, and on how much undecoded input a reader buffers.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: the JSON document followed by a newline.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = serde_json::to_vec(msg)?;
    if out.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    out.push(b'\n');
    Ok(out)
}

/// Error encoding a message into a frame (serde or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if the document is incomplete (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<Value>();
    let value = match stream.next() {
        Some(Ok(value)) => value,
        Some(Err(e)) if !e.is_eof() => return Err(FrameDecodeError::Decode(e)),
        _ if bytes.len() > MAX_FRAME_LEN => return Err(FrameDecodeError::TooLarge),
        _ => return Err(FrameDecodeError::NeedMore),
    };
    let consumed = stream.byte_offset();

    let type_name = match value.get("type").and_then(Value::as_str) {
        Some(t) => t,
        None => return Err(FrameDecodeError::MissingType),
    };
    if !MESSAGE_TYPES.contains(&type_name) {
        return Err(FrameDecodeError::UnknownType {
            type_name: type_name.to_owned(),
            consumed,
        });
    }
    let msg: Message = serde_json::from_value(value).map_err(FrameDecodeError::Decode)?;
    Ok((msg, consumed))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("message has no type tag")]
    MissingType,
    /// Well-formed document with a tag we do not speak. Framing is intact; skip `consumed` bytes.
    #[error("unknown message type {type_name:?}")]
    UnknownType { type_name: String, consumed: usize },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FrameDecodeError {
    /// Whether the stream can no longer be trusted and the connection must be dropped.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FrameDecodeError::NeedMore | FrameDecodeError::UnknownType { .. }
        )
    }
}

/// Finds where the first document in a growing receive buffer ends, looking at each
/// byte once. Call `scan` with the whole buffer after every read and `reset` after
/// draining a decoded document.
#[derive(Debug, Default, Clone)]
pub struct FrameScanner {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(end)` once `buf[..end]` holds a complete top-level object, or as
    /// soon as the input cannot be one (so `decode_frame` can report the error).
    pub fn scan(&mut self, buf: &[u8]) -> Option<usize> {
        while let Some(&b) = buf.get(self.pos) {
            self.pos += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'{' => self.depth += 1,
                b' ' | b'\t' | b'\r' | b'\n' => {}
                _ if self.depth == 0 => return Some(self.pos),
                b'"' => self.in_string = true,
                b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Bytes examined since the last reset.
    pub fn scanned(&self) -> usize {
        self.pos
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChunkRequest, ChunkResponse};

    fn sample_chunk() -> Message {
        Message::ChunkResponse(ChunkResponse {
            hash: crate::integrity::hash_chunk(b"payload"),
            data: b"payload".to_vec(),
        })
    }

    #[test]
    fn roundtrip_chunk_response() {
        let msg = sample_chunk();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert!(n <= frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_chunk()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() / 2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(decode_frame(b""), Err(FrameDecodeError::NeedMore)));
        assert!(matches!(decode_frame(b"\n  "), Err(FrameDecodeError::NeedMore)));
    }

    #[test]
    fn multiple_messages() {
        let a = Message::Ping;
        let b = Message::ChunkRequest(ChunkRequest { hash: "ff".into() });
        let mut buf = encode_frame(&a).unwrap();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(m1, a);
        assert_eq!(m2, b);
        assert!(buf[n1 + n2..].iter().all(u8::is_ascii_whitespace));
    }

    #[test]
    fn unknown_type_reports_its_length() {
        let mut buf = br#"{"type":"gossip","data":[1,2,3]}"#.to_vec();
        let skip = buf.len();
        buf.extend_from_slice(&encode_frame(&Message::Pong).unwrap());
        match decode_frame(&buf) {
            Err(FrameDecodeError::UnknownType {
                type_name,
                consumed,
            }) => {
                assert_eq!(type_name, "gossip");
                assert_eq!(consumed, skip);
                let (next, _) = decode_frame(&buf[consumed..]).unwrap();
                assert_eq!(next, Message::Pong);
            }
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_payload_is_fatal() {
        let err = decode_frame(br#"{"type":"file_response","data":"x"}"#).unwrap_err();
        assert!(matches!(err, FrameDecodeError::Decode(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn garbage_is_fatal() {
        let err = decode_frame(b"}}not json").unwrap_err();
        assert!(err.is_fatal());
        let err = decode_frame(b"[1,2]").unwrap_err();
        assert!(matches!(err, FrameDecodeError::MissingType));
    }

    #[test]
    fn scanner_finds_end_across_pieces() {
        let msg = Message::FileRequest(r#"we{ird} "name" [x]\\"#.to_owned());
        let mut stream = encode_frame(&msg).unwrap();
        let doc_len = stream.len() - 1;
        stream.extend_from_slice(&encode_frame(&Message::Ping).unwrap());

        let mut scanner = FrameScanner::new();
        let mut found = None;
        for fed in 1..=stream.len() {
            if let Some(end) = scanner.scan(&stream[..fed]) {
                found = Some((end, fed));
                break;
            }
        }
        let (end, fed) = found.expect("document end not found");
        assert_eq!(end, doc_len);
        assert_eq!(fed, doc_len);
        assert_eq!(scanner.scanned(), doc_len);
        assert_eq!(decode_frame(&stream[..end]).unwrap(), (msg, doc_len));
    }

    #[test]
    fn scanner_reads_each_byte_once() {
        let frame = encode_frame(&Message::ChunkResponse(ChunkResponse {
            hash: "00".repeat(32),
            data: vec![7u8; 1024 * 1024],
        }))
        .unwrap();
        let mut scanner = FrameScanner::new();
        let mut buf = Vec::new();
        let mut end = None;
        for piece in frame.chunks(1460) {
            assert!(end.is_none());
            buf.extend_from_slice(piece);
            end = scanner.scan(&buf);
        }
        assert_eq!(end, Some(frame.len() - 1));
        assert_eq!(scanner.scanned(), frame.len() - 1);
    }

    #[test]
    fn scanner_flags_non_object_input() {
        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.scan(b"  \n"), None);
        assert_eq!(scanner.scan(b"  \nx"), Some(4));
        scanner.reset();
        assert_eq!(scanner.scan(b"{\"a\":\"}\""), None);
        assert_eq!(scanner.scan(b"{\"a\":\"}\"}"), Some(9));
    }
}

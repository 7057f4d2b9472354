//! Frame codec for the logging protocol.
//!
//! Wire format: `type:[u8; 2] | payload | terminator:[u8; 4]`
//!
//! The payload is base64 text (see [`super::message`]), so the terminator
//! bytes can never occur inside it.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LoggerError, Result};

/// Frame terminator.
pub const TERMINATOR: [u8; 4] = [0x1F, 0x20, 0x20, 0x1F];

/// Width of the ASCII type tag at the start of every frame.
pub const TYPE_TAG_LEN: usize = 2;

/// Smallest possible frame: type tag + terminator, empty payload.
pub const MIN_FRAME_LEN: usize = TYPE_TAG_LEN + TERMINATOR.len();

/// Maximum buffered frame size (4MB) - prevents OOM from a peer that never
/// sends a terminator
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Read buffer growth step
const READ_CHUNK: usize = 8 * 1024;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client identity, first frame of every connection
    Hello,
    /// A log record
    Entity,
    /// Server response to a Hello or an Entity (accept or reject)
    Ack,
}

impl MessageType {
    pub const ALL: [MessageType; 3] = [MessageType::Hello, MessageType::Entity, MessageType::Ack];

    pub const fn tag(self) -> [u8; TYPE_TAG_LEN] {
        match self {
            MessageType::Hello => *b"HI",
            MessageType::Entity => *b"EN",
            MessageType::Ack => *b"AK",
        }
    }

    pub fn from_tag(tag: [u8; TYPE_TAG_LEN]) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }
}

// =============================================================================
// Frame
// =============================================================================

/// A decoded frame. The type tag is kept raw so that unknown tags can be
/// reported and skipped by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_tag: [u8; TYPE_TAG_LEN],
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            type_tag: msg_type.tag(),
            payload: payload.into(),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_tag(self.type_tag)
    }

    /// Type tag for log output.
    pub fn type_tag_lossy(&self) -> String {
        String::from_utf8_lossy(&self.type_tag).into_owned()
    }

    pub fn encode(&self) -> Bytes {
        encode(self.type_tag, &self.payload)
    }
}

/// Encode `type_tag || payload || terminator`.
pub fn encode(type_tag: [u8; TYPE_TAG_LEN], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + payload.len());
    buf.put_slice(&type_tag);
    buf.put_slice(payload);
    buf.put_slice(&TERMINATOR);
    buf.freeze()
}

/// Decode one complete frame (terminator included).
pub fn decode(buf: &[u8]) -> Result<Frame> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(LoggerError::Framing(format!(
            "frame of {} bytes is shorter than the minimum {}",
            buf.len(),
            MIN_FRAME_LEN
        )));
    }

    let body_end = buf.len() - TERMINATOR.len();
    if buf[body_end..] != TERMINATOR {
        return Err(LoggerError::Framing("missing frame terminator".into()));
    }

    let mut type_tag = [0u8; TYPE_TAG_LEN];
    type_tag.copy_from_slice(&buf[..TYPE_TAG_LEN]);

    Ok(Frame {
        type_tag,
        payload: Bytes::copy_from_slice(&buf[TYPE_TAG_LEN..body_end]),
    })
}

fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
        .map(|pos| pos + from)
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Reads terminator-delimited frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    /// Bytes already searched for a terminator
    scanned: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary.
    /// A `Framing` error consumes the malformed frame; the reader can keep
    /// going. Any other error leaves the stream unusable.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            // Back up so a terminator split across two reads is still found
            let from = self.scanned.saturating_sub(TERMINATOR.len() - 1);
            if let Some(pos) = find_terminator(&self.buf, from) {
                let raw = self.buf.split_to(pos + TERMINATOR.len());
                self.scanned = 0;
                return decode(&raw).map(Some);
            }
            self.scanned = self.buf.len();

            if self.buf.len() > MAX_FRAME_SIZE {
                return Err(LoggerError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "no frame terminator within {} bytes (max {})",
                        self.buf.len(),
                        MAX_FRAME_SIZE
                    ),
                )));
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(LoggerError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes pending)", self.buf.len()),
                )));
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(*b"EN", b"abc");
        assert_eq!(&frame[..2], b"EN");
        assert_eq!(&frame[2..5], b"abc");
        assert_eq!(&frame[5..], &TERMINATOR);
    }

    #[test]
    fn test_decode_roundtrip() {
        let frame = Frame::new(MessageType::Hello, Bytes::from_static(b"payload"));
        let decoded = decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.message_type(), Some(MessageType::Hello));
    }

    #[test]
    fn test_decode_empty_payload() {
        let decoded = decode(&encode(*b"AK", b"")).unwrap();
        assert_eq!(decoded.message_type(), Some(MessageType::Ack));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        for len in 0..MIN_FRAME_LEN {
            let buf = vec![0x1F; len];
            match decode(&buf) {
                Err(LoggerError::Framing(_)) => {}
                other => panic!("Expected Framing error for {} bytes, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_decode_missing_terminator() {
        let err = decode(b"ENsome payload!!").unwrap_err();
        assert!(matches!(err, LoggerError::Framing(_)));
    }

    #[test]
    fn test_unknown_type_tag() {
        let decoded = decode(&encode(*b"ZZ", b"x")).unwrap();
        assert_eq!(decoded.message_type(), None);
        assert_eq!(decoded.type_tag_lossy(), "ZZ");
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::from_tag(*b"HI"), Some(MessageType::Hello));
        assert_eq!(MessageType::from_tag(*b"EN"), Some(MessageType::Entity));
        assert_eq!(MessageType::from_tag(*b"AK"), Some(MessageType::Ack));
        assert_eq!(MessageType::from_tag(*b"RJ"), None);
    }

    #[tokio::test]
    async fn test_reader_multiple_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode(*b"HI", b"one"));
        wire.extend_from_slice(&encode(*b"EN", b"two"));
        wire.extend_from_slice(&encode(*b"EN", b"three"));

        let mut reader = FrameReader::new(wire.as_slice());
        let mut payloads = Vec::new();
        while let Some(frame) = reader.read_frame().await.unwrap() {
            payloads.push(frame.payload);
        }
        assert_eq!(payloads, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_reader_split_terminator() {
        let (mut client, server) = tokio::io::duplex(64);
        let frame = encode(*b"EN", b"split");

        let writer = tokio::spawn(async move {
            // Deliver the frame one byte at a time
            for b in frame.iter() {
                client.write_all(&[*b]).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = FrameReader::new(server);
        let decoded = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(decoded.payload, "split");
        writer.await.unwrap();
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_recovers_after_bad_frame() {
        let mut wire = Vec::new();
        // A terminator with only one byte in front of it
        wire.push(b'X');
        wire.extend_from_slice(&TERMINATOR);
        wire.extend_from_slice(&encode(*b"EN", b"good"));

        let mut reader = FrameReader::new(wire.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(LoggerError::Framing(_))
        ));
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.payload, "good");
    }

    #[tokio::test]
    async fn test_reader_eof_inside_frame() {
        let wire = b"ENno terminator".to_vec();
        let mut reader = FrameReader::new(wire.as_slice());
        let err = reader.read_frame().await.unwrap_err();
        assert!(!err.is_frame_local());
    }
}

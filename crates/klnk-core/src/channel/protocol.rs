//! Socket framing and messages.
//!
//! Each frame is a 4-byte big-endian length followed by a UTF-8 JSON message.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The request carries the encoded path unchanged, so the wire string stays
//! the same as on a control mount; the message version guards the envelope.

use crate::config::ChannelConfig;
use crate::error::{KlnkError, Result};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One open call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub version: u32,
    pub seq: u64,
    pub path: String,
}

impl OpenRequest {
    pub fn new(seq: u64, path: impl Into<String>) -> Self {
        Self {
            version: ChannelConfig::PROTOCOL_VERSION,
            seq,
            path: path.into(),
        }
    }
}

/// Answer to one open call. `code` 0 means the open succeeded; anything else
/// is the positive error number the open failed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReply {
    pub version: u32,
    pub seq: u64,
    pub code: i32,
}

impl OpenReply {
    pub fn new(seq: u64, code: i32) -> Self {
        Self {
            version: ChannelConfig::PROTOCOL_VERSION,
            seq,
            code,
        }
    }
}

/// Read a length-prefixed frame. Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

fn check_frame_len(len: usize) -> Result<()> {
    if len > ChannelConfig::MAX_FRAME_SIZE {
        return Err(KlnkError::invalid(
            "frame",
            format!(
                "frame size {} exceeds maximum {}",
                len,
                ChannelConfig::MAX_FRAME_SIZE
            ),
        ));
    }
    Ok(())
}

/// Take one complete frame off the front of `buf`, if it holds one.
///
/// Bytes of an incomplete frame stay in `buf` for the next call, so a reader
/// that fills `buf` with `read_buf` never loses its place in the stream.
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&buf[..4]);
    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).to_vec()))
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_path_verbatim() {
        let req = OpenRequest::new(3, "/vhub/mnt/klnk/3_1_14_1_0_0_1_80_0");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"/vhub/mnt/klnk/3_1_14_1_0_0_1_80_0\""));
        assert_eq!(req.version, ChannelConfig::PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_frame_read_write() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload").await.unwrap();
        assert_eq!(&buf[..4], &7u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_split_frame_keeps_partial_bytes() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").await.unwrap();
        write_frame(&mut wire, b"second").await.unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..3]);
        assert_eq!(split_frame(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[3..12]);
        assert_eq!(split_frame(&mut buf).unwrap(), Some(b"first".to_vec()));
        assert_eq!(split_frame(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[12..]);
        assert_eq!(split_frame(&mut buf).unwrap(), Some(b"second".to_vec()));
        assert!(buf.is_empty());

        buf.extend_from_slice(&((ChannelConfig::MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        assert!(split_frame(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len = (ChannelConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}

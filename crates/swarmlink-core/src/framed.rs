//! One-frame-at-a-time reads and writes over a split TCP stream half.
//!
//! A frame is exactly one encoded [`Value`]; the codec's own length prefix
//! is the framing, so there is no separate length header to manage here —
//! `read_value` determines how many bytes to read as it goes, probing the
//! length prefix before reading the payload.

use crate::codec::{self, CodecError, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors that can occur while reading or writing a single frame.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection closed by peer")]
    ConnectionClosed,
}

const SHORT_STRING_BASE: u8 = 0x80;
const LONG_STRING_BASE: u8 = 0xb7;
const SHORT_LIST_BASE: u8 = 0xc0;
const LONG_LIST_BASE: u8 = 0xf7;

/// Writes a single encoded [`Value`] frame to `writer`.
pub async fn write_value<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &Value,
) -> Result<(), ConnectionError> {
    let frame = codec::encode(value);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a single [`Value`] frame from `reader`.
///
/// Determines the total frame length from the leading tag byte (and, for
/// long-form strings/lists, the following length-of-length bytes) before
/// reading the payload, so at most the header bytes are read speculatively
/// ahead of a bounded payload read. `max_frame_len` is checked against the
/// declared payload length before any payload buffer is allocated.
///
/// Returns [`ConnectionError::ConnectionClosed`] if the peer closes the
/// connection cleanly at a frame boundary (zero bytes available for the
/// leading tag byte). Any other EOF, including one encountered partway
/// through a frame, is [`ConnectionError::Io`].
pub async fn read_value<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_len: usize,
) -> Result<Value, ConnectionError> {
    let mut tag_buf = [0u8; 1];
    let n = reader.read(&mut tag_buf).await?;
    if n == 0 {
        return Err(ConnectionError::ConnectionClosed);
    }
    let tag = tag_buf[0];

    let (payload_len, len_of_len_bytes): (usize, usize) = match tag {
        0x00..=0x7f => (0, 0),
        SHORT_STRING_BASE..=LONG_STRING_BASE => ((tag - SHORT_STRING_BASE) as usize, 0),
        0xb8..=0xbf => (0, (tag - LONG_STRING_BASE) as usize),
        SHORT_LIST_BASE..=LONG_LIST_BASE => ((tag - SHORT_LIST_BASE) as usize, 0),
        0xf8..=0xff => (0, (tag - LONG_LIST_BASE) as usize),
    };

    let mut frame = vec![tag];

    let declared_len = if len_of_len_bytes > 0 {
        let mut len_bytes = vec![0u8; len_of_len_bytes];
        reader.read_exact(&mut len_bytes).await?;
        let mut len = 0usize;
        for &b in &len_bytes {
            len = (len << 8) | b as usize;
        }
        frame.extend_from_slice(&len_bytes);
        len
    } else {
        payload_len
    };

    if declared_len > max_frame_len {
        return Err(ConnectionError::Codec(CodecError::FrameTooLarge {
            len: declared_len,
            max: max_frame_len,
        }));
    }

    if tag >= SHORT_STRING_BASE {
        let mut payload = vec![0u8; declared_len];
        reader.read_exact(&mut payload).await?;
        frame.extend_from_slice(&payload);
    }

    let (value, consumed) = codec::decode(&frame)?;
    if consumed != frame.len() {
        return Err(ConnectionError::Codec(CodecError::TrailingBytes {
            remaining: frame.len() - consumed,
        }));
    }
    Ok(value)
}

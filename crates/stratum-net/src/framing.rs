//! Length-prefixed framing of [`LinkFrame`]s over TCP streams.
//!
//! ```text
//! +-------------------+-----------------------------+
//! | length (4 bytes)  |   encoded LinkFrame         |
//! | u32 little-endian |   (length bytes)            |
//! +-------------------+-----------------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes themselves.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::link::{LinkFrame, LinkFrameError, decode_link_frame, encode_link_frame};

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame size exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// The actual frame size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// The frame body could not be decoded.
    #[error("invalid link frame: {0}")]
    Link(#[from] LinkFrameError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read and decode a single frame from the stream.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<LinkFrame, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;

    let frame_len = u32::from_le_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            size: u64::from(frame_len),
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; frame_len as usize];
    reader.read_exact(&mut body).await.map_err(map_eof)?;

    Ok(decode_link_frame(&body)?)
}

/// Encode and write a single frame, then flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &LinkFrame,
    max_frame_bytes: u32,
) -> Result<(), FrameError> {
    let body = encode_link_frame(frame)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= max_frame_bytes)
        .ok_or(FrameError::FrameTooLarge {
            size: body.len() as u64,
            max: max_frame_bytes,
        })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

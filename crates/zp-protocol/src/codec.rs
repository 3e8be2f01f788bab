//! Line codec for the frame envelope.
//!
//! One JSON object per line, terminated by CRLF.  Reads are streaming: a
//! partial line simply keeps the read pending until more bytes arrive (the
//! session layers its deadline on top with `tokio::time::timeout`).  Blank
//! lines between frames are tolerated and skipped.

use crate::Frame;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Failure while reading or writing a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Read the next frame, or `None` on clean EOF.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, CodecError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        let frame: Frame = serde_json::from_str(trimmed)?;
        return Ok(Some(frame));
    }
}

/// Encode one frame and append the CRLF terminator.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let mut data = serde_json::to_vec(frame)?;
    data.extend_from_slice(b"\r\n");
    Ok(data)
}

/// Write one frame followed by CRLF and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let data = encode_frame(frame)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

use std::io::{self, Read, Write};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one frame. A full-resolution color frame plus protocol
/// overhead sits far below this; anything larger is a corrupt length
/// prefix, and honoring it would let a bad peer trigger huge allocations.
pub const MAX_FRAME_BYTES: u32 = 32 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("framed stream i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("declared frame length {0} exceeds the {MAX_FRAME_BYTES} byte limit")]
    Oversize(u32),
}

impl WireError {
    /// Whether this is the peer closing mid-frame (as opposed to a real
    /// transport fault). The server logs these and drops the connection.
    pub fn is_premature_close(&self) -> bool {
        matches!(self, WireError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Read one length-prefixed frame. Partial reads are retried until the
/// declared length is satisfied; a premature close surfaces as
/// `UnexpectedEof`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(WireError::Oversize(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::Oversize(u32::MAX))?;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::Oversize(len));
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Async variant of [`read_frame`] for the daemon's connection handlers.
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(WireError::Oversize(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Async variant of [`write_frame`].
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::Oversize(u32::MAX))?;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::Oversize(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

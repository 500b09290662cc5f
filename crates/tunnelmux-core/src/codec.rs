//! Length-prefixed JSON framing for the tunnel link.
//!
//! Wire format: `[4-byte big-endian length][JSON record]`
//!
//! Decoding does two exact reads, the prefix then the body. Running out of
//! bytes in either read is reported as [`TunnelError::Closed`], which callers
//! treat as the end of the stream rather than a malformed message. There is
//! no resynchronisation: after any error the stream must be discarded.

use crate::error::{TunnelError, TunnelResult};
use crate::message::{Message, WireRecord};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a message into one length-prefixed frame.
pub fn frame_encode(msg: &Message) -> TunnelResult<Vec<u8>> {
    let payload = serde_json::to_vec(&WireRecord::from(msg))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(TunnelError::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a frame body (without the length prefix).
pub fn frame_decode(body: &[u8]) -> TunnelResult<Message> {
    let record: WireRecord = serde_json::from_slice(body)?;
    Message::try_from(record)
}

/// Check a length prefix before allocating for the body.
fn checked_len(prefix: [u8; 4]) -> TunnelResult<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(TunnelError::Protocol("zero-length frame".into()));
    }
    if len > MAX_FRAME_LEN {
        return Err(TunnelError::Protocol(format!(
            "frame length {len} exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    Ok(len)
}

/// Read exactly one frame from `reader`.
pub async fn read_frame<R>(reader: &mut R) -> TunnelResult<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    read_full(reader, &mut prefix).await?;
    let len = checked_len(prefix)?;

    let mut body = vec![0u8; len];
    read_full(reader, &mut body).await?;
    frame_decode(&body)
}

/// Encode `msg` and write it to `writer` as a single frame.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = frame_encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> TunnelResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TunnelError::Closed),
        Err(e) => Err(TunnelError::Io(e)),
    }
}

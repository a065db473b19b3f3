//! Wire protocol shared by the egress and capability proxies: a `u32`
//! big-endian length prefix followed by a UTF-8 JSON body, symmetric for
//! request and response.
//!
//! Grounded on spec section 9's Open Question 3 ("the exact wire format of
//! UDS egress requests is not fully pinned in the source... the port
//! should define a minimal framed protocol and test it directly") — this
//! is that definition.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// No single frame may claim to be larger than this; guards a confused or
/// hostile peer from driving an unbounded allocation.
pub const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

/// Write `value` as one length-prefixed JSON frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| Error::Validation("frame body too large".to_string()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame. Returns `Error::Io` on a clean EOF
/// before any bytes of the length prefix arrive (the normal "peer hung up"
/// case) and `Error::Validation` on an oversized or malformed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Value> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Validation(format!("frame of {len} bytes exceeds {MAX_FRAME_BYTES} byte cap")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

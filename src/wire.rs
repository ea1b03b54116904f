//! Message frame shared by the daemon and worker protocols.
//!
//! Format: [4-byte length (little-endian)][rkyv bytes]

use rkyv::api::high::HighSerializer;
use rkyv::rancor;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected before allocating.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encode a value to bytes with length prefix
pub fn encode<T>(value: &T) -> Result<Vec<u8>, rancor::Error>
where
    T: for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rancor::Error>>,
{
    let bytes = rkyv::to_bytes::<rancor::Error>(value)?;
    let len = bytes.len() as u32;
    let mut result = Vec::with_capacity(4 + bytes.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&bytes);
    Ok(result)
}

/// Read length prefix from buffer
pub fn read_length(buf: &[u8; 4]) -> usize {
    u32::from_le_bytes(*buf) as usize
}

pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await
}

/// Read one frame body into an aligned buffer ready for `rkyv::access`.
pub async fn read_frame<R>(stream: &mut R) -> io::Result<AlignedVec>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = read_length(&len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
        ));
    }

    let mut buf = AlignedVec::with_capacity(len);
    buf.resize(len, 0);
    stream.read_exact(&mut buf[..]).await?;
    Ok(buf)
}

//! Stream framing: `u32` big-endian length followed by the body.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Read one frame.
///
/// Returns `None` on a clean end of stream before the header.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "frame header truncated",
            )
            .into());
        }
        read += n;
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > max_frame_bytes {
        return Err(NetError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: length,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_frame_bytes {
        return Err(NetError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| NetError::FrameTooLarge {
        max_frame_bytes,
        got_bytes: payload.len(),
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_back_to_back() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello", 1024).await.unwrap();
        write_frame(&mut wire, b"", 1024).await.unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);

        let mut reader = wire.as_slice();
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected_both_ways() {
        let mut wire = Vec::new();
        let err = write_frame(&mut wire, &[0u8; 10], 5).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { got_bytes: 10, .. }));

        write_frame(&mut wire, &[0u8; 10], 1024).await.unwrap();
        let err = read_frame(&mut wire.as_slice(), 5).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_error() {
        let wire = [0u8, 0];
        let err = read_frame(&mut wire.as_slice(), 1024).await.unwrap_err();
        assert!(matches!(err, NetError::Io(_)));
    }
}

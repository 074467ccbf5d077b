//! Length-delimited frame codec
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |          Length (4B, BE)          |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::{ProtocolError, MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Wrap a payload into a single frame
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Read exactly one frame from the stream and return its payload
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frame = encode_frame(b"Hello, tunnel!").unwrap();
        assert_eq!(frame.len(), LENGTH_PREFIX_SIZE + 14);

        let mut reader = &frame[..];
        let payload = read_frame(&mut reader).await.unwrap();
        assert_eq!(&payload[..], b"Hello, tunnel!");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let frame = encode_frame(&[]).unwrap();
        let mut reader = &frame[..];
        let payload = read_frame(&mut reader).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_boundaries_preserved_over_stream() {
        let (mut tx, mut rx) = tokio::io::duplex(16);

        let writer = tokio::spawn(async move {
            for payload in [&b"first"[..], &b""[..], &[7u8; 100][..]] {
                tx.write_all(&encode_frame(payload).unwrap()).await.unwrap();
            }
        });

        assert_eq!(&read_frame(&mut rx).await.unwrap()[..], b"first");
        assert!(read_frame(&mut rx).await.unwrap().is_empty());
        assert_eq!(&read_frame(&mut rx).await.unwrap()[..], &[7u8; 100][..]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        assert!(matches!(
            encode_frame(&vec![0u8; MAX_FRAME_SIZE + 1]),
            Err(ProtocolError::MessageTooLarge(_))
        ));

        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let mut reader = &header[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_io_error() {
        let frame = encode_frame(b"cut short").unwrap();
        let mut reader = &frame[..frame.len() - 3];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtocolError::Io(_))
        ));
    }
}

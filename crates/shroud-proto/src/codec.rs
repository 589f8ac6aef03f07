//! Codec for encoding/decoding tunnel handshake messages

use crate::messages::TunnelMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before a message arrived")]
    Closed,
}

/// Tunnel message codec
pub struct TunnelCodec;

impl TunnelCodec {
    /// Handshake messages are tiny; anything bigger is a protocol violation
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    /// Encode a tunnel message to bytes
    ///
    /// Format: [length: u32][payload: bincode serialized message]
    pub fn encode(msg: &TunnelMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Write one message and flush it
    pub async fn write_message<W>(writer: &mut W, msg: &TunnelMessage) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = Self::encode(msg)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one message.
    ///
    /// Never reads past the end of the message: the connection carries a
    /// different protocol right after the handshake.
    pub async fn read_message<R>(reader: &mut R) -> Result<TunnelMessage, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_bytes = [0u8; 4];
        match reader.read_exact(&mut length_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CodecError::Closed)
            }
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        Ok(bincode::deserialize(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_stops_at_message_boundary() {
        let msg = TunnelMessage::Listening {
            hostname: "x.example".to_string(),
        };

        let mut wire = TunnelCodec::encode(&msg).unwrap().to_vec();
        wire.extend_from_slice(b"PRI * HTTP/2.0");

        let mut reader = wire.as_slice();
        let decoded = TunnelCodec::read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(reader, b"PRI * HTTP/2.0");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = TunnelMessage::Listen {
            hostname: "x.example".to_string(),
            version: crate::PROTOCOL_VERSION,
        };

        TunnelCodec::write_message(&mut a, &msg).await.unwrap();
        let decoded = TunnelCodec::read_message(&mut b).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_read_closed() {
        let mut reader: &[u8] = &[];
        let result = TunnelCodec::read_message(&mut reader).await;
        assert!(matches!(result, Err(CodecError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let wire = (1024u32 * 1024).to_be_bytes();
        let mut reader = &wire[..];
        let result = TunnelCodec::read_message(&mut reader).await;
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }
}

//! Server name extraction from a TLS ClientHello
//!
//! The proxy never terminates public TLS. It reads the ClientHello, routes
//! on its SNI and replays the exact bytes into the tunnel.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// TLS record content type for handshake messages
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Handshake message type of a ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// Extension type of server_name
const EXTENSION_SERVER_NAME: u16 = 0x0000;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
/// 2^14 plus the allowed expansion
const MAX_RECORD_LEN: usize = 16384 + 2048;
/// ClientHellos spanning several records are reassembled up to this size
const MAX_CLIENT_HELLO_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SniError {
    #[error("Failed to read ClientHello: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a TLS handshake record (content type {0:#04x})")]
    NotHandshake(u8),

    #[error("First handshake message is not a ClientHello")]
    NotClientHello,

    #[error("Malformed ClientHello")]
    Malformed,

    #[error("ClientHello is too large")]
    TooLarge,

    #[error("ClientHello carries no server name")]
    NoServerName,

    #[error("Invalid SNI hostname: {0}")]
    InvalidSni(String),
}

/// A ClientHello as read off the wire
#[derive(Debug, Clone)]
pub struct ClientHello {
    /// Every byte consumed from the connection, record framing included
    pub raw: Vec<u8>,
    /// SNI hostname, lowercase
    pub server_name: String,
}

/// Read records until the whole ClientHello is buffered, then extract SNI.
///
/// Only the records holding the ClientHello are consumed.
pub async fn read_client_hello<R>(reader: &mut R) -> Result<ClientHello, SniError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let mut handshake = Vec::new();

    let message_len = loop {
        let mut header = [0u8; RECORD_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(SniError::NotHandshake(header[0]));
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return Err(SniError::Malformed);
        }
        if raw.len() + RECORD_HEADER_LEN + record_len > MAX_CLIENT_HELLO_LEN {
            return Err(SniError::TooLarge);
        }

        raw.extend_from_slice(&header);
        let start = raw.len();
        raw.resize(start + record_len, 0);
        reader.read_exact(&mut raw[start..]).await?;
        handshake.extend_from_slice(&raw[start..]);

        if handshake.len() >= HANDSHAKE_HEADER_LEN {
            if handshake[0] != HANDSHAKE_CLIENT_HELLO {
                return Err(SniError::NotClientHello);
            }
            let body_len =
                u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
            let message_len = HANDSHAKE_HEADER_LEN + body_len;
            if message_len > MAX_CLIENT_HELLO_LEN {
                return Err(SniError::TooLarge);
            }
            if handshake.len() >= message_len {
                break message_len;
            }
        }
    };

    let server_name = server_name_from_handshake(&handshake[..message_len])?;
    trace!("Read {} byte ClientHello for {}", raw.len(), server_name);

    Ok(ClientHello { raw, server_name })
}

/// Extract SNI from a ClientHello held in a single TLS record
pub fn extract_sni(client_hello: &[u8]) -> Result<String, SniError> {
    if client_hello.len() < RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN {
        return Err(SniError::Malformed);
    }
    if client_hello[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake(client_hello[0]));
    }
    server_name_from_handshake(&client_hello[RECORD_HEADER_LEN..])
}

/// Parse a handshake message that starts with its 4 byte header
fn server_name_from_handshake(message: &[u8]) -> Result<String, SniError> {
    // Header, version (2) and random (32)
    if message.len() < HANDSHAKE_HEADER_LEN + 34 {
        return Err(SniError::Malformed);
    }
    if message[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }

    let mut offset = HANDSHAKE_HEADER_LEN + 2 + 32;

    // Session ID
    let session_id_len = *message.get(offset).ok_or(SniError::Malformed)? as usize;
    offset += 1 + session_id_len;

    // Cipher suites
    let cipher_suites_len = read_u16(message, offset)? as usize;
    offset += 2 + cipher_suites_len;

    // Compression methods
    let compression_methods_len = *message.get(offset).ok_or(SniError::Malformed)? as usize;
    offset += 1 + compression_methods_len;

    // No extensions at all
    if offset == message.len() {
        return Err(SniError::NoServerName);
    }

    let extensions_len = read_u16(message, offset)? as usize;
    offset += 2;

    let extensions_end = offset + extensions_len;
    if extensions_end > message.len() {
        return Err(SniError::Malformed);
    }

    while offset + 4 <= extensions_end {
        let ext_type = read_u16(message, offset)?;
        let ext_len = read_u16(message, offset + 2)? as usize;
        offset += 4;

        if offset + ext_len > extensions_end {
            return Err(SniError::Malformed);
        }
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_sni_extension(&message[offset..offset + ext_len]);
        }

        offset += ext_len;
    }

    Err(SniError::NoServerName)
}

/// Parse the server_name extension data
fn parse_sni_extension(data: &[u8]) -> Result<String, SniError> {
    if data.len() < 5 {
        return Err(SniError::Malformed);
    }

    // Skip server_name_list length
    let mut offset = 2;

    // name_type 0 is host_name, the only type defined
    if data[offset] != 0 {
        return Err(SniError::InvalidSni("Invalid name type".to_string()));
    }
    offset += 1;

    let name_len = read_u16(data, offset)? as usize;
    offset += 2;

    if offset + name_len > data.len() {
        return Err(SniError::Malformed);
    }

    let hostname = std::str::from_utf8(&data[offset..offset + name_len])
        .map_err(|_| SniError::InvalidSni("Invalid UTF-8 in hostname".to_string()))?;

    if hostname.is_empty() {
        return Err(SniError::InvalidSni("Empty hostname".to_string()));
    }
    if !hostname.is_ascii() {
        return Err(SniError::InvalidSni(format!("Non-ASCII hostname {:?}", hostname)));
    }

    Ok(hostname.to_ascii_lowercase())
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, SniError> {
    match data.get(offset..offset + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(SniError::Malformed),
    }
}

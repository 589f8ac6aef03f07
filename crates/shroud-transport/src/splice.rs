//! Bidirectional byte splicing with per-direction accounting

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Outcome of one copy direction
#[derive(Debug, Default)]
pub struct CopyReport {
    /// Bytes written to the destination
    pub bytes: u64,
    /// First error that ended the direction, `None` on clean EOF
    pub error: Option<io::Error>,
}

impl CopyReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a splice: both directions, always both present
#[derive(Debug, Default)]
pub struct SpliceReport {
    /// First stream towards second
    pub forward: CopyReport,
    /// Second stream towards first
    pub backward: CopyReport,
}

impl SpliceReport {
    pub fn total_bytes(&self) -> u64 {
        self.forward.bytes + self.backward.bytes
    }
}

/// Copy bytes between `a` and `b` in both directions until both are done.
///
/// When one direction reaches EOF (or fails) the write side of its
/// destination is shut down so the peer sees EOF, and the other direction
/// keeps running. The future resolves only once both directions finished.
/// Dropping the future cancels both directions.
pub async fn splice<A, B>(a: A, b: B) -> SpliceReport
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (forward, backward) = tokio::join!(
        copy_half(&mut a_read, &mut b_write),
        copy_half(&mut b_read, &mut a_write),
    );

    SpliceReport { forward, backward }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> CopyReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let error = loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).await {
                    break Some(e);
                }
                bytes += n as u64;
            }
            Err(e) => break Some(e),
        }
    };

    // Half-close the destination whatever ended this direction
    let shutdown = writer.shutdown().await;

    let error = match (error, shutdown) {
        (Some(e), _) => Some(e),
        (None, Err(e)) if e.kind() != io::ErrorKind::NotConnected => Some(e),
        (None, _) => None,
    };

    CopyReport { bytes, error }
}

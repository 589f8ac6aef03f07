//! Adapts one HTTP/2 stream to an `AsyncRead + AsyncWrite` byte stream
//!
//! A background task moves DATA frames between the h2 stream and one end of
//! an in-memory duplex pipe; the caller gets the other end. END_STREAM in
//! either direction shows up as EOF on the opposite side.

use bytes::Bytes;
use futures::future::poll_fn;
use h2::{RecvStream, SendStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tracing::{debug, trace};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Spawn the pump task and return the caller's end of the pipe
pub(crate) fn spawn_pump(
    send: SendStream<Bytes>,
    recv: RecvStream,
    buffer_size: usize,
    stream_id: u64,
) -> DuplexStream {
    let (local, remote) = tokio::io::duplex(buffer_size);

    tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(remote);
        let (inbound, outbound) = tokio::join!(
            pump_inbound(recv, writer, stream_id),
            pump_outbound(reader, send, stream_id),
        );
        trace!(
            "H2 stream {} pump finished ({} bytes in, {} bytes out)",
            stream_id,
            inbound,
            outbound
        );
    });

    local
}

/// h2 DATA frames -> pipe
async fn pump_inbound(mut recv: RecvStream, mut writer: WriteHalf<DuplexStream>, stream_id: u64) -> u64 {
    let mut total = 0u64;

    while let Some(chunk) = recv.data().await {
        let data = match chunk {
            Ok(data) => data,
            Err(e) => {
                debug!("H2 stream {} receive error: {}", stream_id, e);
                break;
            }
        };

        let len = data.len();
        if writer.write_all(&data).await.is_err() {
            debug!("H2 stream {} reader went away", stream_id);
            break;
        }
        // Only hand window back once the bytes left our buffer
        let _ = recv.flow_control().release_capacity(len);
        total += len as u64;
    }

    let _ = writer.shutdown().await;
    total
}

/// pipe -> h2 DATA frames, honoring the peer's flow control window
async fn pump_outbound(mut reader: ReadHalf<DuplexStream>, mut send: SendStream<Bytes>, stream_id: u64) -> u64 {
    let mut total = 0u64;
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => {
                // END_STREAM
                if let Err(e) = send.send_data(Bytes::new(), true) {
                    debug!("H2 stream {} finish error: {}", stream_id, e);
                }
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("H2 stream {} read error: {}", stream_id, e);
                send.send_reset(h2::Reason::CANCEL);
                break;
            }
        };

        let mut data = Bytes::copy_from_slice(&buffer[..n]);
        while !data.is_empty() {
            send.reserve_capacity(data.len());
            let capacity = match poll_fn(|cx| send.poll_capacity(cx)).await {
                Some(Ok(capacity)) => capacity,
                Some(Err(e)) => {
                    debug!("H2 stream {} capacity error: {}", stream_id, e);
                    return total;
                }
                None => {
                    debug!("H2 stream {} closed by peer", stream_id);
                    return total;
                }
            };
            if capacity == 0 {
                continue;
            }

            let chunk = data.split_to(capacity.min(data.len()));
            let len = chunk.len();
            if let Err(e) = send.send_data(chunk, false) {
                debug!("H2 stream {} send error: {}", stream_id, e);
                return total;
            }
            total += len as u64;
        }
    }

    total
}

//! TCP transport
//!
//! `BufferedTransport` drives the handshake and login exchange byte by byte.
//! Once a player is in the world the socket is split: a reader task decodes
//! frames into the session's inbound queue and a writer task writes the
//! batches the tick flushes. Neither task touches world state.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{NetworkError, Result};
use crate::net::codec::FrameDecoder;
use crate::net::session::SessionHandle;

/// Initial read buffer size
const READ_BUFFER_SIZE: usize = 4096;

/// Byte-level access to a connection before it enters the game
#[derive(Debug)]
pub struct BufferedTransport {
    stream: TcpStream,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
}

impl BufferedTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Read exactly n bytes from the transport
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.read_buffer.len() < n {
            let read = self.stream.read_buf(&mut self.read_buffer).await?;
            if read == 0 {
                return Err(NetworkError::ConnectionClosed.into());
            }
        }
        Ok(self.read_buffer.split_to(n).freeze())
    }

    pub async fn read_byte(&mut self) -> Result<u8> {
        let byte = self.read_exact(1).await?;
        Ok(byte[0])
    }

    /// Buffer bytes for the next flush
    pub fn queue_write(&mut self, data: &[u8]) {
        self.write_buffer.extend_from_slice(data);
    }

    /// Write out everything queued
    pub async fn flush(&mut self) -> Result<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        self.write_buffer.clear();
        Ok(())
    }

    /// Split into socket halves plus whatever was read past the login block
    pub fn into_parts(self) -> (OwnedReadHalf, OwnedWriteHalf, BytesMut) {
        let (reader, writer) = self.stream.into_split();
        (reader, writer, self.read_buffer)
    }
}

/// Decode frames until the peer goes away, the stream desyncs or the
/// session is closed by the world.
pub async fn read_loop(
    mut reader: OwnedReadHalf,
    mut buffer: BytesMut,
    mut decoder: FrameDecoder,
    handle: Arc<SessionHandle>,
) {
    let id = handle.id();
    loop {
        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(message)) => {
                    handle.offer(message);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session_id = id, error = %e, "Protocol violation, closing session");
                    handle.signal_disconnect();
                    return;
                }
            }
        }

        tokio::select! {
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    debug!(session_id = id, "Connection closed by peer");
                    break;
                }
                Ok(n) => trace!(session_id = id, bytes = n, "Read"),
                Err(e) => {
                    debug!(session_id = id, error = %e, "Read error");
                    break;
                }
            },
            _ = handle.closed() => break,
        }
    }
    handle.signal_disconnect();
}

/// Write flushed batches in order until the session's sender is dropped.
pub async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    handle: Arc<SessionHandle>,
) {
    let id = handle.id();
    while let Some(batch) = outbound.recv().await {
        if let Err(e) = writer.write_all(&batch).await {
            debug!(session_id = id, error = %e, "Write error");
            handle.signal_disconnect();
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        trace!(session_id = id, error = %e, "Shutdown after close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Isaac;
    use crate::net::codec::{Frame, FrameEncoder, FrameSize};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn sizes(opcode: u8) -> Option<FrameSize> {
        (opcode == 7).then_some(FrameSize::Fixed(2))
    }

    #[tokio::test]
    async fn test_buffered_transport_read_exact() {
        let (mut client, server) = pair().await;
        let mut transport = BufferedTransport::new(server);

        client.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        assert_eq!(transport.read_byte().await.unwrap(), 1);
        assert_eq!(transport.read_exact(2).await.unwrap().as_ref(), &[2, 3]);

        let (_, _, leftover) = transport.into_parts();
        // whatever arrived with the first read is handed on
        assert!(leftover.len() <= 2);
    }

    #[tokio::test]
    async fn test_read_loop_feeds_inbound_queue() {
        let (mut client, server) = pair().await;
        let (reader, _writer) = server.into_split();
        let (handle, mut inbound) = SessionHandle::new(1, "127.0.0.1:1".parse().unwrap(), 4);

        let seed = [1, 2, 3, 4];
        let mut encoder = FrameEncoder::new(Isaac::new(&seed));
        let mut wire = BytesMut::new();
        encoder
            .encode(&Frame::fixed(7, Bytes::from_static(&[9, 8])), &mut wire)
            .unwrap();
        client.write_all(&wire).await.unwrap();

        let task = tokio::spawn(read_loop(
            reader,
            BytesMut::new(),
            FrameDecoder::new(Isaac::new(&seed), sizes),
            handle.clone(),
        ));

        let message = inbound.recv().await.unwrap();
        assert_eq!(message.opcode, 7);
        assert_eq!(message.payload.as_ref(), &[9, 8]);

        drop(client);
        task.await.unwrap();
        assert!(handle.is_disconnected());
    }

    #[tokio::test]
    async fn test_write_loop_writes_batches() {
        let (mut client, server) = pair().await;
        let (_reader, writer) = server.into_split();
        let (handle, _inbound) = SessionHandle::new(1, "127.0.0.1:1".parse().unwrap(), 4);
        let (outbound, receiver) = mpsc::channel(4);

        let task = tokio::spawn(write_loop(writer, receiver, handle));
        outbound.send(Bytes::from_static(&[1, 2])).await.unwrap();
        outbound.send(Bytes::from_static(&[3])).await.unwrap();
        drop(outbound);
        task.await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![1, 2, 3]);
    }
}

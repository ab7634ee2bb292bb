//! Buffered duplex transport over a socket.
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{
    Result,
    protocol::{
        ProtocolError,
        backend::BackendMessage,
        frontend::{self, FrontendMessage, Startup},
    },
};

const READ_BUF_CAPACITY: usize = 64 * 1024;
const WRITE_BUF_CAPACITY: usize = 8 * 1024;

/// Message header: 1 type tag byte + 4 length bytes.
const HEADER: usize = 5;

/// A socket buffered on both directions, framing whole postgres
/// messages.
///
/// Consumers never observe a fragmented message: [`recv`][Self::recv]
/// only returns once the complete body is buffered, as a zero-copy
/// [`Bytes`] view. Sends are buffered until [`flush`][Self::flush], so
/// a multi-message burst reaches the socket as one write.
#[derive(Debug)]
pub struct BufferedStream<S> {
    socket: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BufferedStream<S> {
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(WRITE_BUF_CAPACITY),
        }
    }

    /// Guarantee at least `n` unconsumed bytes in the read buffer.
    ///
    /// Returns synchronously when already satisfied; otherwise grows or
    /// compacts the buffer as needed and reads until satisfied. Each
    /// socket read fills as much of the free capacity as the kernel has
    /// ready, so later messages are usually served without a syscall.
    async fn ensure(&mut self, n: usize) -> Result<()> {
        if self.read_buf.len() >= n {
            return Ok(());
        }
        // reclaims consumed head space, or grows to at least `n`
        self.read_buf.reserve(n - self.read_buf.len());
        while self.read_buf.len() < n {
            let read = self.socket.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by backend",
                )
                .into());
            }
        }
        Ok(())
    }

    /// Receive one whole message as its raw `(tag, body)` pair.
    pub async fn recv_raw(&mut self) -> Result<(u8, Bytes)> {
        self.ensure(HEADER).await?;

        let tag = self.read_buf[0];
        let len = i32::from_be_bytes(self.read_buf[1..HEADER].try_into().unwrap());
        let Ok(len) = usize::try_from(len) else {
            return Err(ProtocolError::new(format!("invalid message length {len}")).into());
        };
        if len < 4 {
            return Err(ProtocolError::new(format!("invalid message length {len}")).into());
        }

        self.ensure(1 + len).await?;
        self.read_buf.advance(HEADER);
        let body = self.read_buf.split_to(len - 4).freeze();
        Ok((tag, body))
    }

    /// Receive and decode one backend message.
    pub async fn recv(&mut self) -> Result<BackendMessage> {
        let (tag, body) = self.recv_raw().await?;
        let message = BackendMessage::decode(tag, body)?;
        trace!(message = message.name(), "recv");
        Ok(message)
    }

    /// Buffer a frontend message; [`flush`][Self::flush] sends it.
    pub fn send<M: FrontendMessage>(&mut self, message: &M) {
        frontend::write(message, &mut self.write_buf);
    }

    /// Buffer the startup message, the only frontend message without a
    /// type tag.
    pub fn send_startup(&mut self, startup: &Startup<'_>) {
        startup.write(&mut self.write_buf);
    }

    /// Write the whole send buffer to the socket.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.socket.write_all_buf(&mut self.write_buf).await?;
        self.socket.flush().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::duplex;

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn message(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend(((body.len() + 4) as i32).to_be_bytes());
        out.extend(body);
        out
    }

    #[test]
    fn frames_whole_messages() {
        block_on(async {
            let (client, mut server) = duplex(1024);
            let mut stream = BufferedStream::new(client);

            let mut script = message(b'Z', b"I");
            script.extend(message(b'C', b"SELECT 1\0"));
            server.write_all(&script).await.unwrap();

            let (tag, body) = stream.recv_raw().await.unwrap();
            assert_eq!((tag, &body[..]), (b'Z', &b"I"[..]));
            let (tag, body) = stream.recv_raw().await.unwrap();
            assert_eq!((tag, &body[..]), (b'C', &b"SELECT 1\0"[..]));
        });
    }

    /// Arbitrary TCP fragmentation, including header- and
    /// payload-splits, must yield the identical message sequence.
    #[test]
    fn fragmented_delivery_is_reassembled() {
        for chunk in [1, 2, 3, 4, 7] {
            block_on(async {
                let mut script = message(b'T', &1u16.to_be_bytes());
                script.extend(message(b'D', b"payload that spans fragments"));
                script.extend(message(b'Z', b"I"));

                let (client, mut server) = duplex(8);
                let writer = async {
                    for part in script.chunks(chunk) {
                        server.write_all(part).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                    drop(server);
                };

                let mut stream = BufferedStream::new(client);
                let reader = async {
                    let mut tags = Vec::new();
                    for _ in 0..3 {
                        let (tag, _) = stream.recv_raw().await.unwrap();
                        tags.push(tag);
                    }
                    tags
                };

                let (_, tags) = tokio::join!(writer, reader);
                assert_eq!(tags, [b'T', b'D', b'Z'], "chunk size {chunk}");
            });
        }
    }

    #[test]
    fn zero_read_is_connection_closed() {
        block_on(async {
            let (client, mut server) = duplex(64);
            // half a header, then EOF
            server.write_all(&[b'Z', 0, 0]).await.unwrap();
            drop(server);

            let mut stream = BufferedStream::new(client);
            let err = stream.recv_raw().await.unwrap_err();
            assert!(matches!(err.kind(), crate::ErrorKind::Io(_)));
        });
    }

    #[test]
    fn bogus_length_is_a_protocol_error() {
        block_on(async {
            let (client, mut server) = duplex(64);
            server.write_all(&[b'Z', 0, 0, 0, 2]).await.unwrap();

            let mut stream = BufferedStream::new(client);
            let err = stream.recv_raw().await.unwrap_err();
            assert!(matches!(err.kind(), crate::ErrorKind::Protocol(_)));
        });
    }

    #[test]
    fn flush_drains_the_write_buffer() {
        block_on(async {
            let (client, mut server) = duplex(1024);
            let mut stream = BufferedStream::new(client);

            stream.send(&frontend::Sync);
            stream.send(&frontend::Terminate);
            stream.flush().await.unwrap();

            let mut got = [0u8; 10];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"S\x00\x00\x00\x04X\x00\x00\x00\x04");
        });
    }
}

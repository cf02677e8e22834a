//! Byte I/O contracts consumed by the inbox and outbox agents, plus the TCP
//! adapter used by [`crate::connection::Connection::open`].

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StompError;

/// Blocking single-byte source.
///
/// Implementations block until a byte is available, the stream fails, or
/// `cancel` fires. A cancelled read returns `ErrorKind::Interrupted`.
pub trait ByteRead: Send {
    fn read_byte(&mut self, cancel: &CancellationToken) -> io::Result<u8>;
}

/// Blocking byte sink. Each call writes one complete marshalled frame.
pub trait ByteWrite: Send {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<R: ByteRead + ?Sized> ByteRead for Box<R> {
    fn read_byte(&mut self, cancel: &CancellationToken) -> io::Result<u8> {
        (**self).read_byte(cancel)
    }
}

impl<R: ByteRead + ?Sized> ByteRead for &mut R {
    fn read_byte(&mut self, cancel: &CancellationToken) -> io::Result<u8> {
        (**self).read_byte(cancel)
    }
}

impl<W: ByteWrite + ?Sized> ByteWrite for Box<W> {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_bytes(bytes)
    }
}

impl ByteRead for &[u8] {
    fn read_byte(&mut self, _cancel: &CancellationToken) -> io::Result<u8> {
        match self.split_first() {
            Some((first, rest)) => {
                let byte = *first;
                *self = rest;
                Ok(byte)
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of input",
            )),
        }
    }
}

impl ByteWrite for Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Adapts a closure to [`ByteRead`].
pub struct ReadFn<F>(pub F);

impl<F> ByteRead for ReadFn<F>
where
    F: FnMut(&CancellationToken) -> io::Result<u8> + Send,
{
    fn read_byte(&mut self, cancel: &CancellationToken) -> io::Result<u8> {
        (self.0)(cancel)
    }
}

/// Adapts a closure to [`ByteWrite`].
pub struct WriteFn<F>(pub F);

impl<F> ByteWrite for WriteFn<F>
where
    F: FnMut(&[u8]) -> io::Result<()> + Send,
{
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        (self.0)(bytes)
    }
}

/// A reader/writer pair plus an optional hook that closes the underlying
/// stream once both agents are joined.
pub struct Transport {
    pub reader: Box<dyn ByteRead>,
    pub writer: Box<dyn ByteWrite>,
    pub closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Transport {
    pub fn new(reader: impl ByteRead + 'static, writer: impl ByteWrite + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            closer: None,
        }
    }

    /// Attach a hook run after the agents are stopped (builder style).
    pub fn with_closer(mut self, closer: impl FnOnce() + Send + 'static) -> Self {
        self.closer = Some(Box::new(closer));
        self
    }

    /// Connect to `host:port` and wrap the socket.
    ///
    /// Parameters
    /// - `connect_timeout`: deadline for the TCP connect.
    /// - `poll_interval`: socket read timeout; a blocked read wakes up this
    ///   often to observe cancellation.
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, StompError> {
        let stream = tokio::time::timeout(
            connect_timeout,
            tokio::net::TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| StompError::Timeout(format!("connecting to {}:{}", host, port)))??;
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Self::from_tcp(stream, poll_interval)
    }

    /// Wrap an already connected blocking socket.
    pub fn from_tcp(stream: TcpStream, poll_interval: Duration) -> Result<Self, StompError> {
        let reader = TcpReader::new(stream.try_clone()?, poll_interval)?;
        let writer = TcpWriter::new(stream.try_clone()?);
        Ok(Self::new(reader, writer).with_closer(move || {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(error = %e, "socket shutdown");
            }
        }))
    }
}

/// Buffered socket reader that polls a cancellation token between read
/// timeouts.
pub struct TcpReader {
    inner: BufReader<TcpStream>,
}

impl TcpReader {
    pub fn new(stream: TcpStream, poll_interval: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(poll_interval))?;
        Ok(Self {
            inner: BufReader::new(stream),
        })
    }
}

impl ByteRead for TcpReader {
    fn read_byte(&mut self, cancel: &CancellationToken) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        loop {
            if cancel.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "read cancelled"));
            }
            match self.inner.read(&mut byte) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                }
                Ok(_) => return Ok(byte[0]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct TcpWriter {
    stream: TcpStream,
}

impl TcpWriter {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl ByteWrite for TcpWriter {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }
}

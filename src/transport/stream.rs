//! Length-prefixed frames over a raw byte stream.
//!
//! Works with anything that is `AsyncRead + AsyncWrite`: a TCP socket, a
//! unix socket, or an in-memory `tokio::io::duplex` pipe. Each frame is
//! written as [4-byte BE length][payload].

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::{recv_message, send_message, Duplex, FrameSink, FrameSource, TransportError};

/// Builds [`Duplex`] transports from byte streams.
pub struct StreamTransport;

impl StreamTransport {
    /// Split `io` into framed read and write halves.
    pub fn new<S>(io: S) -> Duplex
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Duplex::new(StreamSink { writer }, StreamSource { reader })
    }

    /// Open a TCP connection to `addr` (`host:port`).
    pub async fn connect_tcp(addr: &str) -> Result<Duplex, TransportError> {
        debug!(addr = %addr, "Connecting over TCP");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

struct StreamSink<S> {
    writer: WriteHalf<S>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> FrameSink for StreamSink<S> {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        send_message(&mut self.writer, &frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

struct StreamSource<S> {
    reader: ReadHalf<S>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> FrameSource for StreamSource<S> {
    async fn recv_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        match recv_message(&mut self.reader).await {
            Ok(frame) => Some(Ok(frame)),
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

//! Transport layer between the client and a remote server.
//!
//! A transport is a duplex channel of opaque frames: a [`FrameSink`] for
//! writing and a [`FrameSource`] for reading, bundled as a [`Duplex`]. The
//! bus layer above only sees whole frames, so the physical medium (websocket,
//! raw socket, in-memory pipe) is interchangeable.

pub mod protocol;
pub mod stream;
pub mod websocket;

pub use protocol::{Body, Frame};
pub use stream::StreamTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;

/// Maximum frame size (64 MB). Safety valve against malformed frames.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Errors raised by the physical transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("frame exceeds max size: {len} > {MAX_MESSAGE_SIZE}")]
    FrameTooLarge { len: usize },

    #[error("invalid server address: {0}")]
    InvalidAddress(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one complete frame.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Flush and close the write half.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame, or `None` once the peer has closed.
    async fn recv_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

/// A connected transport, split into its two halves.
pub struct Duplex {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Duplex {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or(TransportError::FrameTooLarge { len: payload.len() })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::FrameTooLarge { len: len as usize });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

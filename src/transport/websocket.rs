//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite`. The server listens on
//! `ws://{host}/ws`; each bus frame travels as one binary websocket message.
//! The handshake can run over a fresh TCP connection or over a stream the
//! caller already opened.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use super::{Duplex, FrameSink, FrameSource, TransportError};

/// Builds [`Duplex`] transports over websockets.
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Dial `host` (`host:port`) and perform the websocket handshake.
    pub async fn connect(host: &str) -> Result<Duplex, TransportError> {
        let url = server_url(host)?;
        debug!(url = %url, "Connecting over websocket");

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        Ok(Self::from_stream(ws))
    }

    /// Perform the websocket handshake over an already-connected `stream`.
    ///
    /// `host` only fills in the request URL and `Host` header.
    pub async fn connect_over<S>(stream: S, host: &str) -> Result<Duplex, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let url = server_url(host)?;
        debug!(url = %url, "Websocket handshake over caller-supplied stream");

        let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), stream).await?;
        Ok(Self::from_stream(ws))
    }

    /// Wrap an established websocket.
    pub fn from_stream<S>(ws: WebSocketStream<S>) -> Duplex
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Duplex::new(WsSink { sink }, WsSource { stream })
    }
}

/// Build the server endpoint URL for `host`.
pub fn server_url(host: &str) -> Result<String, TransportError> {
    let host = host.trim();
    if host.is_empty() || host.contains('/') {
        return Err(TransportError::InvalidAddress(host.to_string()));
    }
    Ok(format!("ws://{host}/ws"))
}

struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> FrameSink for WsSink<S> {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.sink.send(Message::Binary(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> FrameSource for WsSource<S> {
    async fn recv_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Websocket closed by peer");
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                    trace!("Skipping websocket control frame");
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

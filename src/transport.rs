//! Wire transport.
//!
//! The engine talks to the server through the [`Transport`] trait so tests
//! can script the wire without a network. The production implementation is a
//! WebSocket client.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

/// A duplex text-frame connection to the lobby server.
#[async_trait]
pub trait Transport: Send {
    /// Send one outbound frame.
    async fn send(&mut self, message: String) -> Result<(), TransportError>;

    /// Receive the next inbound frame. `None` means the server closed the
    /// connection cleanly.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory producing a fresh [`Transport`] per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new connection to the server.
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// WebSocket connector for a fixed server URL.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector for the given `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!("connected to {}", self.url);
        Ok(Box::new(WsTransport { inner: stream }))
    }
}

/// WebSocket transport over TCP.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(message)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(frame) = self.inner.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                // Control frames are handled by the protocol layer.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close(None).await?;
        Ok(())
    }
}

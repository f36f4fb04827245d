//! WebSocket channel implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::channel::{Channel, ChannelFactory};
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{ChannelError, ChannelResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bidirectional channel over a WebSocket connection.
///
/// Frames map to binary WebSocket messages; ping/pong traffic is handled
/// internally and never surfaces through `recv`.
#[derive(Debug)]
pub struct WebSocketChannel {
    endpoint: Endpoint,
    stream: Option<WsStream>,
}

impl WebSocketChannel {
    /// Create a new, unconnected WebSocket channel for `endpoint`
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.endpoint.authority())
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&mut self, timeout: Duration) -> ChannelResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let url = self.url();
        debug!("Connecting WebSocket channel to {}", url);

        let (stream, _response) = tokio::time::timeout(timeout, connect_async(&url))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|e| ChannelError::ConnectFailed(format!("failed to connect to {url}: {e}")))?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) -> ChannelResult<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Disconnecting WebSocket channel to {}", self.endpoint);
            let _ = stream.close(None).await;
        }
        Ok(())
    }

    async fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, frame: Bytes) -> ChannelResult<()> {
        let stream = self.stream.as_mut().ok_or(ChannelError::NotConnected)?;
        stream
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> ChannelResult<Option<Bytes>> {
        let stream = self.stream.as_mut().ok_or(ChannelError::NotConnected)?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text.into_bytes()))),
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket channel closed by peer");
                    return Ok(None);
                }
                // Control frames are transparent to the caller
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ChannelError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

/// Factory producing [`WebSocketChannel`] instances
#[derive(Debug, Default)]
pub struct WebSocketChannelFactory;

impl WebSocketChannelFactory {
    /// Create a new WebSocket channel factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ChannelFactory for WebSocketChannelFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn create(&self, endpoint: &Endpoint) -> ChannelResult<Box<dyn Channel>> {
        Ok(Box::new(WebSocketChannel::new(endpoint.clone())))
    }
}

//! TCP channel implementation.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::MAX_FRAME_SIZE;
use crate::channel::{Channel, ChannelFactory};
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{ChannelError, ChannelResult};

/// Bidirectional channel over a TCP socket.
///
/// Frames are length-prefixed (u32, big-endian) and capped at
/// [`MAX_FRAME_SIZE`].
#[derive(Debug)]
pub struct TcpChannel {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl TcpChannel {
    /// Create a new, unconnected TCP channel for `endpoint`
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            local_addr: None,
            peer_addr: None,
        }
    }

    fn stream_mut(&mut self) -> ChannelResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(ChannelError::NotConnected)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&mut self, timeout: Duration) -> ChannelResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let authority = self.endpoint.authority();
        debug!("Connecting TCP channel to {}", authority);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&authority))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|e| {
                ChannelError::ConnectFailed(format!("failed to connect to {authority}: {e}"))
            })?;

        stream.set_nodelay(true)?;
        self.local_addr = stream.local_addr().ok();
        self.peer_addr = stream.peer_addr().ok();
        self.stream = Some(stream);

        Ok(())
    }

    async fn disconnect(&mut self) -> ChannelResult<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Disconnecting TCP channel to {}", self.endpoint);
            // Best-effort orderly shutdown; the peer may already be gone.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, frame: Bytes) -> ChannelResult<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::ProtocolError(format!(
                "frame of {} bytes exceeds limit",
                frame.len()
            )));
        }

        let stream = self.stream_mut()?;
        stream
            .write_u32(frame.len() as u32)
            .await
            .map_err(|e| ChannelError::SendFailed(format!("write length: {e}")))?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| ChannelError::SendFailed(format!("write payload: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| ChannelError::SendFailed(format!("flush: {e}")))?;

        trace!("Sent {} byte frame to {}", frame.len(), self.endpoint);
        Ok(())
    }

    async fn recv(&mut self) -> ChannelResult<Option<Bytes>> {
        let stream = self.stream_mut()?;

        let frame_length = match stream.read_u32().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("TCP channel closed by peer");
                return Ok(None);
            }
            Err(e) => {
                return Err(ChannelError::ReceiveFailed(format!("read length: {e}")));
            }
        };

        if frame_length > MAX_FRAME_SIZE {
            return Err(ChannelError::ProtocolError(format!(
                "frame of {frame_length} bytes exceeds limit"
            )));
        }

        let mut buffer = BytesMut::zeroed(frame_length);
        stream
            .read_exact(&mut buffer)
            .await
            .map_err(|e| ChannelError::ReceiveFailed(format!("read payload: {e}")))?;

        Ok(Some(buffer.freeze()))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Factory producing [`TcpChannel`] instances
#[derive(Debug, Default)]
pub struct TcpChannelFactory;

impl TcpChannelFactory {
    /// Create a new TCP channel factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ChannelFactory for TcpChannelFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn create(&self, endpoint: &Endpoint) -> ChannelResult<Box<dyn Channel>> {
        Ok(Box::new(TcpChannel::new(endpoint.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unconnected_channel() {
        let mut channel = TcpChannel::new(Endpoint::tcp("localhost", 1));
        assert!(!channel.is_live().await);
        assert!(matches!(
            channel.send(Bytes::from_static(b"x")).await,
            Err(ChannelError::NotConnected)
        ));
        // Disconnect before connect is a no-op
        channel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is essentially never listening
        let mut channel = TcpChannel::new(Endpoint::tcp("127.0.0.1", 1));
        let err = channel.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::ConnectFailed(_) | ChannelError::Timeout
        ));
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let length = socket.read_u32().await.unwrap() as usize;
            let mut buffer = vec![0u8; length];
            socket.read_exact(&mut buffer).await.unwrap();
            // Echo it back with the same framing
            socket.write_u32(length as u32).await.unwrap();
            socket.write_all(&buffer).await.unwrap();
        });

        let mut channel = TcpChannel::new(Endpoint::tcp("127.0.0.1", addr.port()));
        channel.connect(Duration::from_secs(5)).await.unwrap();
        assert!(channel.is_live().await);
        assert!(channel.peer_addr().is_some());

        channel.send(Bytes::from_static(b"ping")).await.unwrap();
        let frame = channel.recv().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"ping");

        server.await.unwrap();
        channel.disconnect().await.unwrap();
        assert!(!channel.is_live().await);
    }

    #[tokio::test]
    async fn test_recv_orderly_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut channel = TcpChannel::new(Endpoint::tcp("127.0.0.1", addr.port()));
        channel.connect(Duration::from_secs(5)).await.unwrap();
        server.await.unwrap();

        assert!(channel.recv().await.unwrap().is_none());
    }
}

//! Unix domain socket channel implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::MAX_FRAME_SIZE;
use crate::channel::{Channel, ChannelFactory};
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{ChannelError, ChannelResult};

/// Bidirectional channel over a Unix domain socket.
///
/// The endpoint host carries the filesystem path of the socket. Framing is
/// identical to the TCP channel: u32 big-endian length prefix, capped at
/// [`MAX_FRAME_SIZE`].
#[derive(Debug)]
pub struct UnixChannel {
    endpoint: Endpoint,
    stream: Option<UnixStream>,
}

impl UnixChannel {
    /// Create a new, unconnected Unix socket channel for `endpoint`
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
        }
    }

    fn stream_mut(&mut self) -> ChannelResult<&mut UnixStream> {
        self.stream.as_mut().ok_or(ChannelError::NotConnected)
    }
}

#[async_trait]
impl Channel for UnixChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&mut self, timeout: Duration) -> ChannelResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let path = self.endpoint.host().to_string();
        debug!("Connecting Unix socket channel to {}", path);

        let stream = tokio::time::timeout(timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|e| ChannelError::ConnectFailed(format!("failed to connect to {path}: {e}")))?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) -> ChannelResult<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Disconnecting Unix socket channel to {}", self.endpoint);
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

        Ok(())
    }

    async fn recv(&mut self) -> ChannelResult<Option<Bytes>> {
        let stream = self.stream_mut()?;

        let frame_length = match stream.read_u32().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Unix socket channel closed by peer");
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
}

/// Factory producing [`UnixChannel`] instances
#[derive(Debug, Default)]
pub struct UnixChannelFactory;

impl UnixChannelFactory {
    /// Create a new Unix socket channel factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ChannelFactory for UnixChannelFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn create(&self, endpoint: &Endpoint) -> ChannelResult<Box<dyn Channel>> {
        Ok(Box::new(UnixChannel::new(endpoint.clone())))
    }

    fn is_available(&self) -> bool {
        cfg!(unix)
    }
}

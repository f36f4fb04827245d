//! In-memory duplex channel for tests and examples.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::MAX_FRAME_SIZE;
use crate::channel::{Channel, ChannelFactory};
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{ChannelError, ChannelResult};

const BUFFER_SIZE: usize = 64 * 1024;

/// Bidirectional in-process channel backed by [`tokio::io::duplex`].
///
/// Uses the same u32 length-prefixed framing as the socket channels, so a
/// pair behaves like two ends of a real connection without any IO.
#[derive(Debug)]
pub struct MemoryChannel {
    endpoint: Endpoint,
    stream: Option<DuplexStream>,
    // Half installed at construction, promoted to `stream` by connect()
    pending: Option<DuplexStream>,
    live: Arc<AtomicBool>,
    fail_connect: bool,
    connect_delay: Duration,
}

impl MemoryChannel {
    /// Create a connected pair of channels, both targeting `endpoint`
    #[must_use]
    pub fn pair(endpoint: &Endpoint) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(BUFFER_SIZE);
        (Self::connected(endpoint.clone(), a), Self::connected(endpoint.clone(), b))
    }

    fn connected(endpoint: Endpoint, stream: DuplexStream) -> Self {
        Self {
            endpoint,
            stream: Some(stream),
            pending: None,
            live: Arc::new(AtomicBool::new(true)),
            fail_connect: false,
            connect_delay: Duration::ZERO,
        }
    }

    fn unconnected(
        endpoint: Endpoint,
        pending: DuplexStream,
        live: Arc<AtomicBool>,
        fail_connect: bool,
        connect_delay: Duration,
    ) -> Self {
        Self {
            endpoint,
            stream: None,
            pending: Some(pending),
            live,
            fail_connect,
            connect_delay,
        }
    }

    fn stream_mut(&mut self) -> ChannelResult<&mut DuplexStream> {
        self.stream.as_mut().ok_or(ChannelError::NotConnected)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn kind(&self) -> TransportKind {
        self.endpoint.kind()
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&mut self, timeout: Duration) -> ChannelResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        if self.connect_delay > Duration::ZERO {
            if self.connect_delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(ChannelError::Timeout);
            }
            tokio::time::sleep(self.connect_delay).await;
        }

        if self.fail_connect {
            return Err(ChannelError::ConnectFailed(
                "memory channel configured to fail".to_string(),
            ));
        }

        match self.pending.take() {
            Some(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            None => Err(ChannelError::ConnectFailed(
                "memory channel has no peer".to_string(),
            )),
        }
    }

    async fn disconnect(&mut self) -> ChannelResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn is_live(&self) -> bool {
        self.stream.is_some() && self.live.load(Ordering::Acquire)
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
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&mut self) -> ChannelResult<Option<Bytes>> {
        let stream = self.stream_mut()?;

        let frame_length = match stream.read_u32().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ChannelError::ReceiveFailed(e.to_string())),
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
            .map_err(|e| ChannelError::ReceiveFailed(e.to_string()))?;

        Ok(Some(buffer.freeze()))
    }
}

/// Factory producing pre-wired [`MemoryChannel`] instances.
///
/// Answers for every transport kind, which makes it a drop-in replacement
/// for real factories in pool tests. Peer halves are retained inside the
/// factory so sends buffer instead of failing. Failure modes:
///
/// - [`fail_next`](Self::fail_next): the next N channels fail on connect
/// - [`set_live`](Self::set_live): flips liveness for every channel created
///   by this factory, which background validation observes
/// - [`set_connect_delay`](Self::set_connect_delay): slows connects down,
///   for deadline tests
#[derive(Debug)]
pub struct MemoryChannelFactory {
    live: Arc<AtomicBool>,
    failures_remaining: AtomicU32,
    connect_delay_ms: AtomicU64,
    created: AtomicU64,
    peers: Mutex<Vec<DuplexStream>>,
}

impl Default for MemoryChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannelFactory {
    /// Create a new memory channel factory
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicBool::new(true)),
            failures_remaining: AtomicU32::new(0),
            connect_delay_ms: AtomicU64::new(0),
            created: AtomicU64::new(0),
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` created channels fail on connect
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::Release);
    }

    /// Flip liveness for every channel created by this factory
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    /// Delay every subsequent connect by `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Number of channels created so far
    #[must_use]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }
}

impl ChannelFactory for MemoryChannelFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn create(&self, endpoint: &Endpoint) -> ChannelResult<Box<dyn Channel>> {
        self.created.fetch_add(1, Ordering::AcqRel);

        let fail_connect = {
            let mut remaining = self.failures_remaining.load(Ordering::Acquire);
            loop {
                if remaining == 0 {
                    break false;
                }
                match self.failures_remaining.compare_exchange(
                    remaining,
                    remaining - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break true,
                    Err(current) => remaining = current,
                }
            }
        };

        let (ours, theirs) = tokio::io::duplex(BUFFER_SIZE);
        self.peers.lock().push(theirs);

        let delay = Duration::from_millis(self.connect_delay_ms.load(Ordering::Acquire));
        Ok(Box::new(MemoryChannel::unconnected(
            endpoint.clone(),
            ours,
            Arc::clone(&self.live),
            fail_connect,
            delay,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let endpoint = Endpoint::tcp("test", 1);
        let (mut a, mut b) = MemoryChannel::pair(&endpoint);

        assert!(a.is_live().await);
        a.send(Bytes::from_static(b"ping")).await.unwrap();
        let frame = b.recv().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"ping");

        a.disconnect().await.unwrap();
        assert!(!a.is_live().await);
        // Orderly close propagates to the peer
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_factory_connect_lifecycle() {
        let factory = MemoryChannelFactory::new();
        let endpoint = Endpoint::tcp("test", 1);

        let mut channel = factory.create(&endpoint).unwrap();
        assert!(!channel.is_live().await);

        channel.connect(Duration::from_secs(1)).await.unwrap();
        assert!(channel.is_live().await);
        assert_eq!(factory.created(), 1);

        // Sends buffer against the retained peer half
        channel.send(Bytes::from_static(b"data")).await.unwrap();
    }

    #[tokio::test]
    async fn test_factory_failure_injection() {
        let factory = MemoryChannelFactory::new();
        let endpoint = Endpoint::tcp("test", 1);
        factory.fail_next(1);

        let mut failing = factory.create(&endpoint).unwrap();
        assert!(matches!(
            failing.connect(Duration::from_secs(1)).await,
            Err(ChannelError::ConnectFailed(_))
        ));

        let mut ok = factory.create(&endpoint).unwrap();
        ok.connect(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_factory_liveness_toggle() {
        let factory = MemoryChannelFactory::new();
        let endpoint = Endpoint::tcp("test", 1);

        let mut channel = factory.create(&endpoint).unwrap();
        channel.connect(Duration::from_secs(1)).await.unwrap();
        assert!(channel.is_live().await);

        factory.set_live(false);
        assert!(!channel.is_live().await);
    }

    #[tokio::test]
    async fn test_connect_delay_times_out() {
        let factory = MemoryChannelFactory::new();
        factory.set_connect_delay(Duration::from_millis(200));

        let mut channel = factory.create(&Endpoint::tcp("test", 1)).unwrap();
        let err = channel.connect(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout));
    }
}

//! Core channel traits and the factory registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{ChannelError, ChannelResult};

/// An opaque bidirectional connection to one remote endpoint.
///
/// The pool that manages channels only ever drives the connect/disconnect
/// lifecycle and probes liveness; the frame stream belongs exclusively to
/// whichever caller has the channel checked out. Frame contents are opaque
/// here — RPC framing and serialization live above this trait.
#[async_trait]
pub trait Channel: Send + Sync + std::fmt::Debug {
    /// Transport kind of this channel
    fn kind(&self) -> TransportKind;

    /// Endpoint this channel targets
    fn endpoint(&self) -> &Endpoint;

    /// Establish the connection, bounded by `timeout`
    async fn connect(&mut self, timeout: Duration) -> ChannelResult<()>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&mut self) -> ChannelResult<()>;

    /// Whether the channel is currently usable
    async fn is_live(&self) -> bool;

    /// Send one frame
    async fn send(&mut self, frame: Bytes) -> ChannelResult<()>;

    /// Receive one frame; `None` signals an orderly remote close
    async fn recv(&mut self) -> ChannelResult<Option<Bytes>>;

    /// Local socket address, if the transport has one
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote socket address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Factory for creating channel instances.
///
/// `create` returns an unconnected channel; callers drive
/// [`Channel::connect`] themselves so that connection establishment can be
/// bounded, retried, and accounted for independently of construction.
pub trait ChannelFactory: Send + Sync + std::fmt::Debug {
    /// Transport kind this factory creates
    fn kind(&self) -> TransportKind;

    /// Create a new, unconnected channel for `endpoint`
    fn create(&self, endpoint: &Endpoint) -> ChannelResult<Box<dyn Channel>>;

    /// Check if this channel kind is available on this system
    fn is_available(&self) -> bool {
        true
    }
}

/// Registry mapping transport kinds to channel factories
#[derive(Debug)]
pub struct ChannelRegistry {
    factories: HashMap<TransportKind, Box<dyn ChannelFactory>>,
}

impl ChannelRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry pre-populated with the built-in factories for
    /// every enabled transport feature
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        #[cfg(feature = "tcp")]
        registry.register(Box::new(crate::tcp::TcpChannelFactory::new()));

        #[cfg(feature = "unix")]
        registry.register(Box::new(crate::unix::UnixChannelFactory::new()));

        #[cfg(feature = "websocket")]
        registry.register(Box::new(crate::websocket::WebSocketChannelFactory::new()));

        registry
    }

    /// Register a channel factory
    pub fn register(&mut self, factory: Box<dyn ChannelFactory>) {
        let kind = factory.kind();
        self.factories.insert(kind, factory);
    }

    /// Create an unconnected channel for `endpoint`
    pub fn create(&self, endpoint: &Endpoint) -> ChannelResult<Box<dyn Channel>> {
        let factory = self.factories.get(&endpoint.kind()).ok_or_else(|| {
            ChannelError::NotAvailable(format!("no factory registered for {}", endpoint.kind()))
        })?;

        if !factory.is_available() {
            return Err(ChannelError::NotAvailable(format!(
                "{} channels are not available on this system",
                endpoint.kind()
            )));
        }

        factory.create(endpoint)
    }

    /// Get registered transport kinds that are available
    #[must_use]
    pub fn supported_kinds(&self) -> Vec<TransportKind> {
        self.factories
            .iter()
            .filter(|(_, f)| f.is_available())
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Check if a transport kind has an available factory
    #[must_use]
    pub fn supports(&self, kind: TransportKind) -> bool {
        self.factories.get(&kind).is_some_and(|f| f.is_available())
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChannelFactory;

    #[test]
    fn test_empty_registry() {
        let registry = ChannelRegistry::new();
        assert!(registry.supported_kinds().is_empty());
        assert!(!registry.supports(TransportKind::Tcp));

        let err = registry.create(&Endpoint::tcp("localhost", 1)).unwrap_err();
        assert!(matches!(err, ChannelError::NotAvailable(_)));
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = ChannelRegistry::new();
        registry.register(Box::new(MemoryChannelFactory::new()));

        // The memory factory answers for tcp endpoints
        assert!(registry.supports(TransportKind::Tcp));
        let channel = registry.create(&Endpoint::tcp("localhost", 9000)).unwrap();
        assert_eq!(channel.endpoint().port(), 9000);
    }

    #[cfg(feature = "tcp")]
    #[test]
    fn test_default_registry_has_tcp() {
        let registry = ChannelRegistry::with_defaults();
        assert!(registry.supports(TransportKind::Tcp));
    }
}

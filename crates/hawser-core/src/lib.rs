//! # Hawser Core
//!
//! Endpoint identity and bidirectional channel abstractions shared by the
//! Hawser connection pool. A [`Channel`] is an opaque connect/disconnect/
//! stream resource to one remote endpoint; the pool layered on top of this
//! crate never inspects the frames flowing through it.
//!
//! ## Supported Channels
//!
//! - **TCP**: length-prefixed frames over a TCP socket (default feature)
//! - **Unix Sockets**: the same framing over a local Unix domain socket
//! - **WebSocket**: binary messages over a WebSocket connection
//! - **Memory**: in-process duplex pairs for tests and examples
//!
//! ## Module Organization
//!
//! ```text
//! hawser-core/
//! ├── endpoint/    # Endpoint identity and canonical keys
//! ├── channel/     # Channel, factory, and registry traits
//! ├── error/       # Channel error taxonomy
//! ├── tcp/         # TCP channel implementation
//! ├── unix/        # Unix domain socket channel implementation
//! ├── websocket/   # WebSocket channel implementation
//! └── memory/      # In-memory duplex channel for tests
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod memory;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "unix")]
pub mod unix;

#[cfg(feature = "websocket")]
pub mod websocket;

// Re-export the channel abstractions
pub use channel::{Channel, ChannelFactory, ChannelRegistry};
pub use endpoint::{Endpoint, TransportKind};
pub use error::{ChannelError, ChannelResult};
pub use memory::{MemoryChannel, MemoryChannelFactory};

#[cfg(feature = "tcp")]
pub use tcp::{TcpChannel, TcpChannelFactory};

#[cfg(feature = "unix")]
pub use unix::{UnixChannel, UnixChannelFactory};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketChannel, WebSocketChannelFactory};

/// Maximum frame size accepted by the built-in channel implementations.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB

/// Channel feature detection
#[derive(Debug)]
pub struct Features;

impl Features {
    /// Check if the TCP channel is available
    #[must_use]
    pub const fn has_tcp() -> bool {
        cfg!(feature = "tcp")
    }

    /// Check if the Unix socket channel is available
    #[must_use]
    pub const fn has_unix() -> bool {
        cfg!(feature = "unix")
    }

    /// Check if the WebSocket channel is available
    #[must_use]
    pub const fn has_websocket() -> bool {
        cfg!(feature = "websocket")
    }

    /// Get list of available transport kinds
    #[must_use]
    pub fn available_kinds() -> Vec<TransportKind> {
        let mut kinds = Vec::new();

        if Self::has_tcp() {
            kinds.push(TransportKind::Tcp);
        }
        if Self::has_websocket() {
            kinds.push(TransportKind::WebSocket);
        }
        if Self::has_unix() {
            kinds.push(TransportKind::Unix);
        }

        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_detection() {
        let kinds = Features::available_kinds();

        // tcp is enabled by default
        #[cfg(feature = "tcp")]
        assert!(kinds.contains(&TransportKind::Tcp));

        #[cfg(not(any(feature = "tcp", feature = "unix", feature = "websocket")))]
        assert!(kinds.is_empty());
    }
}

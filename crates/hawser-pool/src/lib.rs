//! # Hawser Pool
//!
//! Bounded, self-healing connection pool for RPC clients. The pool bounds
//! the number of live connections per endpoint and globally, hands out
//! healthy connections with minimal latency, reclaims and validates
//! connections in the background, and guarantees exclusive use of a
//! connection while it is checked out.
//!
//! ## Checkout Flow
//!
//! ```text
//! caller ── acquire(endpoint) ──► PoolManager ──► EndpointPool
//!                                                   │ idle reuse
//!                                                   │ bounded creation
//!                                                   │ bounded waiting
//! caller ◄── Arc<PooledConnection> ─────────────────┘
//!   │ acquire_lease() ──► ConnectionLease (exclusive channel access)
//!   │ ... RPC traffic over lease.channel() ...
//!   │ drop(lease)
//!   └ release(connection) ──► back to the idle set or closed
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hawser_core::Endpoint;
//! use hawser_pool::{PoolManager, PoolOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let options = PoolOptions::builder()
//!     .max_connections(32)
//!     .max_per_endpoint(4)
//!     .acquire_timeout(Duration::from_secs(5))
//!     .build()?;
//! let pool = PoolManager::new(options);
//!
//! let endpoint = Endpoint::tcp("rpc.internal", 9000);
//! let connection = pool.acquire(&endpoint, None).await?;
//! let lease = connection.acquire_lease(Duration::from_secs(1)).await?;
//!
//! lease.channel().await?.send(bytes::Bytes::from_static(b"ping")).await?;
//!
//! drop(lease);
//! pool.release(connection, false).await;
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! ```text
//! hawser-pool/
//! ├── config/         # Validated pool options and builder
//! ├── error/          # Pool error taxonomy
//! ├── events/         # Lifecycle event fan-out
//! ├── stats/          # Global and per-endpoint counters
//! ├── lease/          # Exclusive checkout tokens
//! ├── connection/     # Pooled connection state machine
//! ├── endpoint_pool/  # Per-endpoint acquire/release/sweeps
//! ├── validator/      # Pluggable health validation
//! └── manager/        # Endpoint-pool map, global bound, sweeps
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

pub mod config;
pub mod connection;
pub mod endpoint_pool;
pub mod error;
pub mod events;
pub mod lease;
pub mod manager;
pub mod stats;
pub mod validator;

// Re-export the primary API surface
pub use config::{PoolOptions, PoolOptionsBuilder, Presets, ReusePolicy};
pub use connection::{ConnectionId, ConnectionState, PooledConnection};
pub use endpoint_pool::{EndpointCounts, EndpointPool};
pub use error::{PoolError, PoolResult};
pub use events::{DestroyReason, PoolEvent, PoolEventEmitter};
pub use lease::{ConnectionLease, LeaseId};
pub use manager::PoolManager;
pub use stats::{CountersSnapshot, PoolStatsSnapshot, StatsRegistry};
pub use validator::{ConnectionValidator, LivenessValidator};

// Re-export the collaborator surface for convenience
pub use hawser_core::{Channel, ChannelFactory, Endpoint, TransportKind};

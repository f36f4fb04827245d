//! Exclusive, single-use checkout tokens for pooled connections.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::MutexGuard;
use uuid::Uuid;

use hawser_core::Channel;

use crate::connection::PooledConnection;
use crate::error::{PoolError, PoolResult};

/// Unique identifier of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(Uuid);

impl LeaseId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive checkout token for one pooled connection.
///
/// A lease is a capability, not a connection: it holds a reference to its
/// connection and a validity flag. While the lease is alive, the
/// connection's channel belongs to the lease holder alone. Disposal —
/// explicit [`release`](Self::release) or `Drop` — returns the lease to the
/// connection exactly once, regardless of validity, so double release and
/// release-after-invalidation are safe no-ops.
#[derive(Debug)]
pub struct ConnectionLease {
    id: LeaseId,
    connection: Arc<PooledConnection>,
    created_at: Instant,
    valid: Arc<AtomicBool>,
    released: AtomicBool,
}

impl ConnectionLease {
    /// Issue a new lease. Only called by
    /// [`PooledConnection::acquire_lease`].
    pub(crate) fn issue(connection: Arc<PooledConnection>) -> Self {
        Self {
            id: LeaseId::new(),
            connection,
            created_at: Instant::now(),
            valid: Arc::new(AtomicBool::new(true)),
            released: AtomicBool::new(false),
        }
    }

    /// Shared handle to the validity flag, held by the connection so a
    /// forced close can invalidate the lease remotely
    pub(crate) fn validity_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.valid)
    }

    /// Lease identifier
    #[must_use]
    pub const fn id(&self) -> LeaseId {
        self.id
    }

    /// The connection this lease checks out
    #[must_use]
    pub fn connection(&self) -> &Arc<PooledConnection> {
        &self.connection
    }

    /// When the lease was issued
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether the lease is still usable
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) && !self.released.load(Ordering::Acquire)
    }

    /// Permanently mark the lease unusable.
    ///
    /// Used by forced shutdown while the connection is checked out; the
    /// holder's next [`channel`](Self::channel) call fails instead of
    /// touching a disposed channel.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Exclusive access to the leased connection's channel
    pub async fn channel(&self) -> PoolResult<MutexGuard<'_, Box<dyn Channel>>> {
        if !self.is_valid() {
            return Err(PoolError::LeaseUnavailable {
                state: self.connection.state(),
            });
        }
        Ok(self.connection.channel().await)
    }

    /// Release the lease back to its connection
    pub fn release(self) {
        // Drop runs the release exactly once
        drop(self);
    }

    fn release_once(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.connection.release_lease(self.id);
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hawser_core::{ChannelFactory, Endpoint, MemoryChannelFactory};

    use crate::connection::ConnectionState;

    async fn leased() -> (Arc<PooledConnection>, ConnectionLease) {
        let factory = MemoryChannelFactory::new();
        let endpoint = Endpoint::tcp("test", 1);
        let conn = Arc::new(PooledConnection::new(
            endpoint.clone(),
            factory.create(&endpoint).unwrap(),
        ));
        conn.establish(Duration::from_secs(1)).await.unwrap();
        let lease = conn.acquire_lease(Duration::from_millis(50)).await.unwrap();
        (conn, lease)
    }

    #[tokio::test]
    async fn test_release_returns_connection_to_idle() {
        let (conn, lease) = leased().await;
        assert_eq!(conn.state(), ConnectionState::InUse);

        lease.release();
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(!conn.has_outstanding_lease());
    }

    #[tokio::test]
    async fn test_channel_access_requires_validity() {
        let (_conn, lease) = leased().await;

        assert!(lease.channel().await.is_ok());
        lease.invalidate();
        assert!(lease.channel().await.is_err());
    }

    #[tokio::test]
    async fn test_invalidated_lease_still_releases_slot() {
        let (conn, lease) = leased().await;

        lease.invalidate();
        drop(lease);

        // The slot was freed despite the invalidation
        assert_eq!(conn.state(), ConnectionState::Idle);
        let next = conn.acquire_lease(Duration::from_millis(50)).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lease_release_is_noop() {
        let (conn, first) = leased().await;
        let first_id = first.id();
        drop(first);

        let second = conn.acquire_lease(Duration::from_millis(50)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::InUse);

        // Replaying the old lease's release must not free the new slot
        conn.release_lease(first_id);
        assert_eq!(conn.state(), ConnectionState::InUse);
        assert!(second.is_valid());
    }
}

//! Pooled connection state machine and lease issuance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use hawser_core::{Channel, Endpoint};

use crate::error::{PoolError, PoolResult};
use crate::lease::{ConnectionLease, LeaseId};
use crate::validator::ConnectionValidator;

// A lease holder may still be mid-IO on the channel when a close is forced;
// never hang the close path on its guard.
const DISCONNECT_LOCK_WAIT: Duration = Duration::from_millis(250);

/// Unique identifier of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle states.
///
/// `Created → Connecting → Connected → Idle ⇄ InUse`, with `Validating`
/// reachable from `Idle`/`Connected`, `Closing → Closed` terminal, and
/// `Error` terminal for pooling purposes (an errored connection is never
/// revalidated back to health).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Constructed, channel not yet connected
    Created,
    /// Channel connect in progress
    Connecting,
    /// Channel connected, not yet pooled
    Connected,
    /// Healthy and available for lease
    Idle,
    /// Checked out under a lease
    InUse,
    /// Health probe in progress
    Validating,
    /// Teardown in progress
    Closing,
    /// Torn down
    Closed,
    /// Unrecoverable failure
    Error,
}

impl ConnectionState {
    /// Whether a lease may be issued in this state
    #[must_use]
    pub const fn is_leasable(&self) -> bool {
        matches!(self, Self::Connected | Self::Idle)
    }

    /// Whether the connection is still viable for pooling
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Idle | Self::InUse | Self::Validating
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Idle => write!(f, "idle"),
            Self::InUse => write!(f, "in-use"),
            Self::Validating => write!(f, "validating"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug)]
struct LeaseSlot {
    id: LeaseId,
    valid: Arc<AtomicBool>,
}

/// One pooled connection: an exclusively-owned channel plus the state
/// machine, usage statistics, and single-owner lease issuance around it.
///
/// The channel behind a connection belongs to whichever caller currently
/// holds its lease; the pool only ever touches metadata (state, timestamps,
/// set membership) while a lease is outstanding.
#[derive(Debug)]
pub struct PooledConnection {
    id: ConnectionId,
    endpoint: Endpoint,
    channel: tokio::sync::Mutex<Box<dyn Channel>>,
    state: RwLock<ConnectionState>,
    created_at: Instant,
    last_used: Mutex<Instant>,
    use_count: AtomicU64,
    validation_failures: AtomicU64,
    tags: RwLock<HashMap<String, serde_json::Value>>,
    // Single-slot semaphore: holding the permit IS holding the lease
    lease_slot: Semaphore,
    current_lease: Mutex<Option<LeaseSlot>>,
}

impl PooledConnection {
    /// Wrap an unconnected channel in a new pooled connection
    #[must_use]
    pub fn new(endpoint: Endpoint, channel: Box<dyn Channel>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            endpoint,
            channel: tokio::sync::Mutex::new(channel),
            state: RwLock::new(ConnectionState::Created),
            created_at: now,
            last_used: Mutex::new(now),
            use_count: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            tags: RwLock::new(HashMap::new()),
            lease_slot: Semaphore::new(1),
            current_lease: Mutex::new(None),
        }
    }

    /// Connection identifier
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Endpoint this connection targets
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the connection is still viable for pooling
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state().is_healthy()
    }

    /// Time since the connection was created
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last leased or released
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Whether the connection has outlived either expiration policy
    #[must_use]
    pub fn is_expired(&self, idle_timeout: Duration, max_lifetime: Duration) -> bool {
        self.age() > max_lifetime || self.idle_for() > idle_timeout
    }

    /// Number of leases granted over the connection's lifetime
    #[must_use]
    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    /// Number of failed validation probes
    #[must_use]
    pub fn validation_failures(&self) -> u64 {
        self.validation_failures.load(Ordering::Relaxed)
    }

    /// Whether a lease is currently outstanding
    #[must_use]
    pub fn has_outstanding_lease(&self) -> bool {
        self.current_lease.lock().is_some()
    }

    /// Attach an arbitrary property to the connection
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.tags.write().insert(key.into(), value.into());
    }

    /// Read a property previously attached with [`set_tag`](Self::set_tag)
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<serde_json::Value> {
        self.tags.read().get(key).cloned()
    }

    /// Establish the underlying channel.
    ///
    /// `Created → Connecting → Connected`, or `Error` on failure.
    pub async fn establish(&self, timeout: Duration) -> PoolResult<()> {
        *self.state.write() = ConnectionState::Connecting;

        let mut channel = self.channel.lock().await;
        match channel.connect(timeout).await {
            Ok(()) => {
                *self.state.write() = ConnectionState::Connected;
                debug!("Connection {} established to {}", self.id, self.endpoint);
                Ok(())
            }
            Err(source) => {
                *self.state.write() = ConnectionState::Error;
                Err(PoolError::CreationFailed {
                    endpoint: self.endpoint.key(),
                    source,
                })
            }
        }
    }

    /// Acquire the exclusive lease on this connection.
    ///
    /// At most one lease can be outstanding; a second caller waits on the
    /// lease slot up to `deadline`. The connection must be `Connected` or
    /// `Idle` both before and after the slot is won.
    pub async fn acquire_lease(self: &Arc<Self>, deadline: Duration) -> PoolResult<ConnectionLease> {
        let observed = self.state();
        if !observed.is_leasable() {
            return Err(PoolError::LeaseUnavailable { state: observed });
        }

        let permit = match tokio::time::timeout(deadline, self.lease_slot.acquire()).await {
            Ok(Ok(permit)) => permit,
            // Slot semaphore closed: the connection is shutting down
            Ok(Err(_)) => {
                return Err(PoolError::LeaseUnavailable {
                    state: self.state(),
                });
            }
            Err(_) => {
                return Err(PoolError::LeaseUnavailable {
                    state: self.state(),
                });
            }
        };

        let lease = ConnectionLease::issue(Arc::clone(self));

        // Re-check under the locks (same order as release_lease): the
        // connection may have been closed or errored while we waited for
        // the slot, and a concurrent close must observe the lease slot and
        // the InUse state together.
        {
            let mut slot = self.current_lease.lock();
            let mut state = self.state.write();
            if !state.is_leasable() {
                let observed = *state;
                drop(state);
                drop(slot);
                drop(permit);
                return Err(PoolError::LeaseUnavailable { state: observed });
            }
            *state = ConnectionState::InUse;
            *slot = Some(LeaseSlot {
                id: lease.id(),
                valid: lease.validity_flag(),
            });
        }
        permit.forget();

        *self.last_used.lock() = Instant::now();
        self.use_count.fetch_add(1, Ordering::Relaxed);

        trace!("Lease {} issued on connection {}", lease.id(), self.id);
        Ok(lease)
    }

    /// Return the lease identified by `lease_id`.
    ///
    /// No-op unless it is the currently outstanding lease. The state
    /// transition back to `Idle` happens before the slot permit is
    /// returned, so a waiting acquirer never observes `InUse`.
    pub(crate) fn release_lease(&self, lease_id: LeaseId) {
        let mut slot = self.current_lease.lock();
        match slot.as_ref() {
            Some(current) if current.id == lease_id => {
                *slot = None;
                {
                    let mut state = self.state.write();
                    if *state == ConnectionState::InUse {
                        *state = ConnectionState::Idle;
                    }
                }
                *self.last_used.lock() = Instant::now();
                self.lease_slot.add_permits(1);
                trace!("Lease {} released on connection {}", lease_id, self.id);
            }
            _ => {
                trace!(
                    "Ignoring release of non-current lease {} on connection {}",
                    lease_id, self.id
                );
            }
        }
    }

    /// Probe the connection's health.
    ///
    /// Delegates to `validator` when supplied, else checks that the
    /// underlying channel is live. Any error or timeout during the probe is
    /// a failure verdict, never propagated. `Idle`/`Connected →
    /// Validating → Idle` on success, `→ Error` on failure.
    pub async fn validate(
        &self,
        timeout: Duration,
        validator: Option<&Arc<dyn ConnectionValidator>>,
    ) -> bool {
        {
            let mut state = self.state.write();
            if !matches!(*state, ConnectionState::Idle | ConnectionState::Connected) {
                return false;
            }
            *state = ConnectionState::Validating;
        }

        let probe = async {
            match validator {
                Some(validator) => validator.is_healthy(self).await,
                None => self.channel_live().await,
            }
        };
        let healthy = tokio::time::timeout(timeout, probe).await.unwrap_or(false);

        {
            let mut state = self.state.write();
            // Only overwrite if nothing else (a close) intervened
            if *state == ConnectionState::Validating {
                *state = if healthy {
                    ConnectionState::Idle
                } else {
                    ConnectionState::Error
                };
            }
        }

        if !healthy {
            self.validation_failures.fetch_add(1, Ordering::Relaxed);
            debug!("Connection {} failed validation", self.id);
        }
        healthy
    }

    /// Whether the underlying channel reports itself live
    pub async fn channel_live(&self) -> bool {
        self.channel.lock().await.is_live().await
    }

    /// Restart the idle clock
    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Exclusive access to the underlying channel.
    ///
    /// Only the lease holder should call this; the pool itself never
    /// touches the stream while a lease is outstanding.
    pub(crate) async fn channel(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Channel>> {
        self.channel.lock().await
    }

    /// Close the connection.
    ///
    /// Non-forced close waits up to `grace` for an outstanding lease to be
    /// released; whatever is still outstanding afterwards is invalidated.
    /// Idempotent: closing a `Closing`/`Closed` connection is a no-op.
    pub async fn close(&self, force: bool, grace: Duration) {
        {
            let mut state = self.state.write();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }

        if self.has_outstanding_lease() {
            if !force {
                match tokio::time::timeout(grace, self.lease_slot.acquire()).await {
                    // Lease came back within the grace period
                    Ok(Ok(permit)) => permit.forget(),
                    Ok(Err(_)) | Err(_) => {}
                }
            }
            if let Some(slot) = self.current_lease.lock().take() {
                warn!(
                    "Invalidating outstanding lease {} on closing connection {}",
                    slot.id, self.id
                );
                slot.valid.store(false, Ordering::Release);
            }
        }

        // Wake and permanently fail anyone still parked on the lease slot
        self.lease_slot.close();

        match tokio::time::timeout(DISCONNECT_LOCK_WAIT, self.channel.lock()).await {
            Ok(mut channel) => {
                if let Err(e) = channel.disconnect().await {
                    warn!("Error disconnecting connection {}: {}", self.id, e);
                }
            }
            Err(_) => {
                warn!(
                    "Channel of connection {} busy during close; skipping orderly disconnect",
                    self.id
                );
            }
        }

        *self.state.write() = ConnectionState::Closed;
        debug!("Connection {} to {} closed", self.id, self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawser_core::{ChannelFactory, Endpoint, MemoryChannelFactory};

    async fn connected(factory: &MemoryChannelFactory) -> Arc<PooledConnection> {
        let endpoint = Endpoint::tcp("test", 1);
        let channel = factory.create(&endpoint).unwrap();
        let conn = Arc::new(PooledConnection::new(endpoint, channel));
        conn.establish(Duration::from_secs(1)).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_establish_transitions() {
        let factory = MemoryChannelFactory::new();
        let endpoint = Endpoint::tcp("test", 1);
        let conn = PooledConnection::new(endpoint, factory.create(&Endpoint::tcp("test", 1)).unwrap());

        assert_eq!(conn.state(), ConnectionState::Created);
        conn.establish(Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_establish_failure_is_terminal() {
        let factory = MemoryChannelFactory::new();
        factory.fail_next(1);
        let endpoint = Endpoint::tcp("test", 1);
        let conn = PooledConnection::new(endpoint.clone(), factory.create(&endpoint).unwrap());

        let err = conn.establish(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_creation_failure());
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_single_lease_discipline() {
        let factory = MemoryChannelFactory::new();
        let conn = connected(&factory).await;

        let lease = conn.acquire_lease(Duration::from_millis(50)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::InUse);
        assert_eq!(conn.use_count(), 1);

        // Second lease must wait and time out
        let second = conn.acquire_lease(Duration::from_millis(50)).await;
        assert!(matches!(second, Err(PoolError::LeaseUnavailable { .. })));

        drop(lease);
        assert_eq!(conn.state(), ConnectionState::Idle);

        // Slot is free again
        let third = conn.acquire_lease(Duration::from_millis(50)).await.unwrap();
        assert_eq!(conn.use_count(), 2);
        drop(third);
    }

    #[tokio::test]
    async fn test_lease_waiter_sees_idle_not_in_use() {
        let factory = MemoryChannelFactory::new();
        let conn = connected(&factory).await;

        let lease = conn.acquire_lease(Duration::from_millis(50)).await.unwrap();
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.acquire_lease(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        let second = waiter.await.unwrap().unwrap();
        // The waiter was handed the lease after the Idle transition
        assert_eq!(conn.state(), ConnectionState::InUse);
        drop(second);
    }

    #[tokio::test]
    async fn test_validate_success_and_failure() {
        let factory = MemoryChannelFactory::new();
        let conn = connected(&factory).await;

        assert!(conn.validate(Duration::from_secs(1), None).await);
        assert_eq!(conn.state(), ConnectionState::Idle);

        factory.set_live(false);
        assert!(!conn.validate(Duration::from_secs(1), None).await);
        assert_eq!(conn.state(), ConnectionState::Error);
        assert_eq!(conn.validation_failures(), 1);

        // Error is terminal: never revalidated back to health
        factory.set_live(true);
        assert!(!conn.validate(Duration::from_secs(1), None).await);
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = MemoryChannelFactory::new();
        let conn = connected(&factory).await;

        conn.close(false, Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.close(true, Duration::ZERO).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_invalidates_outstanding_lease() {
        let factory = MemoryChannelFactory::new();
        let conn = connected(&factory).await;

        let lease = conn.acquire_lease(Duration::from_millis(50)).await.unwrap();
        assert!(lease.is_valid());

        conn.close(false, Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!lease.is_valid());

        // Releasing the invalidated lease is a safe no-op
        drop(lease);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_lease_rejected_after_close() {
        let factory = MemoryChannelFactory::new();
        let conn = connected(&factory).await;
        conn.close(false, Duration::ZERO).await;

        let result = conn.acquire_lease(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PoolError::LeaseUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_expiry_predicates() {
        let factory = MemoryChannelFactory::new();
        let conn = connected(&factory).await;

        assert!(!conn.is_expired(Duration::from_secs(60), Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(conn.is_expired(Duration::from_millis(10), Duration::from_secs(60)));
        assert!(conn.is_expired(Duration::from_secs(60), Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_tags() {
        let factory = MemoryChannelFactory::new();
        let conn = connected(&factory).await;

        conn.set_tag("shard", 7);
        assert_eq!(conn.tag("shard"), Some(serde_json::Value::from(7)));
        assert_eq!(conn.tag("missing"), None);
    }
}

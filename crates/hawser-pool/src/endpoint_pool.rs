//! Per-endpoint connection pool: bounded acquire, release, and sweeps.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, trace, warn};

use hawser_core::{Channel, ChannelError, ChannelRegistry, Endpoint};

use crate::config::{PoolOptions, ReusePolicy};
use crate::connection::{ConnectionId, PooledConnection};
use crate::error::{PoolError, PoolResult};
use crate::events::{DestroyReason, PoolEvent, PoolEventEmitter};
use crate::stats::{PoolCounters, StatsRegistry};

const RETRY_JITTER_FACTOR: f64 = 0.1;

/// Shared state every endpoint pool operates against
#[derive(Debug)]
pub(crate) struct PoolContext {
    pub(crate) options: PoolOptions,
    pub(crate) registry: ChannelRegistry,
    pub(crate) stats: Arc<StatsRegistry>,
    pub(crate) events: Arc<PoolEventEmitter>,
    // Counting semaphore sized to the global maximum; a live connection
    // holds one permit from creation to destruction
    pub(crate) global_slots: Arc<Semaphore>,
}

impl PoolContext {
    pub(crate) fn new(options: PoolOptions) -> Self {
        let global_slots = Arc::new(Semaphore::new(options.max_connections));
        let stats = if options.stats_enabled {
            StatsRegistry::new()
        } else {
            StatsRegistry::disabled()
        };
        Self {
            options,
            registry: ChannelRegistry::with_defaults(),
            stats: Arc::new(stats),
            events: Arc::new(PoolEventEmitter::new()),
            global_slots,
        }
    }
}

/// Connection counts for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCounts {
    /// Connections currently checked out
    pub active: usize,
    /// Connections currently idle
    pub idle: usize,
    /// Configured per-endpoint minimum
    pub min: usize,
    /// Configured per-endpoint maximum
    pub max: usize,
}

/// Pool of connections for exactly one endpoint.
///
/// Owns the idle queue and the all-connections map, enforces the
/// per-endpoint concurrency bound, and implements acquire, release, and the
/// per-endpoint halves of the background sweeps. The per-endpoint maximum
/// checked against the all-connections map is the authoritative bound;
/// waiting callers park on a wakeup primitive and re-examine the pool, so
/// the wait mechanism can never disagree with the bound.
#[derive(Debug)]
pub struct EndpointPool {
    endpoint: Endpoint,
    key: String,
    ctx: Arc<PoolContext>,
    idle: Mutex<VecDeque<Arc<PooledConnection>>>,
    connections: DashMap<ConnectionId, Arc<PooledConnection>>,
    // At most one creation in flight per endpoint; losers of this race
    // fall through to waiting instead of failing
    creating: AtomicBool,
    waiters: Notify,
    closed: AtomicBool,
}

impl EndpointPool {
    pub(crate) fn new(endpoint: Endpoint, ctx: Arc<PoolContext>) -> Self {
        let key = endpoint.key();
        Self {
            endpoint,
            key,
            ctx,
            idle: Mutex::new(VecDeque::new()),
            connections: DashMap::new(),
            creating: AtomicBool::new(false),
            waiters: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Endpoint this pool serves
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether shutdown has begun for this pool
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current connection counts
    #[must_use]
    pub fn counts(&self) -> EndpointCounts {
        let idle = self.idle.lock().len();
        let total = self.connections.len();
        EndpointCounts {
            active: total.saturating_sub(idle),
            idle,
            min: self.ctx.options.min_per_endpoint,
            max: self.ctx.options.max_per_endpoint,
        }
    }

    /// Connections currently checked out
    #[must_use]
    pub fn active_connections(&self) -> Vec<Arc<PooledConnection>> {
        let idle_ids: HashSet<ConnectionId> =
            self.idle.lock().iter().map(|c| c.id()).collect();
        self.connections
            .iter()
            .filter(|entry| !idle_ids.contains(entry.key()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Acquire a connection: idle reuse, then bounded creation, then
    /// bounded waiting.
    pub(crate) async fn acquire(
        &self,
        deadline: Option<Duration>,
    ) -> PoolResult<Arc<PooledConnection>> {
        let budget = deadline.unwrap_or(self.ctx.options.acquire_timeout);
        let started = Instant::now();
        let max = self.ctx.options.max_per_endpoint;

        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }

            // 1. Reuse an idle connection if one survives vetting
            while let Some(connection) = self.pop_idle() {
                match self.vet(&connection).await {
                    None => {
                        self.ctx
                            .stats
                            .apply(&self.key, PoolCounters::gauge_active_inc);
                        trace!("Reusing idle connection {} to {}", connection.id(), self.key);
                        return Ok(connection);
                    }
                    Some(reason) => {
                        debug!(
                            "Discarding idle connection {} to {} ({})",
                            connection.id(),
                            self.key,
                            reason
                        );
                        if reason == DestroyReason::ValidationFailed {
                            self.ctx
                                .stats
                                .apply(&self.key, PoolCounters::note_validation_failure);
                            self.ctx.events.emit(PoolEvent::ValidationFailed {
                                endpoint: self.key.clone(),
                                connection_id: connection.id(),
                            });
                        }
                        self.destroy(connection, reason).await;
                    }
                }
            }

            // 2. Create below the bound; creation is deduplicated and the
            //    loser of the race falls through to waiting
            if self.connections.len() < max
                && self
                    .creating
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                let remaining = budget.saturating_sub(started.elapsed());
                let result = self.create_raw(remaining).await;
                self.creating.store(false, Ordering::Release);
                // Wake a parked waiter whether we succeeded (capacity may
                // remain) or failed (someone else should try)
                self.waiters.notify_one();

                let connection = result?;
                self.ctx
                    .stats
                    .apply(&self.key, PoolCounters::gauge_active_inc);
                return Ok(connection);
            }

            // 3. Park until a release, eviction, or finished creation
            let notified = self.waiters.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle_available = !self.idle.lock().is_empty();
            let can_create =
                self.connections.len() < max && !self.creating.load(Ordering::Acquire);
            if !idle_available && !can_create {
                let Some(remaining) = budget.checked_sub(started.elapsed()) else {
                    return Err(self.timeout_error(started));
                };
                if remaining.is_zero()
                    || tokio::time::timeout(remaining, notified).await.is_err()
                {
                    return Err(self.timeout_error(started));
                }
            }
        }
    }

    fn timeout_error(&self, started: Instant) -> PoolError {
        PoolError::AcquireTimeout {
            endpoint: self.key.clone(),
            waited: started.elapsed(),
        }
    }

    /// Return a connection to the pool. Returns whether it went back to
    /// the idle set.
    pub(crate) async fn release(
        &self,
        connection: Arc<PooledConnection>,
        force_close: bool,
    ) -> bool {
        self.ctx.stats.apply(&self.key, |c| {
            c.note_released();
            c.gauge_active_dec();
        });

        let options = &self.ctx.options;
        let reason = if force_close {
            Some(DestroyReason::ForceClosed)
        } else if self.is_closed() {
            Some(DestroyReason::Shutdown)
        } else if connection.has_outstanding_lease() {
            warn!(
                "Connection {} released to {} with its lease still outstanding; closing it",
                connection.id(),
                self.key
            );
            Some(DestroyReason::ForceClosed)
        } else if !connection.is_healthy() {
            Some(DestroyReason::Unhealthy)
        } else if connection.is_expired(options.idle_timeout, options.max_lifetime) {
            Some(DestroyReason::Expired)
        } else {
            None
        };

        match reason {
            None => {
                // The idle clock starts at the hand-back, not the last lease
                connection.touch();
                self.push_idle(connection);
                true
            }
            Some(reason) => {
                self.destroy(connection, reason).await;
                false
            }
        }
    }

    /// Create a connection for a caller, outside the acquire path.
    ///
    /// Still honors both concurrency bounds and the one-creation-in-flight
    /// rule.
    pub(crate) async fn create_direct(
        &self,
        deadline: Option<Duration>,
    ) -> PoolResult<Arc<PooledConnection>> {
        let budget = deadline.unwrap_or(self.ctx.options.acquire_timeout);
        let started = Instant::now();

        while self.creating.swap(true, Ordering::AcqRel) {
            if started.elapsed() >= budget {
                return Err(self.timeout_error(started));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let result = if self.is_closed() {
            Err(PoolError::Closed)
        } else if self.connections.len() >= self.ctx.options.max_per_endpoint {
            Err(PoolError::CreationFailed {
                endpoint: self.key.clone(),
                source: ChannelError::NotAvailable(
                    "endpoint is at its connection capacity".to_string(),
                ),
            })
        } else {
            self.create_raw(budget.saturating_sub(started.elapsed())).await
        };

        self.creating.store(false, Ordering::Release);
        self.waiters.notify_one();

        let connection = result?;
        self.ctx
            .stats
            .apply(&self.key, PoolCounters::gauge_active_inc);
        Ok(connection)
    }

    /// Evict idle connections past their idle timeout or maximum lifetime.
    /// Never touches non-idle connections. Returns the eviction count.
    pub(crate) async fn cleanup_expired(&self) -> usize {
        let options = &self.ctx.options;
        let expired: Vec<_> = {
            let mut idle = self.idle.lock();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut evict = Vec::new();
            while let Some(connection) = idle.pop_front() {
                if connection.is_expired(options.idle_timeout, options.max_lifetime) {
                    evict.push(connection);
                } else {
                    keep.push_back(connection);
                }
            }
            *idle = keep;
            evict
        };

        let evicted = expired.len();
        for connection in expired {
            self.ctx
                .stats
                .apply(&self.key, PoolCounters::gauge_idle_dec);
            debug!(
                "Evicting expired connection {} to {} (age {:?}, idle {:?})",
                connection.id(),
                self.key,
                connection.age(),
                connection.idle_for()
            );
            self.destroy(connection, DestroyReason::Expired).await;
        }

        evicted
    }

    /// Probe every idle connection, evicting failures. Returns the number
    /// of evictions.
    pub(crate) async fn validate_idle(&self) -> usize {
        let options = &self.ctx.options;
        let batch: Vec<_> = {
            let mut idle = self.idle.lock();
            idle.drain(..).collect()
        };
        for _ in &batch {
            self.ctx
                .stats
                .apply(&self.key, PoolCounters::gauge_idle_dec);
        }

        let mut failures = 0;
        for connection in batch {
            let healthy = connection
                .validate(options.validation_timeout, options.validator.as_ref())
                .await;
            if healthy {
                self.push_idle(connection);
            } else {
                failures += 1;
                self.ctx
                    .stats
                    .apply(&self.key, PoolCounters::note_validation_failure);
                self.ctx.events.emit(PoolEvent::ValidationFailed {
                    endpoint: self.key.clone(),
                    connection_id: connection.id(),
                });
                self.destroy(connection, DestroyReason::ValidationFailed).await;
            }
        }

        failures
    }

    /// Top the pool up to its configured minimum, seeding the idle queue.
    /// Failures are logged, never surfaced.
    pub(crate) async fn prewarm(&self) {
        let min = self.ctx.options.min_per_endpoint;

        while !self.is_closed() && self.connections.len() < min {
            if self
                .creating
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // A caller-driven creation is in flight; let it count
                // toward the minimum
                break;
            }

            let result = self.create_raw(self.ctx.options.connect_timeout).await;
            self.creating.store(false, Ordering::Release);

            match result {
                Ok(connection) => {
                    debug!("Prewarmed connection {} to {}", connection.id(), self.key);
                    self.push_idle(connection);
                }
                Err(e) => {
                    warn!("Prewarm for {} failed: {}", self.key, e);
                    break;
                }
            }
        }
    }

    /// Close every connection in this pool, gracefully within the
    /// shutdown grace period and forcibly afterwards. Idempotent.
    pub(crate) async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.waiters.notify_waiters();

        // Pull the idle set first so nothing re-issues while we close
        let drained: Vec<_> = {
            let mut idle = self.idle.lock();
            idle.drain(..).collect()
        };
        for _ in &drained {
            self.ctx
                .stats
                .apply(&self.key, PoolCounters::gauge_idle_dec);
        }

        let victims: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if victims.is_empty() {
            return;
        }

        let grace = self.ctx.options.lease_release_grace;
        let graceful = victims.iter().map(|c| c.close(false, grace));
        if tokio::time::timeout(
            self.ctx.options.shutdown_grace,
            futures::future::join_all(graceful),
        )
        .await
        .is_err()
        {
            warn!(
                "Graceful close of {} timed out; force-closing remaining connections",
                self.key
            );
            futures::future::join_all(victims.iter().map(|c| c.close(true, Duration::ZERO)))
                .await;
        }

        for connection in victims {
            if self.connections.remove(&connection.id()).is_some() {
                self.ctx.stats.apply(&self.key, PoolCounters::note_closed);
                // Checked-out connections keep their active-gauge slot
                // until the caller's release comes back
                self.ctx.events.emit(PoolEvent::ConnectionDestroyed {
                    endpoint: self.key.clone(),
                    connection_id: connection.id(),
                    reason: DestroyReason::Shutdown,
                });
                self.ctx.global_slots.add_permits(1);
            }
        }

        debug!("Closed all connections for {}", self.key);
    }

    // ---- internals ----

    fn pop_idle(&self) -> Option<Arc<PooledConnection>> {
        let connection = {
            let mut idle = self.idle.lock();
            match self.ctx.options.reuse_policy {
                ReusePolicy::Lifo => idle.pop_back(),
                ReusePolicy::Fifo => idle.pop_front(),
            }
        };
        if connection.is_some() {
            self.ctx
                .stats
                .apply(&self.key, PoolCounters::gauge_idle_dec);
        }
        connection
    }

    fn push_idle(&self, connection: Arc<PooledConnection>) {
        self.idle.lock().push_back(connection);
        self.ctx
            .stats
            .apply(&self.key, PoolCounters::gauge_idle_inc);
        self.waiters.notify_one();
    }

    /// Vet an idle candidate before hand-off. `None` means usable.
    async fn vet(&self, connection: &Arc<PooledConnection>) -> Option<DestroyReason> {
        let options = &self.ctx.options;

        if connection.is_expired(options.idle_timeout, options.max_lifetime) {
            return Some(DestroyReason::Expired);
        }
        if !connection.is_healthy() {
            return Some(DestroyReason::Unhealthy);
        }
        if options.validate_on_acquire
            && !connection
                .validate(options.validation_timeout, options.validator.as_ref())
                .await
        {
            return Some(DestroyReason::ValidationFailed);
        }
        None
    }

    fn make_channel(&self) -> Result<Box<dyn Channel>, ChannelError> {
        match &self.ctx.options.factory {
            Some(factory) => factory.create(&self.endpoint),
            None => self.ctx.registry.create(&self.endpoint),
        }
    }

    async fn try_create_once(&self) -> PoolResult<PooledConnection> {
        let channel = self
            .make_channel()
            .map_err(|source| PoolError::CreationFailed {
                endpoint: self.key.clone(),
                source,
            })?;
        let connection = PooledConnection::new(self.endpoint.clone(), channel);
        connection
            .establish(self.ctx.options.connect_timeout)
            .await?;
        Ok(connection)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let options = &self.ctx.options;
        let exponent = attempt.saturating_sub(1) as i32;
        let backed_off = options
            .retry_base_delay
            .mul_f64(options.retry_backoff.powi(exponent));
        backed_off.mul_f64(1.0 + RETRY_JITTER_FACTOR * (fastrand::f64() * 2.0 - 1.0))
    }

    /// Create, establish, and register one connection, holding a global
    /// slot for its whole lifetime.
    async fn create_raw(&self, budget: Duration) -> PoolResult<Arc<PooledConnection>> {
        let started = Instant::now();

        let permit = match tokio::time::timeout(
            budget,
            Arc::clone(&self.ctx.global_slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(self.timeout_error(started)),
        };

        let retries = self.ctx.options.create_retries;
        let mut attempt: u32 = 0;
        let connection = loop {
            match self.try_create_once().await {
                Ok(connection) => break connection,
                Err(err) => {
                    attempt += 1;
                    if attempt > retries {
                        self.ctx
                            .stats
                            .apply(&self.key, PoolCounters::note_create_failed);
                        return Err(err);
                    }
                    let delay = self.retry_delay(attempt);
                    warn!(
                        "Connection creation for {} failed (attempt {}/{}): {}; retrying in {:?}",
                        self.key,
                        attempt,
                        retries + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        // The live connection owns this global slot until destroyed
        permit.forget();

        let connection = Arc::new(connection);
        self.connections
            .insert(connection.id(), Arc::clone(&connection));
        self.ctx.stats.apply(&self.key, PoolCounters::note_created);
        self.ctx.events.emit(PoolEvent::ConnectionCreated {
            endpoint: self.key.clone(),
            connection_id: connection.id(),
        });

        debug!("Created connection {} to {}", connection.id(), self.key);
        Ok(connection)
    }

    /// Close a connection and remove it from this pool. Losing the removal
    /// race to a concurrent destroy is tolerated: only the winner closes
    /// and does the bookkeeping.
    pub(crate) async fn destroy(&self, connection: Arc<PooledConnection>, reason: DestroyReason) {
        if self.connections.remove(&connection.id()).is_none() {
            return;
        }

        let force = matches!(reason, DestroyReason::ForceClosed | DestroyReason::Shutdown);
        connection
            .close(force, self.ctx.options.lease_release_grace)
            .await;

        self.ctx.stats.apply(&self.key, PoolCounters::note_closed);
        self.ctx.events.emit(PoolEvent::ConnectionDestroyed {
            endpoint: self.key.clone(),
            connection_id: connection.id(),
            reason,
        });
        self.ctx.global_slots.add_permits(1);
        self.waiters.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptionsBuilder;
    use hawser_core::MemoryChannelFactory;

    fn test_pool(builder: PoolOptionsBuilder) -> (Arc<MemoryChannelFactory>, EndpointPool) {
        let factory = Arc::new(MemoryChannelFactory::new());
        let options = builder.factory(factory.clone()).build().unwrap();
        let ctx = Arc::new(PoolContext::new(options));
        let pool = EndpointPool::new(Endpoint::tcp("test", 9000), ctx);
        (factory, pool)
    }

    fn small_options() -> PoolOptionsBuilder {
        PoolOptions::builder().max_connections(8).max_per_endpoint(2)
    }

    #[tokio::test]
    async fn test_acquire_creates_then_reuses() {
        let (factory, pool) = test_pool(small_options());

        let first = pool.acquire(None).await.unwrap();
        assert_eq!(factory.created(), 1);
        assert_eq!(pool.counts().active, 1);

        pool.release(first, false).await;
        assert_eq!(pool.counts().idle, 1);

        let second = pool.acquire(None).await.unwrap();
        // Idle reuse, no second channel
        assert_eq!(factory.created(), 1);
        pool.release(second, false).await;
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out() {
        let (_factory, pool) = test_pool(small_options());

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        assert_eq!(pool.counts().active, 2);

        let started = Instant::now();
        let result = pool.acquire(Some(Duration::from_millis(60))).await;
        assert!(matches!(result, Err(PoolError::AcquireTimeout { .. })));
        // Bounded overrun of the deadline
        assert!(started.elapsed() < Duration::from_millis(500));

        pool.release(a, false).await;
        pool.release(b, false).await;
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let (_factory, pool) = test_pool(small_options());
        let pool = Arc::new(pool);

        let a = pool.acquire(None).await.unwrap();
        let _b = pool.acquire(None).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        pool.release(a, false).await;
        let reacquired = waiter.await.unwrap().unwrap();
        assert_eq!(pool.counts().active, 2);
        pool.release(reacquired, false).await;
    }

    #[tokio::test]
    async fn test_creation_failure_propagates() {
        let (factory, pool) = test_pool(small_options().create_retries(0));
        factory.fail_next(1);

        let result = pool.acquire(Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(PoolError::CreationFailed { .. })));
        assert_eq!(pool.counts().active, 0);

        // The failed slot was handed back: the next acquire succeeds
        let conn = pool.acquire(None).await.unwrap();
        pool.release(conn, false).await;
    }

    #[tokio::test]
    async fn test_creation_retry_recovers() {
        let (factory, pool) = test_pool(
            small_options()
                .create_retries(2)
                .retry_base_delay(Duration::from_millis(5)),
        );
        factory.fail_next(2);

        let conn = pool.acquire(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(factory.created(), 3);
        pool.release(conn, false).await;
    }

    #[tokio::test]
    async fn test_force_close_on_release() {
        let (_factory, pool) = test_pool(small_options());

        let conn = pool.acquire(None).await.unwrap();
        pool.release(conn, true).await;

        let counts = pool.counts();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.idle, 0);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_only_expired_idle() {
        let (_factory, pool) = test_pool(
            small_options()
                .max_per_endpoint(4)
                .idle_timeout(Duration::from_millis(40)),
        );

        let held = pool.acquire(None).await.unwrap();
        let idle = pool.acquire(None).await.unwrap();
        pool.release(idle, false).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let evicted = pool.cleanup_expired().await;
        assert_eq!(evicted, 1);

        // The checked-out connection was never touched
        assert_eq!(pool.counts().active, 1);
        assert_eq!(pool.counts().idle, 0);
        pool.release(held, false).await;
    }

    #[tokio::test]
    async fn test_prewarm_seeds_idle() {
        let (factory, pool) = test_pool(small_options().max_per_endpoint(4).min_per_endpoint(2));

        pool.prewarm().await;
        assert_eq!(pool.counts().idle, 2);
        assert_eq!(factory.created(), 2);

        // Already at the minimum: a second sweep is a no-op
        pool.prewarm().await;
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails_fast() {
        let (_factory, pool) = test_pool(small_options());
        pool.close_all().await;

        let result = pool.acquire(Some(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(PoolError::Closed)));
    }
}

//! Pool manager: endpoint-pool map, global bound, background sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hawser_core::Endpoint;

use crate::config::PoolOptions;
use crate::connection::PooledConnection;
use crate::endpoint_pool::{EndpointCounts, EndpointPool, PoolContext};
use crate::error::{PoolError, PoolResult};
use crate::events::PoolEvent;
use crate::stats::{PoolCounters, PoolStatsSnapshot};

/// Connection pool manager for one or more remote endpoints.
///
/// Owns one [`EndpointPool`] per endpoint (created lazily on first
/// acquire), enforces the global concurrency bound, runs the background
/// cleanup/validation/prewarm sweeps, aggregates statistics, and emits
/// lifecycle events. Cheap to share: wrap it in an [`Arc`] and clone the
/// handle everywhere connections are needed.
#[derive(Debug)]
pub struct PoolManager {
    ctx: Arc<PoolContext>,
    pools: Arc<DashMap<String, Arc<EndpointPool>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolManager {
    /// Create a pool manager from validated options and start its
    /// background sweeps
    #[must_use]
    pub fn new(options: PoolOptions) -> Arc<Self> {
        let manager = Arc::new(Self {
            ctx: Arc::new(PoolContext::new(options)),
            pools: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            sweepers: Mutex::new(Vec::new()),
        });
        manager.spawn_sweepers();
        manager
    }

    /// The options this manager was built with
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.ctx.options
    }

    /// Whether shutdown has begun
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            Err(PoolError::Closed)
        } else {
            Ok(())
        }
    }

    fn pool_for(&self, endpoint: &Endpoint) -> Arc<EndpointPool> {
        self.pools
            .entry(endpoint.key())
            .or_insert_with(|| {
                debug!("Creating endpoint pool for {}", endpoint);
                Arc::new(EndpointPool::new(endpoint.clone(), Arc::clone(&self.ctx)))
            })
            .clone()
    }

    /// Acquire a connection to `endpoint`.
    ///
    /// `deadline` composes with the configured `acquire_timeout`: when
    /// `None`, the configured default applies. The returned connection is
    /// healthy and exclusively checked out; take a lease on it via
    /// [`PooledConnection::acquire_lease`] and return it with
    /// [`release`](Self::release).
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        deadline: Option<Duration>,
    ) -> PoolResult<Arc<PooledConnection>> {
        self.ensure_open()?;

        let pool = self.pool_for(endpoint);
        let key = endpoint.key();
        let started = Instant::now();

        match pool.acquire(deadline).await {
            Ok(connection) => {
                let wait = started.elapsed();
                self.ctx
                    .stats
                    .apply(&key, |c| c.note_acquired(wait));
                self.ctx.events.emit(PoolEvent::ConnectionAcquired {
                    endpoint: key,
                    connection_id: connection.id(),
                    wait,
                });
                Ok(connection)
            }
            Err(err) => {
                if err.is_timeout() {
                    self.ctx
                        .stats
                        .apply(&key, PoolCounters::note_acquire_timeout);
                }
                // Creation failures are counted at the creation site
                Err(err)
            }
        }
    }

    /// Return a connection to its endpoint pool.
    ///
    /// With `force_close`, or when the connection is unhealthy or expired,
    /// it is closed instead of going back to the idle set. Releasing is
    /// always permitted, even after shutdown has begun.
    pub async fn release(&self, connection: Arc<PooledConnection>, force_close: bool) {
        let key = connection.endpoint().key();
        let connection_id = connection.id();

        let reusable = match self.pools.get(&key).map(|entry| Arc::clone(entry.value())) {
            Some(pool) => pool.release(connection, force_close).await,
            None => {
                // The endpoint pool is already gone (closed endpoint);
                // just make sure the connection is dead
                self.ctx.stats.apply(&key, |c| {
                    c.note_released();
                    c.gauge_active_dec();
                });
                connection.close(force_close, Duration::ZERO).await;
                false
            }
        };

        self.ctx.events.emit(PoolEvent::ConnectionReleased {
            endpoint: key,
            connection_id,
            reusable,
        });
    }

    /// Create a connection outside the acquire path.
    ///
    /// Bounded by the global semaphore and the per-endpoint maximum; the
    /// connection is tracked by its endpoint pool and must be returned
    /// with [`release`](Self::release) like any acquired one.
    pub async fn create_connection(
        &self,
        endpoint: &Endpoint,
        deadline: Option<Duration>,
    ) -> PoolResult<Arc<PooledConnection>> {
        self.ensure_open()?;
        self.pool_for(endpoint).create_direct(deadline).await
    }

    /// Explicitly validate a connection.
    ///
    /// On failure the connection is evicted from its endpoint pool and
    /// `false` is returned.
    pub async fn validate(&self, connection: &Arc<PooledConnection>) -> bool {
        let options = &self.ctx.options;
        let healthy = connection
            .validate(options.validation_timeout, options.validator.as_ref())
            .await;

        if !healthy {
            let key = connection.endpoint().key();
            self.ctx
                .stats
                .apply(&key, PoolCounters::note_validation_failure);
            self.ctx.events.emit(PoolEvent::ValidationFailed {
                endpoint: key.clone(),
                connection_id: connection.id(),
            });
            if let Some(pool) = self.pools.get(&key).map(|entry| Arc::clone(entry.value())) {
                pool.destroy(
                    Arc::clone(connection),
                    crate::events::DestroyReason::ValidationFailed,
                )
                .await;
            }
        }
        healthy
    }

    /// Run one cleanup pass over every endpoint pool, returning the total
    /// number of evicted connections.
    ///
    /// With a `deadline`, the pass stops visiting further endpoint pools
    /// once the budget is spent; connections already being evicted finish.
    pub async fn cleanup_expired(&self, deadline: Option<Duration>) -> usize {
        let started = Instant::now();
        let pools: Vec<_> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = 0;
        for pool in pools {
            if deadline.is_some_and(|budget| started.elapsed() >= budget) {
                debug!("Cleanup pass stopped at its deadline");
                break;
            }
            evicted += pool.cleanup_expired().await;
        }
        if evicted > 0 {
            debug!("Cleanup sweep evicted {} expired connections", evicted);
        }
        evicted
    }

    /// Close every connection to one endpoint and drop its pool.
    ///
    /// Individual close failures are logged, never propagated.
    pub async fn close_endpoint(&self, endpoint: &Endpoint) {
        if let Some((_, pool)) = self.pools.remove(&endpoint.key()) {
            info!("Closing endpoint pool for {}", endpoint);
            pool.close_all().await;
        }
    }

    /// Close every connection to every endpoint.
    ///
    /// The manager itself stays usable: pools are recreated on the next
    /// acquire. Use [`shutdown`](Self::shutdown) for a terminal teardown.
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.close_all().await;
            }
        }
    }

    /// Connections currently checked out, across all endpoints
    #[must_use]
    pub fn list_active(&self) -> Vec<Arc<PooledConnection>> {
        self.pools
            .iter()
            .flat_map(|entry| entry.value().active_connections())
            .collect()
    }

    /// Connection counts for one endpoint.
    ///
    /// Reports zeros (with the configured bounds) when no pool exists yet.
    #[must_use]
    pub fn counts_for(&self, endpoint: &Endpoint) -> EndpointCounts {
        match self.pools.get(&endpoint.key()) {
            Some(pool) => pool.counts(),
            None => EndpointCounts {
                active: 0,
                idle: 0,
                min: self.ctx.options.min_per_endpoint,
                max: self.ctx.options.max_per_endpoint,
            },
        }
    }

    /// Point-in-time statistics snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<PoolEvent> {
        self.ctx.events.subscribe()
    }

    /// Shut the pool down.
    ///
    /// Stops every background sweep first (no sweep runs again once
    /// shutdown begins), then closes every endpoint pool within the
    /// configured grace period, force-closing and lease-invalidating
    /// whatever remains. Idempotent; subsequent operations fail with
    /// [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Pool shutdown started");
        self.shutdown.cancel();

        let sweepers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.sweepers.lock());
        for handle in sweepers {
            // Sweeps exit on the cancelled token; await them so none can
            // fire after this point
            let _ = handle.await;
        }

        self.close_all().await;
        info!("Pool shutdown complete");
    }

    fn spawn_sweepers(self: &Arc<Self>) {
        let options = &self.ctx.options;
        let mut sweepers = self.sweepers.lock();

        sweepers.push(self.spawn_sweep(
            "cleanup",
            options.cleanup_interval,
            |pool| async move {
                pool.cleanup_expired().await;
            },
        ));

        if options.health_checks {
            sweepers.push(self.spawn_sweep(
                "validation",
                options.validation_interval,
                |pool| async move {
                    pool.validate_idle().await;
                },
            ));
        }

        if options.prewarm {
            sweepers.push(self.spawn_sweep(
                "prewarm",
                options.prewarm_interval,
                |pool| async move {
                    pool.prewarm().await;
                },
            ));
        }
    }

    fn spawn_sweep<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        interval: Duration,
        run: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<EndpointPool>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let pools = Arc::clone(&self.pools);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Swallow the immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("Stopping {} sweep", name);
                        break;
                    }
                    _ = ticker.tick() => {
                        let targets: Vec<_> =
                            pools.iter().map(|entry| Arc::clone(entry.value())).collect();
                        for pool in targets {
                            if token.is_cancelled() {
                                break;
                            }
                            run(pool).await;
                        }
                    }
                }
            }
        })
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        // Explicit shutdown is the orderly path; this only guarantees the
        // sweep tasks die with the manager
        self.shutdown.cancel();
        for handle in self.sweepers.lock().drain(..) {
            handle.abort();
        }
        if !self.is_closed() {
            warn!("PoolManager dropped without shutdown; connections were not drained");
        }
    }
}

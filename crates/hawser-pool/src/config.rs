//! Pool configuration and validation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hawser_core::ChannelFactory;

use crate::error::{PoolError, PoolResult};
use crate::validator::ConnectionValidator;

/// Order in which idle connections are reused.
///
/// The reuse order decides which connections the cleanup sweep sees as
/// coldest: `Lifo` concentrates traffic on a few hot connections and lets
/// the rest age out, `Fifo` rotates evenly across the idle set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReusePolicy {
    /// Most recently released connection is reused first
    #[default]
    Lifo,
    /// Oldest idle connection is reused first
    Fifo,
}

impl fmt::Display for ReusePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifo => write!(f, "lifo"),
            Self::Fifo => write!(f, "fifo"),
        }
    }
}

/// Pool configuration, immutable once validated.
///
/// Construct through [`PoolOptions::builder`]; invalid configuration is a
/// hard construction-time failure, never a runtime surprise.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of connections across all endpoints
    pub max_connections: usize,

    /// Advisory global connection floor, reported in statistics
    pub min_connections: usize,

    /// Maximum number of connections per endpoint
    pub max_per_endpoint: usize,

    /// Minimum number of connections per endpoint, maintained by prewarming
    pub min_per_endpoint: usize,

    /// Time bound for establishing a single channel
    pub connect_timeout: Duration,

    /// Default time bound for acquire when the caller supplies no deadline
    pub acquire_timeout: Duration,

    /// Idle time after which a connection is evicted by the cleanup sweep
    pub idle_timeout: Duration,

    /// Total lifetime after which a connection is evicted regardless of use
    pub max_lifetime: Duration,

    /// Time bound for a single validation probe
    pub validation_timeout: Duration,

    /// Interval between cleanup sweeps
    pub cleanup_interval: Duration,

    /// Interval between validation sweeps
    pub validation_interval: Duration,

    /// Interval between prewarm checks
    pub prewarm_interval: Duration,

    /// Grace period for draining connections during pool shutdown
    pub shutdown_grace: Duration,

    /// How long a non-forced close waits for an outstanding lease
    pub lease_release_grace: Duration,

    /// Whether to proactively create connections up to the endpoint minimum
    pub prewarm: bool,

    /// Whether the background validation sweep runs
    pub health_checks: bool,

    /// Whether idle connections are probed before being handed out
    pub validate_on_acquire: bool,

    /// Whether statistics are recorded
    pub stats_enabled: bool,

    /// Idle reuse order
    pub reuse_policy: ReusePolicy,

    /// Additional connect attempts after the first failure
    pub create_retries: u32,

    /// Base delay before the first retry
    pub retry_base_delay: Duration,

    /// Exponential backoff multiplier between retries (>= 1.0)
    pub retry_backoff: f64,

    /// Caller-supplied channel factory, overriding the built-in registry
    pub factory: Option<Arc<dyn ChannelFactory>>,

    /// Caller-supplied connection validator
    pub validator: Option<Arc<dyn ConnectionValidator>>,
}

impl PoolOptions {
    /// Start building a configuration
    #[must_use]
    pub fn builder() -> PoolOptionsBuilder {
        PoolOptionsBuilder::new()
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptionsBuilder::new()
            .build()
            .expect("default pool options should be valid")
    }
}

/// Builder for [`PoolOptions`]
#[derive(Debug, Clone)]
pub struct PoolOptionsBuilder {
    options: PoolOptions,
}

impl PoolOptionsBuilder {
    /// Create a builder seeded with the defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: PoolOptions {
                max_connections: 64,
                min_connections: 0,
                max_per_endpoint: 8,
                min_per_endpoint: 0,
                connect_timeout: Duration::from_secs(10),
                acquire_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(300),
                max_lifetime: Duration::from_secs(1800),
                validation_timeout: Duration::from_secs(5),
                cleanup_interval: Duration::from_secs(60),
                validation_interval: Duration::from_secs(30),
                prewarm_interval: Duration::from_secs(30),
                shutdown_grace: Duration::from_secs(10),
                lease_release_grace: Duration::from_secs(5),
                prewarm: false,
                health_checks: true,
                validate_on_acquire: true,
                stats_enabled: true,
                reuse_policy: ReusePolicy::Lifo,
                create_retries: 2,
                retry_base_delay: Duration::from_millis(100),
                retry_backoff: 2.0,
                factory: None,
                validator: None,
            },
        }
    }

    /// Set the global maximum connection count
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.options.max_connections = max;
        self
    }

    /// Set the advisory global connection floor
    #[must_use]
    pub const fn min_connections(mut self, min: usize) -> Self {
        self.options.min_connections = min;
        self
    }

    /// Set the per-endpoint maximum connection count
    #[must_use]
    pub const fn max_per_endpoint(mut self, max: usize) -> Self {
        self.options.max_per_endpoint = max;
        self
    }

    /// Set the per-endpoint minimum maintained by prewarming
    #[must_use]
    pub const fn min_per_endpoint(mut self, min: usize) -> Self {
        self.options.min_per_endpoint = min;
        self
    }

    /// Set the channel connect timeout
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Set the default acquire deadline
    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.options.acquire_timeout = timeout;
        self
    }

    /// Set the idle eviction threshold
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = timeout;
        self
    }

    /// Set the maximum connection lifetime
    #[must_use]
    pub const fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.options.max_lifetime = lifetime;
        self
    }

    /// Set the validation probe timeout
    #[must_use]
    pub const fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.options.validation_timeout = timeout;
        self
    }

    /// Set the cleanup sweep interval
    #[must_use]
    pub const fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.options.cleanup_interval = interval;
        self
    }

    /// Set the validation sweep interval
    #[must_use]
    pub const fn validation_interval(mut self, interval: Duration) -> Self {
        self.options.validation_interval = interval;
        self
    }

    /// Set the prewarm check interval
    #[must_use]
    pub const fn prewarm_interval(mut self, interval: Duration) -> Self {
        self.options.prewarm_interval = interval;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.options.shutdown_grace = grace;
        self
    }

    /// Set how long a non-forced close waits for an outstanding lease
    #[must_use]
    pub const fn lease_release_grace(mut self, grace: Duration) -> Self {
        self.options.lease_release_grace = grace;
        self
    }

    /// Enable or disable prewarming
    #[must_use]
    pub const fn prewarm(mut self, enabled: bool) -> Self {
        self.options.prewarm = enabled;
        self
    }

    /// Enable or disable the background validation sweep
    #[must_use]
    pub const fn health_checks(mut self, enabled: bool) -> Self {
        self.options.health_checks = enabled;
        self
    }

    /// Enable or disable probing idle connections before hand-out
    #[must_use]
    pub const fn validate_on_acquire(mut self, enabled: bool) -> Self {
        self.options.validate_on_acquire = enabled;
        self
    }

    /// Enable or disable statistics recording
    #[must_use]
    pub const fn stats_enabled(mut self, enabled: bool) -> Self {
        self.options.stats_enabled = enabled;
        self
    }

    /// Set the idle reuse order
    #[must_use]
    pub const fn reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.options.reuse_policy = policy;
        self
    }

    /// Set additional connect attempts after the first failure
    #[must_use]
    pub const fn create_retries(mut self, retries: u32) -> Self {
        self.options.create_retries = retries;
        self
    }

    /// Set the base delay before the first retry
    #[must_use]
    pub const fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.options.retry_base_delay = delay;
        self
    }

    /// Set the exponential backoff multiplier between retries
    #[must_use]
    pub const fn retry_backoff(mut self, multiplier: f64) -> Self {
        self.options.retry_backoff = multiplier;
        self
    }

    /// Override the channel factory wholesale
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.options.factory = Some(factory);
        self
    }

    /// Install a custom connection validator
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn ConnectionValidator>) -> Self {
        self.options.validator = Some(validator);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> PoolResult<PoolOptions> {
        let options = self.options;

        if options.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if options.max_per_endpoint == 0 {
            return Err(PoolError::InvalidConfig(
                "max_per_endpoint must be greater than 0".to_string(),
            ));
        }

        if options.max_per_endpoint > options.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "max_per_endpoint ({}) exceeds max_connections ({})",
                options.max_per_endpoint, options.max_connections
            )));
        }

        if options.min_connections > options.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                options.min_connections, options.max_connections
            )));
        }

        if options.min_per_endpoint > options.max_per_endpoint {
            return Err(PoolError::InvalidConfig(format!(
                "min_per_endpoint ({}) exceeds max_per_endpoint ({})",
                options.min_per_endpoint, options.max_per_endpoint
            )));
        }

        for (name, duration) in [
            ("connect_timeout", options.connect_timeout),
            ("acquire_timeout", options.acquire_timeout),
            ("idle_timeout", options.idle_timeout),
            ("max_lifetime", options.max_lifetime),
            ("validation_timeout", options.validation_timeout),
            ("cleanup_interval", options.cleanup_interval),
            ("validation_interval", options.validation_interval),
            ("prewarm_interval", options.prewarm_interval),
        ] {
            if duration.is_zero() {
                return Err(PoolError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if options.retry_backoff < 1.0 {
            return Err(PoolError::InvalidConfig(format!(
                "retry_backoff must be at least 1.0, got {}",
                options.retry_backoff
            )));
        }

        Ok(options)
    }
}

impl Default for PoolOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Predefined pool configurations
#[derive(Debug)]
pub struct Presets;

impl Presets {
    /// Small pool: a handful of connections to a few endpoints
    #[must_use]
    pub fn small() -> PoolOptions {
        PoolOptions::builder()
            .max_connections(8)
            .max_per_endpoint(2)
            .build()
            .expect("small preset should be valid")
    }

    /// Large pool for high fan-out clients, with prewarming
    #[must_use]
    pub fn large() -> PoolOptions {
        PoolOptions::builder()
            .max_connections(256)
            .max_per_endpoint(16)
            .min_per_endpoint(2)
            .prewarm(true)
            .build()
            .expect("large preset should be valid")
    }

    /// Latency-sensitive pool: short acquire deadlines, aggressive recycling
    #[must_use]
    pub fn low_latency() -> PoolOptions {
        PoolOptions::builder()
            .acquire_timeout(Duration::from_secs(2))
            .connect_timeout(Duration::from_secs(2))
            .idle_timeout(Duration::from_secs(60))
            .create_retries(0)
            .build()
            .expect("low latency preset should be valid")
    }
}

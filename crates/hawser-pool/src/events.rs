//! Pool lifecycle events.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::ConnectionId;

/// Why a connection was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Exceeded its idle timeout or maximum lifetime
    Expired,
    /// Failed a validation probe
    ValidationFailed,
    /// Reported itself unhealthy on release
    Unhealthy,
    /// Caller requested a forced close on release
    ForceClosed,
    /// The pool or endpoint pool was shut down
    Shutdown,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::ValidationFailed => write!(f, "validation-failed"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::ForceClosed => write!(f, "force-closed"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Pool lifecycle events
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A connection was created and added to an endpoint pool
    ConnectionCreated {
        /// Canonical endpoint key
        endpoint: String,
        /// Connection identifier
        connection_id: ConnectionId,
    },

    /// A connection was closed and removed from its endpoint pool
    ConnectionDestroyed {
        /// Canonical endpoint key
        endpoint: String,
        /// Connection identifier
        connection_id: ConnectionId,
        /// Why the connection was destroyed
        reason: DestroyReason,
    },

    /// A connection was handed out to a caller
    ConnectionAcquired {
        /// Canonical endpoint key
        endpoint: String,
        /// Connection identifier
        connection_id: ConnectionId,
        /// How long the caller waited
        wait: Duration,
    },

    /// A connection was returned by a caller
    ConnectionReleased {
        /// Canonical endpoint key
        endpoint: String,
        /// Connection identifier
        connection_id: ConnectionId,
        /// Whether it went back to the idle set (false means it was closed)
        reusable: bool,
    },

    /// A connection failed a validation probe
    ValidationFailed {
        /// Canonical endpoint key
        endpoint: String,
        /// Connection identifier
        connection_id: ConnectionId,
    },
}

/// Fan-out emitter for pool lifecycle events.
///
/// Each subscriber gets its own unbounded channel; a slow or dropped
/// subscriber can never block or abort the operation that emitted the
/// event. Dead subscribers are pruned on the next emit.
#[derive(Debug, Default)]
pub struct PoolEventEmitter {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PoolEvent>>>,
}

impl PoolEventEmitter {
    /// Create a new emitter with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Emit an event to every live subscriber
    pub fn emit(&self, event: PoolEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

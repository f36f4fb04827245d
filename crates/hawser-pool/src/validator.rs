//! Connection health validation.

use async_trait::async_trait;

use crate::connection::PooledConnection;

/// Health predicate for pooled connections.
///
/// Installed per pool instance via
/// [`PoolOptionsBuilder::validator`](crate::config::PoolOptionsBuilder::validator);
/// when absent, the built-in [`LivenessValidator`] probes the underlying
/// channel. Validators must never panic the pool: any error or timeout
/// inside a probe is treated as an unhealthy verdict, not propagated.
#[async_trait]
pub trait ConnectionValidator: Send + Sync + std::fmt::Debug {
    /// Whether `connection` is healthy enough to keep handing out
    async fn is_healthy(&self, connection: &PooledConnection) -> bool;
}

/// Built-in validator: the connection is healthy if its channel reports
/// itself live
#[derive(Debug, Default)]
pub struct LivenessValidator;

#[async_trait]
impl ConnectionValidator for LivenessValidator {
    async fn is_healthy(&self, connection: &PooledConnection) -> bool {
        connection.channel_live().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct AlwaysUnhealthy;

    #[async_trait]
    impl ConnectionValidator for AlwaysUnhealthy {
        async fn is_healthy(&self, _connection: &PooledConnection) -> bool {
            false
        }
    }

    #[test]
    fn test_validator_is_object_safe() {
        let validator: Box<dyn ConnectionValidator> = Box::new(AlwaysUnhealthy);
        let _ = format!("{validator:?}");
    }
}

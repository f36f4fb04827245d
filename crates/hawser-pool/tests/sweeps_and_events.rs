//! Background sweep behavior and lifecycle event stream tests.

use std::sync::Arc;
use std::time::Duration;

use hawser_core::{Endpoint, MemoryChannelFactory};
use hawser_pool::{
    DestroyReason, PoolError, PoolEvent, PoolManager, PoolOptions, PoolOptionsBuilder,
};

fn manager_with(
    builder: PoolOptionsBuilder,
) -> (Arc<MemoryChannelFactory>, Arc<PoolManager>) {
    let factory = Arc::new(MemoryChannelFactory::new());
    let options = builder.factory(factory.clone()).build().unwrap();
    (factory, PoolManager::new(options))
}

fn quiet_options() -> PoolOptionsBuilder {
    PoolOptions::builder()
        .max_connections(16)
        .max_per_endpoint(4)
        .health_checks(false)
        .cleanup_interval(Duration::from_secs(3600))
}

#[tokio::test]
async fn prewarm_sweep_tops_up_known_endpoint() {
    let (factory, pool) = manager_with(
        quiet_options()
            .prewarm(true)
            .min_per_endpoint(2)
            .prewarm_interval(Duration::from_millis(40)),
    );
    let endpoint = Endpoint::tcp("rpc.internal", 9000);

    // The endpoint becomes known to the pool on first use
    let connection = pool.acquire(&endpoint, None).await.unwrap();
    pool.release(connection, true).await;
    assert_eq!(pool.counts_for(&endpoint).idle, 0);

    // The prewarm sweep brings the pool back up to its minimum
    tokio::time::sleep(Duration::from_millis(200)).await;
    let counts = pool.counts_for(&endpoint);
    assert_eq!(counts.idle, 2);
    assert!(factory.created() >= 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn event_stream_covers_the_connection_lifecycle() {
    let (_factory, pool) = manager_with(quiet_options());
    let mut events = pool.subscribe();
    let endpoint = Endpoint::tcp("rpc.internal", 9000);

    let connection = pool.acquire(&endpoint, None).await.unwrap();
    let connection_id = connection.id();
    pool.release(connection, false).await;

    match events.recv().await {
        Some(PoolEvent::ConnectionCreated {
            endpoint: key,
            connection_id: id,
        }) => {
            assert_eq!(key, endpoint.key());
            assert_eq!(id, connection_id);
        }
        other => panic!("expected ConnectionCreated, got {other:?}"),
    }
    assert!(matches!(
        events.recv().await,
        Some(PoolEvent::ConnectionAcquired { .. })
    ));
    assert!(matches!(
        events.recv().await,
        Some(PoolEvent::ConnectionReleased { reusable: true, .. })
    ));

    pool.shutdown().await;

    // Shutdown destroys the idle connection
    match events.recv().await {
        Some(PoolEvent::ConnectionDestroyed {
            reason: DestroyReason::Shutdown,
            ..
        }) => {}
        other => panic!("expected ConnectionDestroyed, got {other:?}"),
    }
}

#[tokio::test]
async fn validation_failure_event_carries_the_endpoint_key() {
    let (factory, pool) = manager_with(
        quiet_options()
            .health_checks(true)
            .validation_interval(Duration::from_millis(40)),
    );
    let mut events = pool.subscribe();
    let endpoint = Endpoint::tcp("rpc.internal", 9000);

    let connection = pool.acquire(&endpoint, None).await.unwrap();
    pool.release(connection, false).await;
    factory.set_live(false);

    // Drain events until the validation sweep reports the failure
    let mut saw_validation_failure = false;
    let mut saw_destroy = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(saw_validation_failure && saw_destroy) {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("validation events within two seconds")
            .expect("event stream open");
        match event {
            PoolEvent::ValidationFailed { endpoint: key, .. } => {
                assert_eq!(key, endpoint.key());
                saw_validation_failure = true;
            }
            PoolEvent::ConnectionDestroyed {
                reason: DestroyReason::ValidationFailed,
                ..
            } => saw_destroy = true,
            _ => {}
        }
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn list_active_reflects_checkouts() {
    let (_factory, pool) = manager_with(quiet_options());
    let first_endpoint = Endpoint::tcp("svc-a", 7000);
    let second_endpoint = Endpoint::tcp("svc-b", 7000);

    assert!(pool.list_active().is_empty());

    let a = pool.acquire(&first_endpoint, None).await.unwrap();
    let b = pool.acquire(&second_endpoint, None).await.unwrap();
    let active = pool.list_active();
    assert_eq!(active.len(), 2);

    pool.release(a, false).await;
    let active = pool.list_active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id(), b.id());

    pool.release(b, false).await;
    assert!(pool.list_active().is_empty());

    pool.shutdown().await;
}

#[tokio::test]
async fn explicit_create_is_tracked_and_capped() {
    let (_factory, pool) = manager_with(quiet_options().max_per_endpoint(2));
    let endpoint = Endpoint::tcp("rpc.internal", 9000);

    let first = pool.create_connection(&endpoint, None).await.unwrap();
    let second = pool.create_connection(&endpoint, None).await.unwrap();
    assert_eq!(pool.counts_for(&endpoint).active, 2);

    // At the per-endpoint cap, explicit creation fails as a creation error
    let result = pool.create_connection(&endpoint, None).await;
    assert!(matches!(result, Err(PoolError::CreationFailed { .. })));

    // Created connections flow through the normal release path
    pool.release(first, false).await;
    pool.release(second, false).await;
    let counts = pool.counts_for(&endpoint);
    assert_eq!(counts.idle, 2);
    assert_eq!(counts.active, 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn created_connection_carries_a_usable_channel() {
    let (_factory, pool) = manager_with(quiet_options());
    let endpoint = Endpoint::tcp("rpc.internal", 9000);

    let connection = pool.acquire(&endpoint, None).await.unwrap();
    let lease = connection
        .acquire_lease(Duration::from_secs(1))
        .await
        .unwrap();

    // Frames written through the lease land in the factory's retained peer
    lease
        .channel()
        .await
        .unwrap()
        .send(bytes::Bytes::from_static(b"ping"))
        .await
        .unwrap();

    drop(lease);
    pool.release(connection, false).await;
    pool.shutdown().await;
}

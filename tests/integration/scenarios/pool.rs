//! Connection pool integration tests
//!
//! Connection reuse, concurrency limits and disconnect_all

use crate::integration::{client_for, MockMemcached};
use memcas::{Client, Config};
use std::sync::Arc;

#[tokio::test]
async fn test_sequential_operations_reuse_one_connection() {
    let mock = MockMemcached::new().await.unwrap();
    let client = client_for(&mock);

    for i in 0..20 {
        client.set(format!("key{}", i), "value", 0).await.unwrap();
    }
    client.get("key0").await.unwrap();

    assert_eq!(mock.stats().connections, 1);
    assert_eq!(mock.stats().requests, 21);
    assert_eq!(client.open_connections(), 1);
}

#[tokio::test]
async fn test_disconnect_all_then_operations_reconnect() {
    let mock = MockMemcached::new().await.unwrap();
    let client = client_for(&mock);

    assert!(client.set("k", "v", 0).await.unwrap());
    client.disconnect_all();
    assert_eq!(client.open_connections(), 0);

    assert_eq!(client.get("k").await.unwrap(), Some(b"v".to_vec()));
    assert_eq!(mock.stats().connections, 2);

    let metrics = client.metrics();
    assert_eq!(metrics.connection_successes, 2);
    assert_eq!(metrics.open_connections, 1);
}

#[tokio::test]
async fn test_disconnect_all_before_any_connection_is_harmless() {
    let mock = MockMemcached::new().await.unwrap();
    let client = client_for(&mock);

    client.disconnect_all();
    client.disconnect_all();

    assert!(client.set("k", "v", 0).await.unwrap());
    assert_eq!(mock.stats().connections, 1);
}

#[tokio::test]
async fn test_concurrent_operations_stay_within_pool_limit() {
    let mock = MockMemcached::new().await.unwrap();
    let config = Config::new(mock.addr()).with_max_connections(3);
    let client = Arc::new(Client::new(config).unwrap());

    let mut handles = Vec::new();
    for i in 0..30 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let key = format!("concurrent{}", i);
            client.set(&key, format!("value{}", i), 0).await.unwrap();
            client.get(&key).await.unwrap()
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let value = handle.await.unwrap();
        assert_eq!(value, Some(format!("value{}", i).into_bytes()));
    }

    assert!(mock.stats().connections <= 3);
    assert!(client.open_connections() <= 3);
}

#[tokio::test]
async fn test_disconnect_all_while_operations_run() {
    let mock = MockMemcached::new().await.unwrap();
    let client = Arc::new(client_for(&mock));

    let writer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            for i in 0..50 {
                assert!(client.set(format!("k{}", i), "v", 0).await.unwrap());
            }
        })
    };

    for _ in 0..5 {
        client.disconnect_all();
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    assert_eq!(client.get("k49").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_reset_metrics_starts_fresh_window() {
    let mock = MockMemcached::new().await.unwrap();
    let client = client_for(&mock);

    client.set("k", "v", 0).await.unwrap();
    let before = client.metrics();
    assert_eq!(before.successful_requests, 1);
    assert!(before.average_connect_latency_ms > 0.0);

    client.reset_metrics();
    let after = client.metrics();
    assert_eq!(after.total_requests, 0);
    assert_eq!(after.average_connect_latency_ms, 0.0);
    // The pooled connection is still open
    assert_eq!(after.open_connections, 1);

    client.get("k").await.unwrap();
    assert_eq!(client.metrics().successful_requests, 1);
}

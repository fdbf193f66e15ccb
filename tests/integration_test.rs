//! Integration tests for the KV client against a simulated cluster

use md5::{Digest, Md5};
use rdma_kv_client::client::{ClientConfig, KvClient, SessionState};
use rdma_kv_client::transport::mock::MockCluster;
use rdma_kv_client::KvError;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rdma_kv_client=debug")
        .try_init();
}

async fn connected_client(cluster: &MockCluster, timeout_ms: u64) -> KvClient {
    let config = ClientConfig {
        bootstrap_addr: cluster.bootstrap_address(),
        request_timeout_ms: timeout_ms,
        ..Default::default()
    };
    let mut client = KvClient::new(config, cluster.context()).unwrap();
    client.initialize(5).await.unwrap();
    client
}

#[tokio::test]
async fn test_put_get_del_scenario() {
    init_tracing();
    let cluster = MockCluster::new(3);
    let mut client = connected_client(&cluster, 500).await;

    client.put("k", b"v", 5).await.unwrap();
    assert_eq!(client.get("k", 5).await.unwrap(), b"v");
    client.del("k", 5).await.unwrap();

    let err = client.get("k", 5).await.unwrap_err();
    assert_eq!(err, KvError::KeyNotFound("k".to_string()));

    assert_eq!(cluster.live_regions(), 0);
    assert_eq!(cluster.in_flight_requests(), 0);
}

#[tokio::test]
async fn test_duplicate_put_keeps_first_value() {
    let cluster = MockCluster::new(1);
    let mut client = connected_client(&cluster, 500).await;

    client.put("dup", b"first", 5).await.unwrap();
    let err = client.put("dup", b"second", 5).await.unwrap_err();
    assert_eq!(err, KvError::DuplicateKey("dup".to_string()));
    assert_eq!(client.get("dup", 5).await.unwrap(), b"first");
}

#[tokio::test]
async fn test_absent_keys() {
    let cluster = MockCluster::new(2);
    let mut client = connected_client(&cluster, 500).await;

    assert!(matches!(client.get("nope", 5).await, Err(KvError::KeyNotFound(_))));
    assert!(matches!(client.del("nope", 5).await, Err(KvError::KeyNotFound(_))));
    assert!(matches!(client.hash("nope", 5).await, Err(KvError::KeyNotFound(_))));
    assert!(!client.contains("nope", 5).await.unwrap());

    client.put("yes", b"1", 5).await.unwrap();
    assert!(client.contains("yes", 5).await.unwrap());
}

#[tokio::test]
async fn test_hash_is_value_digest() {
    let cluster = MockCluster::new(1);
    let mut client = connected_client(&cluster, 500).await;

    client.put("doc", b"hello world", 5).await.unwrap();
    let digest = client.hash("doc", 5).await.unwrap();
    assert_eq!(digest, Md5::digest(b"hello world").to_vec());
}

#[tokio::test]
async fn test_large_values() {
    let cluster = MockCluster::new(1);
    let mut client = connected_client(&cluster, 2000).await;

    for size in [0, 1, 1024, 65536, 1024 * 1024] {
        let key = format!("key_size_{}", size);
        let value: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();

        client.put(&key, &value, 5).await.unwrap();
        let retrieved = client.get(&key, 5).await.unwrap();
        assert_eq!(retrieved.len(), size);
        assert_eq!(retrieved, value);
    }
    assert_eq!(cluster.live_regions(), 0);
}

#[tokio::test]
async fn test_unusual_keys() {
    let cluster = MockCluster::new(2);
    let mut client = connected_client(&cluster, 500).await;

    for key in ["", "ключ-🦀", "with space", "a/b\\c"] {
        client.put(key, key.as_bytes(), 5).await.unwrap();
        assert_eq!(client.get(key, 5).await.unwrap(), key.as_bytes());
    }
}

#[tokio::test]
async fn test_collision_isolation() {
    // every key lands in the same bucket
    let cluster = MockCluster::with_digest(1, |_| 0xc0ffee);
    let addr = cluster.bootstrap_address();
    let mut client = connected_client(&cluster, 500).await;

    let keys = ["first", "middle", "last"];
    let orders: [[usize; 3]; 4] = [[0, 1, 2], [1, 0, 2], [2, 1, 0], [1, 2, 0]];

    for order in orders {
        for key in keys {
            client.put(key, format!("v-{}", key).as_bytes(), 5).await.unwrap();
        }
        assert_eq!(cluster.entry_count(&addr), 3);

        for (step, &victim) in order.iter().enumerate() {
            client.del(keys[victim], 5).await.unwrap();
            assert!(!client.contains(keys[victim], 5).await.unwrap());

            for &survivor in &order[step + 1..] {
                let value = client.get(keys[survivor], 5).await.unwrap();
                assert_eq!(value, format!("v-{}", keys[survivor]).as_bytes());
            }
        }
        assert_eq!(cluster.entry_count(&addr), 0);
    }

    // reinsert into a chain that still holds others
    client.put("first", b"1", 5).await.unwrap();
    client.put("middle", b"2", 5).await.unwrap();
    client.del("first", 5).await.unwrap();
    client.put("first", b"1-again", 5).await.unwrap();
    assert_eq!(client.get("first", 5).await.unwrap(), b"1-again");
    assert_eq!(client.get("middle", 5).await.unwrap(), b"2");
}

#[tokio::test]
async fn test_unresponsive_peer_times_out() {
    init_tracing();
    let cluster = MockCluster::new(1);
    let mut client = connected_client(&cluster, 50).await;

    let started = Instant::now();
    let err = client.put("timeout_test_put", b"x", 1).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, KvError::Network(_)), "got {:?}", err);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(cluster.in_flight_requests(), 0);

    let err = client.get("timeout_test_get", 1).await.unwrap_err();
    assert!(matches!(err, KvError::Network(_)));
    assert_eq!(cluster.in_flight_requests(), 0);
}

#[tokio::test]
async fn test_retry_recovers_from_stall() {
    let cluster = MockCluster::new(2);
    let mut client = connected_client(&cluster, 50).await;
    let first_tag = client.session_tag();

    cluster.stall_next_requests(1);
    client.put("resilient", b"value", 3).await.unwrap();

    assert_eq!(client.state(), SessionState::Ready);
    assert_ne!(client.session_tag(), first_tag);
    assert_eq!(client.get("resilient", 3).await.unwrap(), b"value");
    assert_eq!(client.shard_map().len(), 2);
}

#[tokio::test]
async fn test_failed_call_does_not_poison_session() {
    let cluster = MockCluster::new(2);
    let mut client = connected_client(&cluster, 50).await;

    cluster.stall_next_requests(1);
    let err = client.get("a", 1).await.unwrap_err();
    assert!(matches!(err, KvError::Network(_)));
    assert_eq!(client.state(), SessionState::Connecting);

    // the fault is gone; a single attempt must reach a fresh session
    assert!(!client.contains("a", 1).await.unwrap());
    assert_eq!(client.state(), SessionState::Ready);

    let err = client.put("timeout_test_x", b"v", 1).await.unwrap_err();
    assert!(matches!(err, KvError::Network(_)));
    client.put("k", b"v", 1).await.unwrap();
    assert!(client.contains("k", 1).await.unwrap());
    assert_eq!(cluster.in_flight_requests(), 0);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let cluster = MockCluster::new(1);
    let mut client = connected_client(&cluster, 30).await;

    cluster.stall_next_requests(2);
    let err = client.del("whatever", 2).await.unwrap_err();
    match err {
        KvError::Network(msg) => assert!(msg.contains("DEL"), "{}", msg),
        other => panic!("expected network failure, got {:?}", other),
    }
    assert_eq!(cluster.in_flight_requests(), 0);

    // a definitive answer is not retried
    cluster.stall_next_requests(0);
    let err = client.del("whatever", 2).await.unwrap_err();
    assert!(matches!(err, KvError::KeyNotFound(_)));
}

#[tokio::test]
async fn test_list_spans_all_shards() {
    let cluster = MockCluster::new(3);
    let addresses = cluster.addresses();
    cluster.seed(&addresses[1], "s1", b"from-shard-1").unwrap();
    cluster.seed(&addresses[2], "s2a", b"from-shard-2a").unwrap();
    cluster.seed(&addresses[2], "s2b", b"from-shard-2b").unwrap();

    let mut client = connected_client(&cluster, 500).await;
    client.put("s0", b"from-shard-0", 5).await.unwrap();

    let mut values = client.list(3).await.unwrap();
    values.sort();
    assert_eq!(
        values,
        vec![
            b"from-shard-0".to_vec(),
            b"from-shard-1".to_vec(),
            b"from-shard-2a".to_vec(),
            b"from-shard-2b".to_vec(),
        ]
    );
    assert_eq!(cluster.live_regions(), 0);
    assert_eq!(cluster.in_flight_requests(), 0);
}

#[tokio::test]
async fn test_list_fails_without_partial_results() {
    let cluster = MockCluster::new(2);
    let addresses = cluster.addresses();
    cluster.seed(&addresses[0], "a", b"a").unwrap();
    cluster.seed(&addresses[1], "b", b"b").unwrap();

    let mut client = connected_client(&cluster, 30).await;
    let first = client.list(1).await.unwrap();
    assert_eq!(first.len(), 2);

    // the first shard swallows its only attempt
    cluster.stall_next_requests(1);
    let err = client.list(1).await.unwrap_err();
    assert!(matches!(err, KvError::Network(_)));

    // a stalled shard recovers within a larger budget
    cluster.stall_next_requests(1);
    assert_eq!(client.list(2).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions() {
    let cluster = MockCluster::new(3);
    let mut tasks = JoinSet::new();

    for session in 0..8 {
        let cluster = cluster.clone();
        tasks.spawn(async move {
            let mut client = connected_client(&cluster, 1000).await;
            for i in 0..20 {
                let key = format!("session_{}_key_{}", session, i);
                client.put(&key, key.as_bytes(), 5).await.unwrap();
            }
            for i in 0..20 {
                let key = format!("session_{}_key_{}", session, i);
                assert_eq!(client.get(&key, 5).await.unwrap(), key.as_bytes());
            }
            client.close_connection(5).await.unwrap();
            session
        });
    }

    let mut finished = Vec::new();
    while let Some(result) = tasks.join_next().await {
        finished.push(result.unwrap());
    }
    finished.sort();
    assert_eq!(finished, (0..8).collect::<Vec<_>>());
    assert_eq!(cluster.entry_count(&cluster.bootstrap_address()), 160);
}

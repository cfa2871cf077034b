//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shardline_client::{Client, ClientConfig, HashRange, LocalCluster, Shard, ShardId};

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Two shards splitting the hash space at 2^31.
pub fn two_shard_cluster() -> LocalCluster {
    LocalCluster::with_shards(vec![
        Shard {
            id: 0,
            leader: "node-a".into(),
            hash_range: HashRange::new(0, (1u32 << 31) - 1),
        },
        Shard {
            id: 1,
            leader: "node-b".into(),
            hash_range: HashRange::new(1u32 << 31, u32::MAX),
        },
    ])
}

/// Short linger and backoff so failure paths resolve quickly.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        batch_linger: Duration::from_millis(2),
        request_timeout: Duration::from_secs(5),
        retry_backoff_initial: Duration::from_millis(5),
        retry_backoff_max: Duration::from_millis(50),
        ..ClientConfig::default()
    }
}

pub async fn connect(cluster: &LocalCluster, config: ClientConfig) -> Client {
    Client::connect(config, Arc::new(cluster.clone()), Arc::new(cluster.clone()))
        .await
        .expect("connect client")
}

/// Generate keys until every shard in the cluster owns at least `per_shard`.
pub fn keys_covering_shards(cluster: &LocalCluster, per_shard: usize) -> Vec<String> {
    let shards: Vec<ShardId> = cluster.shards().iter().map(|s| s.id).collect();
    let mut counts = vec![0usize; shards.len()];
    let mut keys = Vec::new();
    let mut i = 0u64;
    while counts.iter().any(|c| *c < per_shard) {
        let key = format!("key-{i}");
        i += 1;
        let shard = cluster.shard_for_key(&key).expect("key is owned");
        let idx = shards.iter().position(|s| *s == shard).expect("known shard");
        counts[idx] += 1;
        keys.push(key);
    }
    keys
}

/// First generated key owned by `shard`.
pub fn key_on_shard(cluster: &LocalCluster, shard: ShardId, prefix: &str) -> String {
    (0u64..)
        .map(|i| format!("{prefix}-{i}"))
        .find(|key| cluster.shard_for_key(key) == Some(shard))
        .expect("some key hashes to every shard")
}

/// Poll `check` until it returns true or `TEST_TIMEOUT` elapses.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

//! Write-stream failure, retry, and leader-move behavior.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{connect, fast_config, key_on_shard, two_shard_cluster, wait_until};
use shardline_client::{ClientConfig, ClientError, Code, Status, TransportError};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminated_stream_fails_pending_writes_then_recovers() {
    let cluster = two_shard_cluster();
    // A long linger puts the three writes below into one batch.
    let config = ClientConfig {
        batch_linger: Duration::from_millis(50),
        ..fast_config()
    };
    let client = Arc::new(connect(&cluster, config).await);
    let key = key_on_shard(&cluster, 0, "pending");

    // Establish the stream, then slow the server so the next batch stays pending.
    client.put(key.clone(), b"warmup".to_vec()).await.unwrap();
    cluster.set_write_delay(Duration::from_secs(5));

    let mut pending = Vec::new();
    for i in 0..3 {
        let client = client.clone();
        let key = format!("{key}-{i}");
        let shard_key = key_on_shard(&cluster, 0, &key);
        pending.push(tokio::spawn(async move { client.put(shard_key, b"v".to_vec()).await }));
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cluster.terminate_write_streams(0), 1);

    for task in pending {
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pending write resolved promptly")
            .unwrap();
        assert_eq!(result, Err(ClientError::StreamClosed));
    }

    cluster.set_write_delay(Duration::ZERO);
    let response = client.put(key.clone(), b"after".to_vec()).await.unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(cluster.write_streams_opened(), 2);
    assert_eq!(client.get(key).await.unwrap().value, Some(b"after".to_vec()));
    client.close().await;
}

#[tokio::test]
async fn retriable_open_failures_are_retried() {
    let cluster = two_shard_cluster();
    let client = connect(&cluster, fast_config()).await;
    cluster.fail_next_write_opens(2, Code::Fenced);

    let response = client.put("retried", b"v".to_vec()).await.unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(cluster.write_streams_opened(), 1);
    client.close().await;
}

#[tokio::test]
async fn terminal_open_failure_is_not_retried() {
    let cluster = two_shard_cluster();
    let client = connect(&cluster, fast_config()).await;
    cluster.fail_next_write_opens(1, Code::InvalidArgument);

    let err = client.put("rejected", b"v".to_vec()).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError {
            code: Code::InvalidArgument,
            ..
        })
    ));
    assert_eq!(cluster.write_streams_opened(), 0);

    // The next call opens a stream normally.
    client.put("rejected", b"v".to_vec()).await.unwrap();
    assert_eq!(cluster.write_streams_opened(), 1);
    client.close().await;
}

#[tokio::test]
async fn unreachable_leader_fails_within_the_request_timeout() {
    let cluster = two_shard_cluster();
    let config = ClientConfig {
        request_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let client = connect(&cluster, config).await;
    cluster.fail_next_write_opens(u32::MAX, Code::Unavailable);
    cluster.fail_next_reads(u32::MAX, Code::Unavailable);

    let started = Instant::now();
    let err = client.put("k", b"v".to_vec()).await.unwrap_err();
    assert!(
        err.is_retriable() || matches!(err, ClientError::DeadlineExceeded { .. }),
        "unexpected error {err:?}"
    );
    let err = client.get("k").await.unwrap_err();
    assert!(err.is_retriable() || matches!(err, ClientError::DeadlineExceeded { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_move_opens_a_stream_to_the_new_leader() {
    let cluster = two_shard_cluster();
    let client = connect(&cluster, fast_config()).await;
    let key = key_on_shard(&cluster, 1, "moving");
    client.put(key.clone(), b"before".to_vec()).await.unwrap();
    assert_eq!(cluster.write_streams_opened(), 1);

    cluster.set_leader(1, "node-c");
    let (client_ref, cluster_ref, watched_key) = (&client, &cluster, key.clone());
    wait_until("write stream to the new leader", move || {
        let key = watched_key.clone();
        async move {
            client_ref.put(key, b"after".to_vec()).await.unwrap();
            cluster_ref.write_streams_opened() == 2
        }
    })
    .await;

    assert_eq!(client.get(key).await.unwrap().value, Some(b"after".to_vec()));
    client.close().await;
}

#[tokio::test]
async fn mid_stream_read_failure_is_retried_from_scratch() {
    let cluster = two_shard_cluster();
    let client = connect(&cluster, fast_config()).await;
    client.put("chunked", b"v".to_vec()).await.unwrap();

    cluster.set_read_chunk(1);
    cluster.fail_next_reads_mid_stream(1);
    let reads_before = cluster.read_calls();
    let response = client.get("chunked").await.unwrap();
    assert_eq!(response.value, Some(b"v".to_vec()));
    assert_eq!(cluster.read_calls() - reads_before, 2);
    client.close().await;
}

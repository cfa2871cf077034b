use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::retry::{with_retries, BackoffConfig};
use super::{BatchHandler, BatchKind, Call, DeleteCall, DeleteRangeCall, OpKind, PutCall};
use crate::error::ClientError;
use crate::executor::Executor;
use crate::metrics::{BatchRecord, CallRecord, MetricsSink};
use crate::model::{ShardId, WriteRequest, WriteResponse};

/// Executes write batches over the shard's multiplexed write stream.
pub struct WriteBatchHandler {
    executor: Arc<Executor>,
    request_timeout: Duration,
    backoff: BackoffConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl WriteBatchHandler {
    pub fn new(
        executor: Arc<Executor>,
        request_timeout: Duration,
        backoff: BackoffConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            executor,
            request_timeout,
            backoff,
            metrics,
        }
    }
}

#[async_trait]
impl BatchHandler for WriteBatchHandler {
    fn kind(&self) -> BatchKind {
        BatchKind::Write
    }

    fn call_size(&self, call: &Call) -> usize {
        call.payload_size()
    }

    /// Puts, then deletes, then delete-ranges: the order the server applies
    /// the lists of one `WriteRequest`.
    fn serial_rank(&self, call: &Call) -> u8 {
        match call {
            Call::Put(_) | Call::Get(_) => 0,
            Call::Delete(_) => 1,
            Call::DeleteRange(_) => 2,
        }
    }

    async fn execute(&self, shard: ShardId, calls: Vec<Call>) {
        let mut batch = WriteBatch::default();
        for call in calls {
            batch.push(call);
        }
        if batch.is_empty() {
            return;
        }

        let request = batch.request(shard);
        let execution_start = Instant::now();
        let result = with_retries("write", shard, self.request_timeout, self.backoff, || {
            self.executor.execute_write(request.clone())
        })
        .await;

        self.metrics.on_batch(&BatchRecord {
            kind: BatchKind::Write,
            shard,
            batch_start: batch.oldest_enqueue().unwrap_or(execution_start),
            execution_start,
            calls: batch.len(),
            value_bytes: request.value_bytes(),
            failed: result.is_err(),
        });

        match result {
            Ok(response) => batch.complete(shard, response, self.metrics.as_ref()),
            Err(err) => {
                tracing::debug!(shard, calls = batch.len(), error = %err, "write batch failed");
                batch.fail(err, self.metrics.as_ref());
            }
        }
    }
}

/// Calls of one write batch, grouped per operation type in arrival order.
#[derive(Default)]
struct WriteBatch {
    puts: Vec<PutCall>,
    deletes: Vec<DeleteCall>,
    delete_ranges: Vec<DeleteRangeCall>,
}

impl WriteBatch {
    fn push(&mut self, call: Call) {
        match call {
            Call::Put(call) => self.puts.push(call),
            Call::Delete(call) => self.deletes.push(call),
            Call::DeleteRange(call) => self.delete_ranges.push(call),
            other => {
                let err = ClientError::InvalidCall {
                    call: other.op().as_str(),
                    batcher: BatchKind::Write.as_str(),
                };
                other.fail(err);
            }
        }
    }

    fn len(&self) -> usize {
        self.puts.len() + self.deletes.len() + self.delete_ranges.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn oldest_enqueue(&self) -> Option<Instant> {
        self.puts
            .iter()
            .map(|c| c.enqueued_at)
            .chain(self.deletes.iter().map(|c| c.enqueued_at))
            .chain(self.delete_ranges.iter().map(|c| c.enqueued_at))
            .min()
    }

    fn request(&self, shard: ShardId) -> WriteRequest {
        WriteRequest {
            shard,
            puts: self.puts.iter().map(|c| c.request.clone()).collect(),
            deletes: self.deletes.iter().map(|c| c.request.clone()).collect(),
            delete_ranges: self.delete_ranges.iter().map(|c| c.request.clone()).collect(),
        }
    }

    /// Hand the i-th result of each type to the i-th call of that type.
    fn complete(self, shard: ShardId, response: WriteResponse, metrics: &dyn MetricsSink) {
        let mismatch = [
            ("put", self.puts.len(), response.puts.len()),
            ("delete", self.deletes.len(), response.deletes.len()),
            ("delete_range", self.delete_ranges.len(), response.delete_ranges.len()),
        ]
        .into_iter()
        .find(|(_, expected, got)| expected != got);
        if let Some((op, expected, got)) = mismatch {
            tracing::warn!(shard, op, expected, got, "write response count mismatch");
            self.fail(ClientError::ResponseMismatch { op, expected, got }, metrics);
            return;
        }

        for (call, result) in self.puts.into_iter().zip(response.puts) {
            record_call(metrics, OpKind::Put, call.enqueued_at, call.request.value.len(), false);
            let _ = call.callback.send(Ok(result));
        }
        for (call, result) in self.deletes.into_iter().zip(response.deletes) {
            record_call(metrics, OpKind::Delete, call.enqueued_at, 0, false);
            let _ = call.callback.send(Ok(result));
        }
        for (call, result) in self.delete_ranges.into_iter().zip(response.delete_ranges) {
            record_call(metrics, OpKind::DeleteRange, call.enqueued_at, 0, false);
            let _ = call.callback.send(Ok(result));
        }
    }

    fn fail(self, err: ClientError, metrics: &dyn MetricsSink) {
        for call in self.puts {
            record_call(metrics, OpKind::Put, call.enqueued_at, 0, true);
            let _ = call.callback.send(Err(err.clone()));
        }
        for call in self.deletes {
            record_call(metrics, OpKind::Delete, call.enqueued_at, 0, true);
            let _ = call.callback.send(Err(err.clone()));
        }
        for call in self.delete_ranges {
            record_call(metrics, OpKind::DeleteRange, call.enqueued_at, 0, true);
            let _ = call.callback.send(Err(err.clone()));
        }
    }
}

fn record_call(
    metrics: &dyn MetricsSink,
    op: OpKind,
    enqueued_at: Instant,
    value_bytes: usize,
    failed: bool,
) {
    metrics.on_call(&CallRecord {
        op,
        enqueued_at,
        value_bytes,
        failed,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ClientStats;
    use crate::model::{
        DeleteRangeRequest, DeleteRangeResponse, DeleteRequest, DeleteResponse, PutRequest,
        PutResponse, Status, Version,
    };

    fn version(id: i64) -> Option<Version> {
        Some(Version {
            version_id: id,
            modifications_count: 0,
            created_timestamp: 0,
            modified_timestamp: 0,
        })
    }

    fn mixed_batch() -> (
        WriteBatch,
        Vec<tokio::sync::oneshot::Receiver<crate::error::ClientResult<PutResponse>>>,
        tokio::sync::oneshot::Receiver<crate::error::ClientResult<DeleteResponse>>,
        tokio::sync::oneshot::Receiver<crate::error::ClientResult<DeleteRangeResponse>>,
    ) {
        let mut batch = WriteBatch::default();
        let mut puts = Vec::new();
        let (put_a, rx_a) = Call::put(PutRequest {
            key: "a".into(),
            value: b"1".to_vec(),
            expected_version_id: None,
        });
        let (delete, rx_delete) = Call::delete(DeleteRequest {
            key: "b".into(),
            expected_version_id: None,
        });
        let (put_c, rx_c) = Call::put(PutRequest {
            key: "c".into(),
            value: b"333".to_vec(),
            expected_version_id: Some(4),
        });
        let (range, rx_range) = Call::delete_range(DeleteRangeRequest {
            start_inclusive: "x".into(),
            end_exclusive: "y".into(),
        });
        // Rank order, as the batcher admits them.
        batch.push(put_a);
        batch.push(put_c);
        batch.push(delete);
        batch.push(range);
        puts.push(rx_a);
        puts.push(rx_c);
        (batch, puts, rx_delete, rx_range)
    }

    #[test]
    fn request_preserves_order_within_each_type() {
        let (batch, _puts, _delete, _range) = mixed_batch();
        let request = batch.request(5);
        assert_eq!(request.shard, 5);
        let keys: Vec<_> = request.puts.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(request.deletes[0].key, "b");
        assert_eq!(request.delete_ranges[0].start_inclusive, "x");
        assert_eq!(request.value_bytes(), 4);
    }

    #[tokio::test]
    async fn results_are_matched_positionally() {
        let (batch, puts, rx_delete, rx_range) = mixed_batch();
        let stats = ClientStats::new();
        let response = WriteResponse {
            puts: vec![
                PutResponse {
                    status: Status::Ok,
                    version: version(10),
                },
                PutResponse {
                    status: Status::UnexpectedVersionId,
                    version: None,
                },
            ],
            deletes: vec![DeleteResponse {
                status: Status::KeyNotFound,
            }],
            delete_ranges: vec![DeleteRangeResponse { status: Status::Ok }],
        };
        batch.complete(5, response, &stats);

        let mut puts = puts.into_iter();
        let first = puts.next().unwrap().await.unwrap().unwrap();
        assert_eq!(first.version, version(10));
        let second = puts.next().unwrap().await.unwrap().unwrap();
        assert_eq!(second.status, Status::UnexpectedVersionId);
        assert_eq!(rx_delete.await.unwrap().unwrap().status, Status::KeyNotFound);
        assert_eq!(rx_range.await.unwrap().unwrap().status, Status::Ok);

        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.ops["put"].completed, 2);
        assert_eq!(snapshot.ops["put"].value_bytes, 4);
        assert_eq!(snapshot.ops["delete"].errors, 0);
    }

    #[tokio::test]
    async fn count_mismatch_fails_every_call() {
        let (batch, puts, rx_delete, rx_range) = mixed_batch();
        let response = WriteResponse {
            puts: vec![PutResponse {
                status: Status::Ok,
                version: None,
            }],
            deletes: vec![DeleteResponse { status: Status::Ok }],
            delete_ranges: vec![DeleteRangeResponse { status: Status::Ok }],
        };
        batch.complete(5, response, &ClientStats::new());

        let expected = ClientError::ResponseMismatch {
            op: "put",
            expected: 2,
            got: 1,
        };
        for rx in puts {
            assert_eq!(rx.await.unwrap(), Err(expected.clone()));
        }
        assert_eq!(rx_delete.await.unwrap(), Err(expected.clone()));
        assert_eq!(rx_range.await.unwrap(), Err(expected));
    }

    #[tokio::test]
    async fn batch_error_reaches_every_call() {
        let (batch, puts, rx_delete, rx_range) = mixed_batch();
        let stats = ClientStats::new();
        batch.fail(ClientError::StreamClosed, &stats);
        for rx in puts {
            assert_eq!(rx.await.unwrap(), Err(ClientError::StreamClosed));
        }
        assert_eq!(rx_delete.await.unwrap(), Err(ClientError::StreamClosed));
        assert_eq!(rx_range.await.unwrap(), Err(ClientError::StreamClosed));
        assert_eq!(stats.snapshot_and_reset().ops["put"].errors, 2);
    }

    #[tokio::test]
    async fn read_call_in_write_batch_is_rejected() {
        let mut batch = WriteBatch::default();
        let (get, rx) = Call::get(crate::model::GetRequest {
            key: "k".into(),
            include_value: false,
        });
        batch.push(get);
        assert!(batch.is_empty());
        assert!(matches!(
            rx.await.unwrap(),
            Err(ClientError::InvalidCall { call: "get", .. })
        ));
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;

use super::retry::{with_retries, BackoffConfig};
use super::{BatchHandler, BatchKind, Call, GetCall, OpKind};
use crate::error::{ClientError, ClientResult};
use crate::executor::Executor;
use crate::metrics::{BatchRecord, CallRecord, MetricsSink};
use crate::model::{GetResponse, ReadRequest, ShardId};

/// Executes read batches as one server-streamed read per attempt.
pub struct ReadBatchHandler {
    executor: Arc<Executor>,
    request_timeout: Duration,
    backoff: BackoffConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl ReadBatchHandler {
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

    /// Issue the read and drain every chunk. A failure mid-stream discards the
    /// partial results; the retry starts a fresh stream.
    async fn read_all(&self, request: ReadRequest) -> ClientResult<Vec<GetResponse>> {
        let expected = request.gets.len();
        let mut stream = self.executor.execute_read(request).await?;
        let mut gets = Vec::with_capacity(expected);
        while let Some(chunk) = stream.next().await {
            gets.extend(chunk?.gets);
        }
        Ok(gets)
    }
}

#[async_trait]
impl BatchHandler for ReadBatchHandler {
    fn kind(&self) -> BatchKind {
        BatchKind::Read
    }

    async fn execute(&self, shard: ShardId, calls: Vec<Call>) {
        let mut gets: Vec<GetCall> = Vec::with_capacity(calls.len());
        for call in calls {
            match call {
                Call::Get(call) => gets.push(call),
                other => {
                    let err = ClientError::InvalidCall {
                        call: other.op().as_str(),
                        batcher: BatchKind::Read.as_str(),
                    };
                    other.fail(err);
                }
            }
        }
        if gets.is_empty() {
            return;
        }

        let request = ReadRequest {
            shard,
            gets: gets.iter().map(|c| c.request.clone()).collect(),
        };
        let execution_start = Instant::now();
        let result = with_retries("read", shard, self.request_timeout, self.backoff, || {
            self.read_all(request.clone())
        })
        .await
        .and_then(|responses| {
            if responses.len() == gets.len() {
                Ok(responses)
            } else {
                Err(ClientError::ResponseMismatch {
                    op: "get",
                    expected: gets.len(),
                    got: responses.len(),
                })
            }
        });

        let batch_start = gets
            .iter()
            .map(|c| c.enqueued_at)
            .min()
            .unwrap_or(execution_start);
        let value_bytes = match &result {
            Ok(responses) => responses
                .iter()
                .map(|r| r.value.as_ref().map_or(0, Vec::len))
                .sum(),
            Err(_) => 0,
        };
        self.metrics.on_batch(&BatchRecord {
            kind: BatchKind::Read,
            shard,
            batch_start,
            execution_start,
            calls: gets.len(),
            value_bytes,
            failed: result.is_err(),
        });

        match result {
            Ok(responses) => {
                for (call, response) in gets.into_iter().zip(responses) {
                    self.metrics.on_call(&CallRecord {
                        op: OpKind::Get,
                        enqueued_at: call.enqueued_at,
                        value_bytes: response.value.as_ref().map_or(0, Vec::len),
                        failed: false,
                    });
                    let _ = call.callback.send(Ok(response));
                }
            }
            Err(err) => {
                if matches!(err, ClientError::ResponseMismatch { .. }) {
                    tracing::warn!(shard, error = %err, "read response count mismatch");
                } else {
                    tracing::debug!(shard, calls = gets.len(), error = %err, "read batch failed");
                }
                for call in gets {
                    self.metrics.on_call(&CallRecord {
                        op: OpKind::Get,
                        enqueued_at: call.enqueued_at,
                        value_bytes: 0,
                        failed: true,
                    });
                    let _ = call.callback.send(Err(err.clone()));
                }
            }
        }
    }
}

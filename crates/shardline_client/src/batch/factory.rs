use std::sync::Arc;

use super::{BatchKind, Batcher, BatcherConfig, ReadBatchHandler, WriteBatchHandler};
use crate::config::ClientConfig;
use crate::executor::Executor;
use crate::metrics::MetricsSink;
use crate::model::ShardId;

/// Builds batchers wired to the shared executor and metrics sink.
#[derive(Clone)]
pub struct BatcherFactory {
    executor: Arc<Executor>,
    metrics: Arc<dyn MetricsSink>,
    config: ClientConfig,
}

impl BatcherFactory {
    pub fn new(executor: Arc<Executor>, config: ClientConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            executor,
            metrics,
            config,
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn spawn(&self, kind: BatchKind, shard: ShardId) -> Batcher {
        match kind {
            BatchKind::Write => {
                let handler = WriteBatchHandler::new(
                    self.executor.clone(),
                    self.config.request_timeout,
                    self.config.backoff(),
                    self.metrics.clone(),
                );
                let config = BatcherConfig {
                    linger: self.config.batch_linger,
                    max_calls: self.config.max_requests_per_batch,
                    max_bytes: Some(self.config.max_write_batch_bytes),
                };
                Batcher::spawn(shard, Arc::new(handler), config)
            }
            BatchKind::Read => {
                let handler = ReadBatchHandler::new(
                    self.executor.clone(),
                    self.config.request_timeout,
                    self.config.backoff(),
                    self.metrics.clone(),
                );
                let config = BatcherConfig {
                    linger: self.config.batch_linger,
                    max_calls: self.config.max_requests_per_batch,
                    max_bytes: None,
                };
                Batcher::spawn(shard, Arc::new(handler), config)
            }
        }
    }
}

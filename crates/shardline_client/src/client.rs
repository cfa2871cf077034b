//! Public client facade.
//!
//! A `Client` owns every piece of per-connection state (topology, batchers,
//! write streams) and is torn down explicitly with `close`.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::batch::{BatcherFactory, Call};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::executor::Executor;
use crate::hashing::ShardStrategy;
use crate::metrics::{ClientStats, MetricsSink};
use crate::model::{
    DeleteRangeRequest, DeleteRequest, DeleteResponse, GetRequest, GetResponse, PutRequest,
    PutResponse, ShardId, Status,
};
use crate::shard_manager::{ShardManager, Topology};
use crate::transport::{TopologySource, Transport};

pub struct Client {
    shard_manager: Arc<ShardManager>,
    stats: Option<Arc<ClientStats>>,
}

impl Client {
    /// Connect with an in-memory `ClientStats` sink, available via `stats()`.
    pub async fn connect(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        topology_source: Arc<dyn TopologySource>,
    ) -> ClientResult<Self> {
        let stats = Arc::new(ClientStats::new());
        let mut client =
            Self::connect_with_metrics(config, transport, topology_source, stats.clone()).await?;
        client.stats = Some(stats);
        Ok(client)
    }

    /// Connect, reporting batch and call metrics to `metrics`.
    ///
    /// Returns once the first shard assignment has arrived, or fails with
    /// `TopologyUnavailable` after the request timeout.
    pub async fn connect_with_metrics(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        topology_source: Arc<dyn TopologySource>,
        metrics: Arc<dyn MetricsSink>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let topology = Arc::new(Topology::new());
        let executor = Arc::new(Executor::new(transport, topology.clone()));
        let factory = BatcherFactory::new(executor, config.clone(), metrics);
        let shard_manager = Arc::new(ShardManager::new(
            ShardStrategy::default(),
            topology,
            factory,
        ));

        if let Err(err) = shard_manager
            .start(
                topology_source,
                config.namespace.clone(),
                config.backoff(),
                config.request_timeout,
            )
            .await
        {
            shard_manager.close().await;
            return Err(err);
        }
        tracing::debug!(namespace = %config.namespace, "client connected");

        Ok(Self {
            shard_manager,
            stats: None,
        })
    }

    pub fn stats(&self) -> Option<&Arc<ClientStats>> {
        self.stats.as_ref()
    }

    /// Shard currently owning `key`.
    pub fn shard_for_key(&self, key: &str) -> ClientResult<ShardId> {
        self.shard_manager.get(key)
    }

    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> ClientResult<PutResponse> {
        self.put_with(PutRequest {
            key: key.into(),
            value: value.into(),
            expected_version_id: None,
        })
        .await
    }

    /// Put with the full request, e.g. a conditional put.
    pub async fn put_with(&self, request: PutRequest) -> ClientResult<PutResponse> {
        let shard = self.shard_manager.get(&request.key)?;
        let (call, rx) = Call::put(request);
        self.submit_write(shard, call, rx).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> ClientResult<DeleteResponse> {
        self.delete_with(DeleteRequest {
            key: key.into(),
            expected_version_id: None,
        })
        .await
    }

    pub async fn delete_with(&self, request: DeleteRequest) -> ClientResult<DeleteResponse> {
        let shard = self.shard_manager.get(&request.key)?;
        let (call, rx) = Call::delete(request);
        self.submit_write(shard, call, rx).await
    }

    /// Delete every key in `[start_inclusive, end_exclusive)`.
    ///
    /// Keys are hash-partitioned, so the range is applied on every shard; the
    /// first failing shard's error is returned.
    pub async fn delete_range(
        &self,
        start_inclusive: impl Into<String>,
        end_exclusive: impl Into<String>,
    ) -> ClientResult<()> {
        let request = DeleteRangeRequest {
            start_inclusive: start_inclusive.into(),
            end_exclusive: end_exclusive.into(),
        };

        let mut pending = Vec::new();
        for shard in self.shard_manager.shard_ids()? {
            let (call, rx) = Call::delete_range(request.clone());
            self.shard_manager.write_batcher(shard)?.add(call)?;
            pending.push(rx);
        }

        let mut first_err = None;
        for rx in pending {
            let result = rx.await.unwrap_or(Err(ClientError::Closed));
            match result {
                Ok(response) if response.status == Status::Ok => {}
                Ok(response) => {
                    tracing::debug!(status = ?response.status, "delete range returned non-ok status");
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn get(&self, key: impl Into<String>) -> ClientResult<GetResponse> {
        self.get_with(GetRequest {
            key: key.into(),
            include_value: true,
        })
        .await
    }

    pub async fn get_with(&self, request: GetRequest) -> ClientResult<GetResponse> {
        let shard = self.shard_manager.get(&request.key)?;
        let (call, rx) = Call::get(request);
        self.shard_manager.read_batcher(shard)?.add(call)?;
        rx.await.unwrap_or(Err(ClientError::Closed))
    }

    /// Fail queued calls, close every write stream, and stop following the
    /// topology. Later operations fail with `Closed`.
    pub async fn close(&self) {
        self.shard_manager.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shard_manager.is_closed()
    }

    async fn submit_write<T>(
        &self,
        shard: ShardId,
        call: Call,
        rx: oneshot::Receiver<ClientResult<T>>,
    ) -> ClientResult<T> {
        self.shard_manager.write_batcher(shard)?.add(call)?;
        rx.await.unwrap_or(Err(ClientError::Closed))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .finish()
    }
}

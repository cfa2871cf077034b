//! Leader resolution and the per-shard write-stream registry.
//!
//! Batch handlers hand fully built requests to the executor. Writes go over the
//! shard's long-lived multiplexed stream, reopened on demand when it failed or
//! the shard moved to a new leader; reads open a fresh server stream each time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ClientError, ClientResult, RoutingError};
use crate::model::{ReadRequest, ShardId, WriteRequest, WriteResponse};
use crate::shard_manager::Topology;
use crate::transport::{ReadStream, Transport};
use crate::write_stream::WriteStream;

pub struct Executor {
    transport: Arc<dyn Transport>,
    topology: Arc<Topology>,
    write_streams: Mutex<HashMap<ShardId, Arc<WriteStream>>>,
    closed: AtomicBool,
}

impl Executor {
    pub fn new(transport: Arc<dyn Transport>, topology: Arc<Topology>) -> Self {
        Self {
            transport,
            topology,
            write_streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Send one write batch on the shard's stream and wait for its response.
    pub async fn execute_write(&self, request: WriteRequest) -> ClientResult<WriteResponse> {
        let stream = self.write_stream(request.shard).await?;
        stream.send(request).await
    }

    /// Open a server-streamed read against the shard's current leader.
    pub async fn execute_read(&self, request: ReadRequest) -> ClientResult<ReadStream> {
        self.ensure_open()?;
        let leader = self.leader(request.shard)?;
        Ok(self.transport.read(&leader, request).await?)
    }

    /// Forget the stream of a shard that left the topology. An in-flight send
    /// keeps its own reference and completes normally.
    pub fn retire_shard(&self, shard: ShardId) {
        if self.write_streams.lock().remove(&shard).is_some() {
            tracing::debug!(shard, "write stream retired");
        }
    }

    /// Terminate every write stream; pending sends fail with `StreamClosed`
    /// and later requests fail with `Closed`.
    pub fn close(&self) {
        let streams: Vec<_> = {
            let mut registry = self.write_streams.lock();
            self.closed.store(true, Ordering::Release);
            registry.drain().collect()
        };
        for (_, stream) in streams {
            stream.close();
        }
    }

    pub fn open_write_streams(&self) -> usize {
        self.write_streams.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    fn leader(&self, shard: ShardId) -> ClientResult<String> {
        self.topology
            .leader(shard)
            .ok_or_else(|| RoutingError::UnknownShard(shard).into())
    }

    async fn write_stream(&self, shard: ShardId) -> ClientResult<Arc<WriteStream>> {
        self.ensure_open()?;
        let leader = self.leader(shard)?;
        {
            let mut streams = self.write_streams.lock();
            self.ensure_open()?;
            if let Some(stream) = streams.get(&shard) {
                if !stream.is_failed() && stream.leader() == leader {
                    return Ok(stream.clone());
                }
                tracing::debug!(
                    shard,
                    old_leader = stream.leader(),
                    new_leader = %leader,
                    failed = stream.is_failed(),
                    "replacing write stream"
                );
                stream.close();
                streams.remove(&shard);
            }
        }

        // Opening happens outside the lock; each shard has a single executing
        // batcher, so there is no competing open for the same shard.
        let handle = self.transport.open_write_stream(&leader, shard).await?;
        let stream = Arc::new(WriteStream::open(shard, leader.clone(), handle));
        tracing::debug!(shard, leader = %leader, "write stream opened");

        let mut streams = self.write_streams.lock();
        // Checked under the registry lock so close() cannot miss this stream.
        if self.is_closed() {
            drop(streams);
            stream.close();
            return Err(ClientError::Closed);
        }
        match streams.get(&shard) {
            Some(existing) if !existing.is_failed() && existing.leader() == leader => {
                Ok(existing.clone())
            }
            _ => {
                streams.insert(shard, stream.clone());
                Ok(stream)
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("write_streams", &self.open_write_streams())
            .finish()
    }
}

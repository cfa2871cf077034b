//! Interfaces to the collaborators the pipeline depends on.
//!
//! The pipeline is transport-agnostic: connection pooling, TLS, and auth live
//! behind `Transport`, and shard assignments arrive through `TopologySource`.
//! `crate::local::LocalCluster` implements both for tests and load generation.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::model::{ReadRequest, ReadResponse, Shard, ShardId, WriteRequest, WriteResponse};

/// Server-streamed read response chunks; ends normally at end-of-stream.
pub type ReadStream = BoxStream<'static, Result<ReadResponse, TransportError>>;

/// Ordered responses of a bidirectional write stream.
pub type WriteResponses = BoxStream<'static, Result<WriteResponse, TransportError>>;

/// Stream of shard assignment snapshots for one namespace.
pub type AssignmentStream = BoxStream<'static, Result<Vec<Shard>, TransportError>>;

/// Sending half of a bidirectional write stream.
#[async_trait]
pub trait WriteSink: Send + Sync + 'static {
    async fn send(&self, request: WriteRequest) -> Result<(), TransportError>;
}

/// An open bidirectional write stream to one shard leader.
pub struct WriteStreamHandle {
    pub sink: Box<dyn WriteSink>,
    pub responses: WriteResponses,
    /// Stream context: cancelled when the stream terminates, from either side.
    pub context: CancellationToken,
}

impl std::fmt::Debug for WriteStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStreamHandle")
            .field("cancelled", &self.context.is_cancelled())
            .finish()
    }
}

/// RPC transport to shard leaders.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a long-lived write stream to `leader` for `shard`.
    async fn open_write_stream(
        &self,
        leader: &str,
        shard: ShardId,
    ) -> Result<WriteStreamHandle, TransportError>;

    /// Issue a server-streamed read against `leader`.
    async fn read(
        &self,
        leader: &str,
        request: ReadRequest,
    ) -> Result<ReadStream, TransportError>;
}

/// Source of shard assignments (the cluster metadata service).
#[async_trait]
pub trait TopologySource: Send + Sync + 'static {
    /// Subscribe to assignment snapshots for `namespace`. Each item replaces or
    /// extends the previous view; the stream ends when the source shuts down.
    async fn subscribe(&self, namespace: &str) -> Result<AssignmentStream, TransportError>;
}

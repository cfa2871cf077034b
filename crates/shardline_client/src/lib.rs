//! Client-side request pipeline for a hash-partitioned key/value store.
//!
//! Keys hash to shards; operations for the same shard are coalesced into
//! batches; write batches travel over one multiplexed stream per shard leader
//! and read batches over server-streamed reads. Callers supply a `Transport`
//! and a `TopologySource`, then drive operations through `Client`.

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod hashing;
pub mod local;
pub mod metrics;
pub mod model;
pub mod shard_manager;
pub mod transport;
pub mod write_stream;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult, Code, RoutingError, TransportError};
pub use local::LocalCluster;
pub use metrics::{ClientStats, ClientStatsSnapshot, MetricsSink, NoopMetrics};
pub use model::{HashRange, Shard, ShardId, Status};

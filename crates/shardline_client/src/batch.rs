//! Per-shard batching.
//!
//! Module wiring:
//! - `call`: caller operations queued for a shard, each with its completion
//!   channel.
//! - `batcher`: the accumulate/flush engine shared by reads and writes.
//! - `write` / `read`: handlers turning a flushed batch into one wire request
//!   and fanning results back out positionally.
//! - `retry`: deadline-bounded retry with jittered exponential backoff.
//! - `factory`: builds the right batcher for a shard and kind.

mod batcher;
mod call;
mod factory;
mod read;
mod retry;
mod write;

pub use batcher::{BatchHandler, Batcher, BatcherConfig};
pub use call::{
    Call, Callback, DeleteCall, DeleteRangeCall, GetCall, OpKind, PutCall,
};
pub use factory::BatcherFactory;
pub use read::ReadBatchHandler;
pub use retry::{Backoff, BackoffConfig};
pub use write::WriteBatchHandler;

/// The two batch flavours; a batcher only accepts calls of its own kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Read,
    Write,
}

impl BatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchKind::Read => "read",
            BatchKind::Write => "write",
        }
    }
}

//! Error taxonomy for the client pipeline.
//!
//! Transport failures carry a status `Code`; `Code::is_retriable` is the single
//! classification used by batch execution to decide between a backoff retry and
//! an immediate, terminal failure.

use std::time::Duration;

use thiserror::Error;

use crate::model::ShardId;

pub type ClientResult<T> = Result<T, ClientError>;

/// Status codes that can cross the transport boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// Connection could not be established or was dropped.
    Unavailable,
    /// The leader fenced the shard for a new term.
    Fenced,
    /// The leader is shutting down.
    AlreadyClosed,
    /// The node is no longer the shard leader.
    NotLeader,
    InvalidArgument,
    NotFound,
    DeadlineExceeded,
    Cancelled,
    Internal,
    Unknown,
}

impl Code {
    /// Transient conditions where a new leader is expected to take over.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Code::Unavailable | Code::Fenced | Code::AlreadyClosed | Code::NotLeader
        )
    }
}

/// Failure reported by the transport or the remote shard leader.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code:?}: {message}")]
pub struct TransportError {
    pub code: Code,
    pub message: String,
}

impl TransportError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}

/// Key-to-shard resolution failures. Always fatal to the affected call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("shard topology is empty")]
    EmptyTopology,

    #[error("no shard owns key {key:?} (hash {hash:#010x})")]
    NoShard { key: String, hash: u32 },

    #[error("key {key:?} (hash {hash:#010x}) matches multiple shards {shards:?}")]
    MultipleShards {
        key: String,
        hash: u32,
        shards: Vec<ShardId>,
    },

    #[error("shard {0} is not in the current topology")]
    UnknownShard(ShardId),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("client is closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Synthetic failure for requests still pending when a write stream ends.
    #[error("write stream closed")]
    StreamClosed,

    #[error("request deadline of {timeout:?} exceeded")]
    DeadlineExceeded { timeout: Duration },

    #[error("{call} call submitted to {batcher} batcher")]
    InvalidCall {
        call: &'static str,
        batcher: &'static str,
    },

    #[error("{op} response count mismatch (expected {expected}, got {got})")]
    ResponseMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("no shard assignments received within {0:?}")]
    TopologyUnavailable(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Only transport failures with a transient status code are retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Transport(err) => err.is_retriable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_retriable() {
        for code in [
            Code::Unavailable,
            Code::Fenced,
            Code::AlreadyClosed,
            Code::NotLeader,
        ] {
            let err = ClientError::from(TransportError::new(code, "boom"));
            assert!(err.is_retriable(), "{code:?} should be retriable");
        }
    }

    #[test]
    fn other_errors_are_terminal() {
        for code in [
            Code::InvalidArgument,
            Code::NotFound,
            Code::DeadlineExceeded,
            Code::Cancelled,
            Code::Internal,
            Code::Unknown,
        ] {
            let err = ClientError::from(TransportError::new(code, "boom"));
            assert!(!err.is_retriable(), "{code:?} should be terminal");
        }
        assert!(!ClientError::StreamClosed.is_retriable());
        assert!(!ClientError::Closed.is_retriable());
        assert!(!ClientError::from(RoutingError::EmptyTopology).is_retriable());
    }
}

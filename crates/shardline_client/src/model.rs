//! Wire-level data model shared by routing, batching, and the transport seam.
//!
//! Only the fields the client pipeline needs are modelled here: shard identity,
//! per-operation payloads, and the positional result lists returned by a shard
//! leader for a batched request.

use serde::{Deserialize, Serialize};

/// Logical shard identifier assigned by the cluster.
pub type ShardId = i64;

/// Expected version id that only matches a key with no stored record.
pub const EXPECTED_RECORD_DOES_NOT_EXIST: i64 = -1;

/// Inclusive `[min, max]` interval of the 32-bit hash space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRange {
    pub min_inclusive: u32,
    pub max_inclusive: u32,
}

impl HashRange {
    pub const fn new(min_inclusive: u32, max_inclusive: u32) -> Self {
        Self {
            min_inclusive,
            max_inclusive,
        }
    }

    /// The whole 32-bit space.
    pub const fn full() -> Self {
        Self::new(0, u32::MAX)
    }

    pub fn contains(&self, code: u32) -> bool {
        self.min_inclusive <= code && code <= self.max_inclusive
    }

    /// Two inclusive ranges overlap when each starts at or before the other's end.
    pub fn overlaps(&self, other: &HashRange) -> bool {
        self.min_inclusive <= other.max_inclusive && other.min_inclusive <= self.max_inclusive
    }

    /// Split the 32-bit space into `count` contiguous, non-overlapping ranges.
    pub fn split_even(count: u32) -> Vec<HashRange> {
        let count = count.max(1) as u64;
        let span = (u32::MAX as u64 + 1) / count;
        (0..count)
            .map(|i| {
                let min = i * span;
                let max = if i + 1 == count {
                    u32::MAX as u64
                } else {
                    (i + 1) * span - 1
                };
                HashRange::new(min as u32, max as u32)
            })
            .collect()
    }
}

/// Shard assignment: id, current leader address, and owned hash range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub leader: String,
    pub hash_range: HashRange,
}

/// Per-operation outcome reported by the shard leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    KeyNotFound,
    UnexpectedVersionId,
}

/// Version metadata for a stored record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: i64,
    pub modifications_count: i64,
    pub created_timestamp: u64,
    pub modified_timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutRequest {
    pub key: String,
    pub value: Vec<u8>,
    /// Conditional put: only applied when the stored version matches.
    pub expected_version_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResponse {
    pub status: Status,
    pub version: Option<Version>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: String,
    pub expected_version_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteResponse {
    pub status: Status,
}

/// Delete every key in `[start_inclusive, end_exclusive)` on one shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRangeRequest {
    pub start_inclusive: String,
    pub end_exclusive: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRangeResponse {
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetRequest {
    pub key: String,
    pub include_value: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetResponse {
    pub status: Status,
    pub value: Option<Vec<u8>>,
    pub version: Option<Version>,
}

/// One batched write sent on a shard's write stream.
///
/// Results come back in three positional lists, one per operation type, each
/// in the same order as the corresponding request list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteRequest {
    pub shard: ShardId,
    pub puts: Vec<PutRequest>,
    pub deletes: Vec<DeleteRequest>,
    pub delete_ranges: Vec<DeleteRangeRequest>,
}

impl WriteRequest {
    pub fn len(&self) -> usize {
        self.puts.len() + self.deletes.len() + self.delete_ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total value bytes carried by the puts in this request.
    pub fn value_bytes(&self) -> usize {
        self.puts.iter().map(|put| put.value.len()).sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteResponse {
    pub puts: Vec<PutResponse>,
    pub deletes: Vec<DeleteResponse>,
    pub delete_ranges: Vec<DeleteRangeResponse>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadRequest {
    pub shard: ShardId,
    pub gets: Vec<GetRequest>,
}

/// One chunk of a server-streamed read; chunks concatenate positionally.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadResponse {
    pub gets: Vec<GetResponse>,
}

impl ReadResponse {
    pub fn value_bytes(&self) -> usize {
        self.gets
            .iter()
            .map(|get| get.value.as_ref().map_or(0, Vec::len))
            .sum()
    }
}

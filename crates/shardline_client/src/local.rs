//! In-process cluster.
//!
//! `LocalCluster` plays both the shard leaders and the metadata service: it
//! implements `Transport` and `TopologySource` over an in-memory versioned
//! store per shard. Faults can be injected per operation so tests and the
//! workload tool can exercise retries, stream recovery, and leader moves.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Code, TransportError};
use crate::hashing::xxh332;
use crate::model::{
    DeleteRangeResponse, DeleteResponse, GetRequest, GetResponse, HashRange, PutResponse,
    ReadRequest, ReadResponse, Shard, ShardId, Status, Version, WriteRequest, WriteResponse,
    EXPECTED_RECORD_DOES_NOT_EXIST,
};
use crate::transport::{
    AssignmentStream, ReadStream, TopologySource, Transport, WriteSink, WriteStreamHandle,
};

const DEFAULT_READ_CHUNK: usize = 16;

#[derive(Clone, Debug)]
struct Record {
    value: Vec<u8>,
    version: Version,
}

/// Remaining injected failures for one operation.
#[derive(Clone, Copy, Debug)]
struct FaultBudget {
    remaining: u32,
    code: Code,
}

fn take_fault(budget: &mut Option<FaultBudget>) -> Option<Code> {
    let fault = budget.as_mut()?;
    let code = fault.code;
    fault.remaining = fault.remaining.saturating_sub(1);
    if fault.remaining == 0 {
        *budget = None;
    }
    Some(code)
}

#[derive(Default)]
struct ClusterState {
    stores: HashMap<ShardId, BTreeMap<String, Record>>,
    write_streams: HashMap<ShardId, Vec<CancellationToken>>,
    open_faults: Option<FaultBudget>,
    read_faults: Option<FaultBudget>,
    subscribe_faults: Option<FaultBudget>,
    mid_stream_read_faults: u32,
    read_chunk: Option<usize>,
    write_delay: Duration,
}

struct ClusterInner {
    assignments: watch::Sender<Vec<Shard>>,
    state: Mutex<ClusterState>,
    next_version: AtomicI64,
    write_streams_opened: AtomicU64,
    write_requests: AtomicU64,
    read_calls: AtomicU64,
}

/// In-memory cluster; clones share state.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl LocalCluster {
    /// `count` shards evenly splitting the hash space, ids `0..count`.
    pub fn new(count: u32) -> Self {
        let shards = HashRange::split_even(count)
            .into_iter()
            .enumerate()
            .map(|(i, hash_range)| Shard {
                id: i as ShardId,
                leader: format!("local-{i}"),
                hash_range,
            })
            .collect();
        Self::with_shards(shards)
    }

    pub fn with_shards(shards: Vec<Shard>) -> Self {
        let (assignments, _) = watch::channel(shards);
        Self {
            inner: Arc::new(ClusterInner {
                assignments,
                state: Mutex::new(ClusterState::default()),
                next_version: AtomicI64::new(0),
                write_streams_opened: AtomicU64::new(0),
                write_requests: AtomicU64::new(0),
                read_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn shards(&self) -> Vec<Shard> {
        self.inner.assignments.borrow().clone()
    }

    /// Publish a new assignment to every subscriber.
    pub fn set_shards(&self, shards: Vec<Shard>) {
        self.inner.assignments.send_replace(shards);
    }

    /// Move `shard` to a new leader and publish the change.
    pub fn set_leader(&self, shard: ShardId, leader: impl Into<String>) {
        let leader = leader.into();
        self.inner.assignments.send_modify(|shards| {
            for assigned in shards.iter_mut().filter(|s| s.id == shard) {
                assigned.leader = leader.clone();
            }
        });
    }

    /// Shard owning `key` under the current assignment.
    pub fn shard_for_key(&self, key: &str) -> Option<ShardId> {
        let code = xxh332(key);
        self.inner
            .assignments
            .borrow()
            .iter()
            .find(|shard| shard.hash_range.contains(code))
            .map(|shard| shard.id)
    }

    pub fn keys_on_shard(&self, shard: ShardId) -> Vec<String> {
        self.inner
            .state
            .lock()
            .stores
            .get(&shard)
            .map(|store| store.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn fail_next_write_opens(&self, count: u32, code: Code) {
        self.inner.state.lock().open_faults = budget(count, code);
    }

    pub fn fail_next_reads(&self, count: u32, code: Code) {
        self.inner.state.lock().read_faults = budget(count, code);
    }

    /// The next `count` reads deliver their first chunk and then fail.
    pub fn fail_next_reads_mid_stream(&self, count: u32) {
        self.inner.state.lock().mid_stream_read_faults = count;
    }

    pub fn fail_next_subscribes(&self, count: u32, code: Code) {
        self.inner.state.lock().subscribe_faults = budget(count, code);
    }

    /// Number of get results per read response chunk.
    pub fn set_read_chunk(&self, gets_per_chunk: usize) {
        self.inner.state.lock().read_chunk = Some(gets_per_chunk.max(1));
    }

    /// Delay applied before answering each write request.
    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.state.lock().write_delay = delay;
    }

    /// End every open write stream of `shard` from the server side.
    pub fn terminate_write_streams(&self, shard: ShardId) -> usize {
        let tokens = self
            .inner
            .state
            .lock()
            .write_streams
            .remove(&shard)
            .unwrap_or_default();
        let live = tokens.iter().filter(|t| !t.is_cancelled()).count();
        for token in tokens {
            token.cancel();
        }
        tracing::debug!(shard, live, "terminated write streams");
        live
    }

    pub fn write_streams_opened(&self) -> u64 {
        self.inner.write_streams_opened.load(Ordering::Relaxed)
    }

    pub fn write_requests(&self) -> u64 {
        self.inner.write_requests.load(Ordering::Relaxed)
    }

    pub fn read_calls(&self) -> u64 {
        self.inner.read_calls.load(Ordering::Relaxed)
    }

    fn check_leader(&self, leader: &str, shard: ShardId) -> Result<(), TransportError> {
        let assignments = self.inner.assignments.borrow();
        match assignments.iter().find(|s| s.id == shard) {
            None => Err(TransportError::new(
                Code::NotFound,
                format!("shard {shard} does not exist"),
            )),
            Some(assigned) if assigned.leader != leader => Err(TransportError::new(
                Code::NotLeader,
                format!("{leader} is not the leader of shard {shard}"),
            )),
            Some(_) => Ok(()),
        }
    }
}

fn budget(count: u32, code: Code) -> Option<FaultBudget> {
    (count > 0).then_some(FaultBudget {
        remaining: count,
        code,
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl ClusterInner {
    fn apply_write(&self, shard: ShardId, request: &WriteRequest) -> WriteResponse {
        let mut state = self.state.lock();
        let store = state.stores.entry(shard).or_default();
        let mut response = WriteResponse::default();

        for put in &request.puts {
            let existing = store.get(&put.key);
            if !version_matches(existing, put.expected_version_id) {
                response.puts.push(PutResponse {
                    status: Status::UnexpectedVersionId,
                    version: None,
                });
                continue;
            }
            let now = now_millis();
            let version_id = self.next_version.fetch_add(1, Ordering::Relaxed);
            let version = match existing {
                Some(record) => Version {
                    version_id,
                    modifications_count: record.version.modifications_count + 1,
                    created_timestamp: record.version.created_timestamp,
                    modified_timestamp: now,
                },
                None => Version {
                    version_id,
                    modifications_count: 0,
                    created_timestamp: now,
                    modified_timestamp: now,
                },
            };
            store.insert(
                put.key.clone(),
                Record {
                    value: put.value.clone(),
                    version,
                },
            );
            response.puts.push(PutResponse {
                status: Status::Ok,
                version: Some(version),
            });
        }

        for delete in &request.deletes {
            let existing = store.get(&delete.key);
            let status = if existing.is_none() {
                Status::KeyNotFound
            } else if !version_matches(existing, delete.expected_version_id) {
                Status::UnexpectedVersionId
            } else {
                store.remove(&delete.key);
                Status::Ok
            };
            response.deletes.push(DeleteResponse { status });
        }

        for range in &request.delete_ranges {
            store.retain(|key, _| {
                key.as_str() < range.start_inclusive.as_str()
                    || key.as_str() >= range.end_exclusive.as_str()
            });
            response
                .delete_ranges
                .push(DeleteRangeResponse { status: Status::Ok });
        }

        response
    }

    fn apply_reads(&self, shard: ShardId, gets: &[GetRequest]) -> Vec<GetResponse> {
        let state = self.state.lock();
        let store = state.stores.get(&shard);
        gets.iter()
            .map(|get| match store.and_then(|s| s.get(&get.key)) {
                Some(record) => GetResponse {
                    status: Status::Ok,
                    value: get.include_value.then(|| record.value.clone()),
                    version: Some(record.version),
                },
                None => GetResponse {
                    status: Status::KeyNotFound,
                    value: None,
                    version: None,
                },
            })
            .collect()
    }
}

fn version_matches(existing: Option<&Record>, expected: Option<i64>) -> bool {
    match (expected, existing) {
        (None, _) => true,
        (Some(expected), None) => expected == EXPECTED_RECORD_DOES_NOT_EXIST,
        (Some(expected), Some(record)) => record.version.version_id == expected,
    }
}

struct LocalSink {
    tx: mpsc::UnboundedSender<WriteRequest>,
    context: CancellationToken,
}

#[async_trait]
impl WriteSink for LocalSink {
    async fn send(&self, request: WriteRequest) -> Result<(), TransportError> {
        if self.context.is_cancelled() {
            return Err(TransportError::unavailable("write stream is closed"));
        }
        self.tx
            .send(request)
            .map_err(|_| TransportError::unavailable("write stream is closed"))
    }
}

/// Server side of one write stream: answer requests in arrival order.
async fn serve_write_stream(
    inner: Arc<ClusterInner>,
    shard: ShardId,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
    responses: mpsc::UnboundedSender<Result<WriteResponse, TransportError>>,
    context: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = context.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let delay = inner.state.lock().write_delay;
        if !delay.is_zero() {
            tokio::select! {
                _ = context.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let response = inner.apply_write(shard, &request);
        inner.write_requests.fetch_add(1, Ordering::Relaxed);
        if responses.send(Ok(response)).is_err() {
            break;
        }
    }
    context.cancel();
}

#[async_trait]
impl Transport for LocalCluster {
    async fn open_write_stream(
        &self,
        leader: &str,
        shard: ShardId,
    ) -> Result<WriteStreamHandle, TransportError> {
        if let Some(code) = take_fault(&mut self.inner.state.lock().open_faults) {
            return Err(TransportError::new(code, "injected write stream failure"));
        }
        self.check_leader(leader, shard)?;

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let context = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            let streams = state.write_streams.entry(shard).or_default();
            streams.retain(|token| !token.is_cancelled());
            streams.push(context.clone());
        }
        self.inner
            .write_streams_opened
            .fetch_add(1, Ordering::Relaxed);
        tokio::spawn(serve_write_stream(
            self.inner.clone(),
            shard,
            req_rx,
            resp_tx,
            context.clone(),
        ));

        Ok(WriteStreamHandle {
            sink: Box::new(LocalSink {
                tx: req_tx,
                context: context.clone(),
            }),
            responses: UnboundedReceiverStream::new(resp_rx).boxed(),
            context,
        })
    }

    async fn read(&self, leader: &str, request: ReadRequest) -> Result<ReadStream, TransportError> {
        self.inner.read_calls.fetch_add(1, Ordering::Relaxed);
        let (fault, fail_mid_stream, chunk) = {
            let mut state = self.inner.state.lock();
            let fault = take_fault(&mut state.read_faults);
            let fail_mid_stream = state.mid_stream_read_faults > 0;
            if fault.is_none() && fail_mid_stream {
                state.mid_stream_read_faults -= 1;
            }
            (fault, fail_mid_stream, state.read_chunk.unwrap_or(DEFAULT_READ_CHUNK))
        };
        if let Some(code) = fault {
            return Err(TransportError::new(code, "injected read failure"));
        }
        self.check_leader(leader, request.shard)?;

        let gets = self.inner.apply_reads(request.shard, &request.gets);
        let mut chunks: Vec<Result<ReadResponse, TransportError>> = gets
            .chunks(chunk)
            .map(|gets| Ok(ReadResponse {
                gets: gets.to_vec(),
            }))
            .collect();
        if fail_mid_stream {
            chunks.truncate(1);
            chunks.push(Err(TransportError::unavailable("read stream reset")));
        }
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}

#[async_trait]
impl TopologySource for LocalCluster {
    async fn subscribe(&self, namespace: &str) -> Result<AssignmentStream, TransportError> {
        if let Some(code) = take_fault(&mut self.inner.state.lock().subscribe_faults) {
            return Err(TransportError::new(code, "injected subscribe failure"));
        }
        tracing::debug!(namespace, "assignment subscription opened");
        let updates = WatchStream::new(self.inner.assignments.subscribe());
        Ok(updates.map(Ok).boxed())
    }
}

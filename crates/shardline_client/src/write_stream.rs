//! Write-stream multiplexer.
//!
//! One long-lived bidirectional stream per shard carries every write batch for
//! that shard. The server answers requests on a stream in order, so responses
//! are matched to requests strictly FIFO: queue order == send order == response
//! order.
//!
//! Two background tasks share the pending queue with senders:
//! - the response dispatcher pops the oldest pending entry for each response;
//! - the closure watcher fails every remaining entry once the stream context is
//!   cancelled, so no sender is ever left waiting on a dead stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ClientResult};
use crate::model::{ShardId, WriteRequest, WriteResponse};
use crate::transport::{WriteResponses, WriteSink, WriteStreamHandle};

type PendingEntry = oneshot::Sender<ClientResult<WriteResponse>>;

/// State shared between senders and the two background tasks.
struct StreamShared {
    pending: Mutex<VecDeque<PendingEntry>>,
    failed: AtomicBool,
    context: CancellationToken,
}

/// Multiplexed write stream for one shard leader.
pub struct WriteStream {
    shard: ShardId,
    leader: String,
    sink: Box<dyn WriteSink>,
    shared: Arc<StreamShared>,
}

impl WriteStream {
    /// Wrap an open stream and start its dispatcher and closure watcher.
    pub fn open(shard: ShardId, leader: impl Into<String>, handle: WriteStreamHandle) -> Self {
        let WriteStreamHandle {
            sink,
            responses,
            context,
        } = handle;
        let shared = Arc::new(StreamShared {
            pending: Mutex::new(VecDeque::new()),
            failed: AtomicBool::new(false),
            context,
        });

        tokio::spawn(dispatch_responses(shard, shared.clone(), responses));
        tokio::spawn(watch_closure(shard, shared.clone()));

        Self {
            shard,
            leader: leader.into(),
            sink,
            shared,
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn leader(&self) -> &str {
        &self.leader
    }

    /// Whether the stream can no longer carry requests.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire) || self.shared.context.is_cancelled()
    }

    /// Number of requests sent and still awaiting a response.
    pub async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Send one request and wait for its correlated response.
    ///
    /// The caller bounds the wait with its own deadline. Dropping the future
    /// while the sink is still sending fails the stream.
    pub async fn send(&self, request: WriteRequest) -> ClientResult<WriteResponse> {
        let rx = {
            let pending = self.shared.pending.lock().await;
            // The closure watcher may already have drained the queue.
            if self.is_failed() {
                return Err(ClientError::StreamClosed);
            }
            let (tx, rx) = oneshot::channel();
            let mut tail = PendingTail::push(pending, &self.shared, tx);
            if let Err(err) = self.sink.send(request).await {
                tail.abandon(false);
                tracing::debug!(
                    shard = self.shard,
                    leader = %self.leader,
                    error = %err,
                    "write stream send failed"
                );
                return Err(err.into());
            }
            tail.commit();
            rx
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::StreamClosed),
        }
    }

    /// Terminate the stream; pending requests fail with `StreamClosed`.
    pub fn close(&self) {
        self.shared.context.cancel();
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        self.shared.context.cancel();
    }
}

impl std::fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStream")
            .field("shard", &self.shard)
            .field("leader", &self.leader)
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Tail entry of the pending queue for a send in progress.
///
/// Unless committed, the entry is popped again on drop so no response is ever
/// matched against a request that never fully reached the sink.
struct PendingTail<'a> {
    pending: MutexGuard<'a, VecDeque<PendingEntry>>,
    shared: &'a StreamShared,
    armed: bool,
}

impl<'a> PendingTail<'a> {
    fn push(
        mut pending: MutexGuard<'a, VecDeque<PendingEntry>>,
        shared: &'a StreamShared,
        entry: PendingEntry,
    ) -> Self {
        pending.push_back(entry);
        Self {
            pending,
            shared,
            armed: true,
        }
    }

    /// The request reached the sink; leave the entry for the dispatcher.
    fn commit(mut self) {
        self.armed = false;
    }

    /// Remove the entry and mark the stream failed; `terminate` also cancels
    /// the stream context.
    fn abandon(&mut self, terminate: bool) {
        if !self.armed {
            return;
        }
        self.armed = false;
        self.pending.pop_back();
        self.shared.failed.store(true, Ordering::Release);
        if terminate {
            self.shared.context.cancel();
        }
    }
}

impl Drop for PendingTail<'_> {
    fn drop(&mut self) {
        // Still armed only when the send future was dropped mid-flight.
        self.abandon(true);
    }
}

/// Complete the oldest pending entry with each response received.
async fn dispatch_responses(shard: ShardId, shared: Arc<StreamShared>, mut responses: WriteResponses) {
    loop {
        let next = tokio::select! {
            _ = shared.context.cancelled() => return,
            next = responses.next() => next,
        };

        let mut pending = shared.pending.lock().await;
        match next {
            Some(Ok(response)) => {
                let Some(entry) = pending.pop_front() else {
                    // Protocol violation: the server answered more requests than we sent.
                    tracing::warn!(shard, "write response received with no pending request");
                    continue;
                };
                drop(pending);
                let _ = entry.send(Ok(response));
            }
            Some(Err(err)) => {
                shared.failed.store(true, Ordering::Release);
                drop(pending);
                tracing::debug!(shard, error = %err, "write stream receive failed");
                shared.context.cancel();
                return;
            }
            None => {
                shared.failed.store(true, Ordering::Release);
                drop(pending);
                tracing::debug!(shard, "write stream ended by server");
                shared.context.cancel();
                return;
            }
        }
    }
}

/// Fail every pending entry once the stream context is cancelled.
async fn watch_closure(shard: ShardId, shared: Arc<StreamShared>) {
    shared.context.cancelled().await;

    let mut pending = shared.pending.lock().await;
    let failed = pending.len();
    for entry in pending.drain(..) {
        let _ = entry.send(Err(ClientError::StreamClosed));
    }
    shared.failed.store(true, Ordering::Release);
    drop(pending);

    if failed > 0 {
        tracing::debug!(shard, failed, "failed pending writes on stream close");
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::{BatchKind, Call};
use crate::error::{ClientError, ClientResult};
use crate::model::ShardId;

/// Turns one flushed batch into a wire request and completes every call in it.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    fn kind(&self) -> BatchKind;

    /// Size of `call` counted against `BatcherConfig::max_bytes`.
    fn call_size(&self, _call: &Call) -> usize {
        0
    }

    /// Rank of `call` in the order the handler serializes a batch. A batch
    /// only takes calls ranked at or above everything already in it, so no
    /// call executes ahead of one added before it.
    fn serial_rank(&self, _call: &Call) -> u8 {
        0
    }

    /// Execute the batch. Every call must be completed exactly once.
    async fn execute(&self, shard: ShardId, calls: Vec<Call>);
}

/// Flush thresholds for one batcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Maximum time the first call of a batch waits for company.
    pub linger: Duration,
    pub max_calls: usize,
    /// Cap on the summed `call_size` of a batch; `None` disables it.
    pub max_bytes: Option<usize>,
}

/// Accumulates calls for one shard and executes them in batches.
///
/// A background task owns the accumulating batch; `add` only enqueues. At most
/// one batch per batcher is executing at any time.
pub struct Batcher {
    shard: ShardId,
    kind: BatchKind,
    tx: Mutex<Option<mpsc::UnboundedSender<Call>>>,
    retired: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    pub fn spawn(shard: ShardId, handler: Arc<dyn BatchHandler>, config: BatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let kind = handler.kind();
        let task = tokio::spawn(run_batcher(shard, handler, rx, config, cancel.clone()));
        Self {
            shard,
            kind,
            tx: Mutex::new(Some(tx)),
            retired: AtomicBool::new(false),
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Queue `call` for the next batch.
    ///
    /// A call of the wrong kind is rejected (and completed with the same error)
    /// without touching the batch being accumulated.
    pub fn add(&self, call: Call) -> ClientResult<()> {
        if call.kind() != self.kind {
            let err = ClientError::InvalidCall {
                call: call.op().as_str(),
                batcher: self.kind.as_str(),
            };
            call.fail(err.clone());
            return Err(err);
        }

        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref().filter(|_| !self.cancel.is_cancelled()) else {
            call.fail(ClientError::Closed);
            return Err(ClientError::Closed);
        };
        if let Err(mpsc::error::SendError(call)) = tx.send(call) {
            call.fail(ClientError::Closed);
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Stop accepting calls but let everything already queued execute, even
    /// after the last reference to the batcher is dropped.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.tx.lock().take();
    }

    /// Stop accepting calls and fail everything not yet executing.
    pub fn close(&self) {
        self.tx.lock().take();
        self.cancel.cancel();
    }

    /// Wait for the background task to exit.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(shard = self.shard, kind = self.kind.as_str(), error = %err, "batcher task failed");
            }
        }
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        // A retired batcher's task exits on its own once the queue is drained.
        if !self.retired.load(Ordering::Acquire) {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("shard", &self.shard)
            .field("kind", &self.kind)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Outcome of collecting one batch.
enum Collected {
    Ready {
        calls: Vec<Call>,
        /// First call that did not fit (byte cap or serial rank); it opens the
        /// next batch.
        overflow: Option<Call>,
    },
    Cancelled(Vec<Call>),
}

async fn run_batcher(
    shard: ShardId,
    handler: Arc<dyn BatchHandler>,
    mut rx: mpsc::UnboundedReceiver<Call>,
    config: BatcherConfig,
    cancel: CancellationToken,
) {
    let mut carry: Option<Call> = None;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let first = match carry.take() {
            Some(call) => call,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(call) => call,
                    // Retired and fully drained.
                    None => break,
                },
            },
        };

        match collect_batch(first, &mut rx, &config, handler.as_ref(), &cancel).await {
            Collected::Ready { calls, overflow } => {
                carry = overflow;
                handler.execute(shard, calls).await;
            }
            Collected::Cancelled(calls) => {
                fail_all(calls, ClientError::Closed);
                break;
            }
        }
    }

    if let Some(call) = carry.take() {
        call.fail(ClientError::Closed);
    }
    rx.close();
    let mut dropped = 0usize;
    while let Ok(call) = rx.try_recv() {
        call.fail(ClientError::Closed);
        dropped += 1;
    }
    tracing::debug!(shard, kind = handler.kind().as_str(), dropped, "batcher stopped");
}

/// Collect up to `max_calls` calls, waiting at most `linger` after the first.
async fn collect_batch(
    first: Call,
    rx: &mut mpsc::UnboundedReceiver<Call>,
    config: &BatcherConfig,
    handler: &dyn BatchHandler,
    cancel: &CancellationToken,
) -> Collected {
    let max_calls = config.max_calls.max(1);
    let mut bytes = handler.call_size(&first);
    let mut rank = handler.serial_rank(&first);
    let mut calls = Vec::with_capacity(max_calls.min(1024));
    calls.push(first);

    // Zero linger flushes whatever is already queued without waiting.
    let deadline = if config.linger.is_zero() {
        None
    } else {
        Some(time::Instant::now() + config.linger)
    };

    loop {
        if calls.len() >= max_calls {
            break;
        }
        let call = match rx.try_recv() {
            Ok(call) => call,
            Err(mpsc::error::TryRecvError::Disconnected) => break,
            Err(mpsc::error::TryRecvError::Empty) => {
                let Some(deadline) = deadline else {
                    break;
                };
                if time::Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Collected::Cancelled(calls),
                    next = rx.recv() => match next {
                        Some(call) => call,
                        None => break,
                    },
                    _ = time::sleep_until(deadline) => break,
                }
            }
        };

        let size = handler.call_size(&call);
        let call_rank = handler.serial_rank(&call);
        let over_bytes = config
            .max_bytes
            .is_some_and(|max_bytes| bytes.saturating_add(size) > max_bytes);
        if over_bytes || call_rank < rank {
            return Collected::Ready {
                calls,
                overflow: Some(call),
            };
        }
        bytes += size;
        rank = call_rank;
        calls.push(call);
    }

    Collected::Ready {
        calls,
        overflow: None,
    }
}

fn fail_all(calls: Vec<Call>, err: ClientError) {
    for call in calls {
        call.fail(err.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::model::{
        DeleteRequest, DeleteResponse, GetRequest, GetResponse, PutRequest, PutResponse, Status,
    };

    /// Records batch shapes and completes every call successfully.
    struct RecordingHandler {
        kind: BatchKind,
        delay: Duration,
        batches: Mutex<Vec<Vec<String>>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl RecordingHandler {
        fn new(kind: BatchKind, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kind,
                delay,
                batches: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl BatchHandler for RecordingHandler {
        fn kind(&self) -> BatchKind {
            self.kind
        }

        fn call_size(&self, call: &Call) -> usize {
            call.payload_size()
        }

        fn serial_rank(&self, call: &Call) -> u8 {
            call.op() as u8
        }

        async fn execute(&self, _shard: ShardId, calls: Vec<Call>) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            let mut keys = Vec::with_capacity(calls.len());
            for call in calls {
                match call {
                    Call::Put(put) => {
                        keys.push(put.request.key);
                        let _ = put.callback.send(Ok(PutResponse {
                            status: Status::Ok,
                            version: None,
                        }));
                    }
                    Call::Delete(delete) => {
                        keys.push(delete.request.key);
                        let _ = delete.callback.send(Ok(DeleteResponse {
                            status: Status::Ok,
                        }));
                    }
                    Call::Get(get) => {
                        keys.push(get.request.key);
                        let _ = get.callback.send(Ok(GetResponse {
                            status: Status::KeyNotFound,
                            value: None,
                            version: None,
                        }));
                    }
                    other => other.fail(ClientError::Closed),
                }
            }
            self.batches.lock().push(keys);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn put(key: &str) -> (Call, tokio::sync::oneshot::Receiver<ClientResult<PutResponse>>) {
        Call::put(PutRequest {
            key: key.to_string(),
            value: Vec::new(),
            expected_version_id: None,
        })
    }

    fn delete(key: &str) -> (Call, tokio::sync::oneshot::Receiver<ClientResult<DeleteResponse>>) {
        Call::delete(DeleteRequest {
            key: key.to_string(),
            expected_version_id: None,
        })
    }

    fn get(key: &str) -> (Call, tokio::sync::oneshot::Receiver<ClientResult<GetResponse>>) {
        Call::get(GetRequest {
            key: key.to_string(),
            include_value: true,
        })
    }

    fn config(linger_ms: u64, max_calls: usize, max_bytes: Option<usize>) -> BatcherConfig {
        BatcherConfig {
            linger: Duration::from_millis(linger_ms),
            max_calls,
            max_bytes,
        }
    }

    #[tokio::test]
    async fn linger_flushes_accumulated_calls_together() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::ZERO);
        let batcher = Batcher::spawn(1, handler.clone(), config(50, 100, None));
        let mut receivers = Vec::new();
        for key in ["a", "b", "c"] {
            let (call, rx) = put(key);
            batcher.add(call).unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }
        assert_eq!(handler.batch_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn count_threshold_flushes_without_waiting_for_linger() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::ZERO);
        let batcher = Batcher::spawn(1, handler.clone(), config(10_000, 2, None));
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (call, rx) = put(&format!("k{i}"));
            batcher.add(call).unwrap();
            receivers.push(rx);
        }
        let last = receivers.pop().unwrap();
        for rx in receivers {
            let result = time::timeout(Duration::from_secs(2), rx).await;
            assert!(result.expect("flushed by count").unwrap().is_ok());
        }
        assert_eq!(handler.batch_sizes(), vec![2, 2]);

        // The fifth call is still lingering; closing fails it.
        batcher.close();
        batcher.join().await;
        assert_eq!(last.await.unwrap(), Err(ClientError::Closed));
    }

    #[tokio::test]
    async fn byte_cap_moves_overflow_into_next_batch() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::ZERO);
        let batcher = Batcher::spawn(1, handler.clone(), config(30, 100, Some(10)));
        let mut receivers = Vec::new();
        for key in ["aaaa", "bbbb", "cccc", "dddd", "eeeeeeeeeeeeeeee"] {
            let (call, rx) = put(key);
            batcher.add(call).unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }
        // The oversized call still executes, alone.
        assert_eq!(handler.batch_sizes(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn zero_linger_executes_each_call_promptly() {
        let handler = RecordingHandler::new(BatchKind::Read, Duration::ZERO);
        let batcher = Batcher::spawn(1, handler.clone(), config(0, 100, None));
        let (call, rx) = get("solo");
        batcher.add(call).unwrap();
        let result = time::timeout(Duration::from_millis(500), rx).await;
        assert!(result.expect("no linger").unwrap().is_ok());
    }

    #[tokio::test]
    async fn idle_batcher_never_executes() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::ZERO);
        let _batcher = Batcher::spawn(1, handler.clone(), config(5, 100, None));
        time::sleep(Duration::from_millis(30)).await;
        assert!(handler.batch_sizes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_batch_executes_at_a_time() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::from_millis(2));
        let batcher = Arc::new(Batcher::spawn(1, handler.clone(), config(1, 8, None)));

        let mut tasks = Vec::new();
        for worker in 0..16 {
            let batcher = batcher.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..20 {
                    let (call, rx) = put(&format!("w{worker}-{i}"));
                    batcher.add(call).unwrap();
                    rx.await.unwrap().unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(handler.batch_sizes().iter().sum::<usize>(), 16 * 20);
    }

    #[tokio::test]
    async fn wrong_kind_is_rejected_without_disturbing_the_batch() {
        let handler = RecordingHandler::new(BatchKind::Read, Duration::ZERO);
        let batcher = Batcher::spawn(1, handler.clone(), config(20, 100, None));

        let (first, first_rx) = get("first");
        batcher.add(first).unwrap();

        let (bad, bad_rx) = put("misrouted");
        let err = batcher.add(bad).unwrap_err();
        assert_eq!(
            err,
            ClientError::InvalidCall {
                call: "put",
                batcher: "read"
            }
        );
        assert_eq!(bad_rx.await.unwrap(), Err(err));

        let (second, second_rx) = get("second");
        batcher.add(second).unwrap();
        assert!(first_rx.await.unwrap().is_ok());
        assert!(second_rx.await.unwrap().is_ok());
        assert_eq!(
            *handler.batches.lock(),
            vec![vec!["first".to_string(), "second".to_string()]]
        );
    }

    #[tokio::test]
    async fn closed_batcher_fails_new_calls() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::ZERO);
        let batcher = Batcher::spawn(1, handler.clone(), config(5, 100, None));
        batcher.close();
        let (call, rx) = put("late");
        assert_eq!(batcher.add(call), Err(ClientError::Closed));
        assert_eq!(rx.await.unwrap(), Err(ClientError::Closed));
        batcher.join().await;
        assert!(handler.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn retired_batcher_drains_queued_calls() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::from_millis(10));
        let batcher = Batcher::spawn(1, handler.clone(), config(0, 1, None));
        let mut receivers = Vec::new();
        for i in 0..4 {
            let (call, rx) = put(&format!("k{i}"));
            batcher.add(call).unwrap();
            receivers.push(rx);
        }
        batcher.retire();
        let (late, late_rx) = put("late");
        assert_eq!(batcher.add(late), Err(ClientError::Closed));
        assert_eq!(late_rx.await.unwrap(), Err(ClientError::Closed));

        batcher.join().await;
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }
        assert_eq!(handler.batch_sizes(), vec![1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn retired_batcher_drains_after_last_reference_is_dropped() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::from_millis(10));
        let batcher = Batcher::spawn(1, handler.clone(), config(0, 1, None));
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (call, rx) = put(&format!("k{i}"));
            batcher.add(call).unwrap();
            receivers.push(rx);
        }
        batcher.retire();
        drop(batcher);

        for rx in receivers {
            let result = time::timeout(Duration::from_secs(2), rx).await;
            assert!(result.expect("drained").unwrap().is_ok());
        }
        assert_eq!(handler.batch_sizes(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn lower_ranked_call_starts_a_new_batch() {
        let handler = RecordingHandler::new(BatchKind::Write, Duration::ZERO);
        let batcher = Batcher::spawn(1, handler.clone(), config(30, 100, None));

        let (first_put, first_put_rx) = put("a");
        let (first_delete, first_delete_rx) = delete("b");
        let (second_put, second_put_rx) = put("c");
        let (second_delete, second_delete_rx) = delete("d");
        for call in [first_put, first_delete, second_put, second_delete] {
            batcher.add(call).unwrap();
        }
        assert!(first_put_rx.await.unwrap().is_ok());
        assert!(first_delete_rx.await.unwrap().is_ok());
        assert!(second_put_rx.await.unwrap().is_ok());
        assert!(second_delete_rx.await.unwrap().is_ok());

        assert_eq!(
            *handler.batches.lock(),
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string(), "d".to_string()],
            ]
        );
    }
}

//! Shard topology and per-shard batcher ownership.
//!
//! `Topology` holds the current assignment as an immutable snapshot swapped
//! atomically on update, so readers never observe a half-applied change.
//! `ShardManager` routes keys against that snapshot, lazily builds one read and
//! one write batcher per shard, and follows the topology source in the
//! background.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{Backoff, BackoffConfig, BatchKind, Batcher, BatcherFactory};
use crate::error::{ClientError, ClientResult, RoutingError};
use crate::hashing::ShardStrategy;
use crate::model::{Shard, ShardId};
use crate::transport::TopologySource;

/// Effect of one assignment update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyChange {
    pub added: Vec<ShardId>,
    /// Shards dropped because a new shard's range overlapped theirs.
    pub removed: Vec<ShardId>,
    pub leader_changed: Vec<ShardId>,
}

impl TopologyChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.leader_changed.is_empty()
    }
}

/// Current shard assignment.
#[derive(Debug, Default)]
pub struct Topology {
    shards: RwLock<Arc<BTreeMap<ShardId, Shard>>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<BTreeMap<ShardId, Shard>> {
        self.shards.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    pub fn contains(&self, id: ShardId) -> bool {
        self.shards.read().contains_key(&id)
    }

    pub fn leader(&self, id: ShardId) -> Option<String> {
        self.shards.read().get(&id).map(|shard| shard.leader.clone())
    }

    /// Merge `updates` into the assignment.
    ///
    /// A shard id seen for the first time evicts every existing shard whose
    /// range overlaps it (splits and merges); known ids are replaced in place.
    pub fn apply(&self, updates: Vec<Shard>) -> TopologyChange {
        let mut guard = self.shards.write();
        let mut next: BTreeMap<ShardId, Shard> = (**guard).clone();
        let mut change = TopologyChange::default();

        for shard in updates {
            match next.get(&shard.id).map(|existing| existing.leader != shard.leader) {
                Some(leader_changed) => {
                    if leader_changed {
                        change.leader_changed.push(shard.id);
                    }
                }
                None => {
                    let overlapping: Vec<ShardId> = next
                        .values()
                        .filter(|existing| existing.hash_range.overlaps(&shard.hash_range))
                        .map(|existing| existing.id)
                        .collect();
                    for id in overlapping {
                        next.remove(&id);
                        change.removed.push(id);
                    }
                    change.added.push(shard.id);
                }
            }
            next.insert(shard.id, shard);
        }

        *guard = Arc::new(next);
        change
    }
}

/// Why a shard set is not a valid partition of the hash space.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TopologyViolation {
    #[error("no shards")]
    Empty,

    #[error("shards {first} and {second} overlap")]
    Overlap { first: ShardId, second: ShardId },

    #[error("hash codes {from:#010x}..={to:#010x} are not owned by any shard")]
    Gap { from: u32, to: u32 },
}

/// Check that `shards` are pairwise disjoint and jointly cover the hash space.
pub fn validate_shards<'a>(
    shards: impl IntoIterator<Item = &'a Shard>,
) -> Result<(), TopologyViolation> {
    let mut sorted: Vec<&Shard> = shards.into_iter().collect();
    if sorted.is_empty() {
        return Err(TopologyViolation::Empty);
    }
    sorted.sort_by_key(|shard| (shard.hash_range.min_inclusive, shard.hash_range.max_inclusive));

    // Next hash code that must be covered.
    let mut next: u64 = 0;
    let mut previous: Option<&Shard> = None;
    for shard in sorted {
        let range = shard.hash_range;
        if (range.min_inclusive as u64) < next {
            let first = previous.map_or(shard.id, |p| p.id);
            return Err(TopologyViolation::Overlap {
                first,
                second: shard.id,
            });
        }
        if range.min_inclusive as u64 > next {
            return Err(TopologyViolation::Gap {
                from: next as u32,
                to: range.min_inclusive - 1,
            });
        }
        next = range.max_inclusive as u64 + 1;
        previous = Some(shard);
    }
    if next <= u32::MAX as u64 {
        return Err(TopologyViolation::Gap {
            from: next as u32,
            to: u32::MAX,
        });
    }
    Ok(())
}

#[derive(Default)]
struct BatcherRegistry {
    write: HashMap<ShardId, Arc<Batcher>>,
    read: HashMap<ShardId, Arc<Batcher>>,
}

impl BatcherRegistry {
    fn map(&mut self, kind: BatchKind) -> &mut HashMap<ShardId, Arc<Batcher>> {
        match kind {
            BatchKind::Write => &mut self.write,
            BatchKind::Read => &mut self.read,
        }
    }
}

/// Routes keys to shards and owns every shard's batchers.
pub struct ShardManager {
    strategy: ShardStrategy,
    topology: Arc<Topology>,
    factory: BatcherFactory,
    batchers: Mutex<BatcherRegistry>,
    closed: AtomicBool,
    refresh_cancel: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ShardManager {
    pub fn new(strategy: ShardStrategy, topology: Arc<Topology>, factory: BatcherFactory) -> Self {
        Self {
            strategy,
            topology,
            factory,
            batchers: Mutex::new(BatcherRegistry::default()),
            closed: AtomicBool::new(false),
            refresh_cancel: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Follow `source` in the background; returns once the first assignment
    /// has been applied, or fails after `timeout`.
    pub async fn start(
        self: &Arc<Self>,
        source: Arc<dyn TopologySource>,
        namespace: String,
        backoff: BackoffConfig,
        timeout: Duration,
    ) -> ClientResult<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(follow_assignments(
            Arc::downgrade(self),
            source,
            namespace,
            backoff,
            self.refresh_cancel.clone(),
            ready_tx,
        ));
        *self.refresh_task.lock() = Some(task);

        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::TopologyUnavailable(timeout)),
        }
    }

    /// Resolve `key` to the single shard owning its hash.
    pub fn get(&self, key: &str) -> ClientResult<ShardId> {
        self.ensure_open()?;
        let snapshot = self.topology.snapshot();
        if snapshot.is_empty() {
            return Err(RoutingError::EmptyTopology.into());
        }
        let route = self.strategy.resolve(key);
        let owners: Vec<ShardId> = snapshot
            .values()
            .filter(|shard| route.matches(shard))
            .map(|shard| shard.id)
            .collect();
        match owners.as_slice() {
            [id] => Ok(*id),
            [] => Err(RoutingError::NoShard {
                key: key.to_string(),
                hash: route.code(),
            }
            .into()),
            _ => Err(RoutingError::MultipleShards {
                key: key.to_string(),
                hash: route.code(),
                shards: owners,
            }
            .into()),
        }
    }

    /// Every shard in the current assignment.
    pub fn shard_ids(&self) -> ClientResult<Vec<ShardId>> {
        self.ensure_open()?;
        Ok(self.topology.snapshot().keys().copied().collect())
    }

    pub fn write_batcher(&self, shard: ShardId) -> ClientResult<Arc<Batcher>> {
        self.batcher(BatchKind::Write, shard)
    }

    pub fn read_batcher(&self, shard: ShardId) -> ClientResult<Arc<Batcher>> {
        self.batcher(BatchKind::Read, shard)
    }

    fn batcher(&self, kind: BatchKind, shard: ShardId) -> ClientResult<Arc<Batcher>> {
        self.ensure_open()?;
        if !self.topology.contains(shard) {
            return Err(RoutingError::UnknownShard(shard).into());
        }
        let mut registry = self.batchers.lock();
        // Re-check under the registry lock so close() cannot miss a new batcher.
        self.ensure_open()?;
        let batcher = registry
            .map(kind)
            .entry(shard)
            .or_insert_with(|| Arc::new(self.factory.spawn(kind, shard)))
            .clone();
        Ok(batcher)
    }

    /// Apply an assignment update and retire batchers of evicted shards.
    pub fn apply_assignments(&self, shards: Vec<Shard>) -> TopologyChange {
        let change = self.topology.apply(shards);
        if change.is_empty() {
            return change;
        }

        if !change.removed.is_empty() {
            let mut registry = self.batchers.lock();
            for shard in &change.removed {
                for kind in [BatchKind::Write, BatchKind::Read] {
                    if let Some(batcher) = registry.map(kind).remove(shard) {
                        batcher.retire();
                    }
                }
            }
            drop(registry);
            for shard in &change.removed {
                self.factory.executor().retire_shard(*shard);
            }
        }

        tracing::info!(
            added = ?change.added,
            removed = ?change.removed,
            leader_changed = ?change.leader_changed,
            "shard assignments updated"
        );
        if let Err(err) = validate_shards(self.topology.snapshot().values()) {
            tracing::warn!(error = %err, "shard assignments do not partition the hash space");
        }
        change
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every batcher and write stream. Calls not yet executing fail with
    /// `Closed`; subsequent lookups fail with `Closed`.
    pub async fn close(&self) {
        let batchers: Vec<Arc<Batcher>> = {
            let mut guard = self.batchers.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let registry = &mut *guard;
            registry
                .write
                .drain()
                .chain(registry.read.drain())
                .map(|(_, batcher)| batcher)
                .collect()
        };

        self.refresh_cancel.cancel();
        for batcher in &batchers {
            batcher.close();
        }
        // Fail in-flight writes promptly instead of waiting for the server.
        self.factory.executor().close();
        for batcher in &batchers {
            batcher.join().await;
        }

        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::debug!(batchers = batchers.len(), "shard manager closed");
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        self.refresh_cancel.cancel();
    }
}

/// Subscribe to assignments and apply each snapshot, re-subscribing with
/// backoff whenever the subscription fails or ends.
async fn follow_assignments(
    manager: Weak<ShardManager>,
    source: Arc<dyn TopologySource>,
    namespace: String,
    backoff: BackoffConfig,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut backoff = Backoff::new(backoff);
    loop {
        let subscription = tokio::select! {
            _ = cancel.cancelled() => return,
            subscription = source.subscribe(&namespace) => subscription,
        };
        match subscription {
            Ok(mut assignments) => loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = assignments.next() => next,
                };
                match next {
                    Some(Ok(shards)) => {
                        let Some(manager) = manager.upgrade() else {
                            return;
                        };
                        manager.apply_assignments(shards);
                        backoff.reset();
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(());
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!(namespace = %namespace, error = %err, "assignment stream failed");
                        break;
                    }
                    None => {
                        tracing::debug!(namespace = %namespace, "assignment stream ended");
                        break;
                    }
                }
            },
            Err(err) => {
                tracing::warn!(namespace = %namespace, error = %err, "failed to subscribe to assignments");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

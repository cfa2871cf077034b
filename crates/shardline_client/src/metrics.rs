//! Observational hooks for batches and individual calls.
//!
//! The pipeline reports through `MetricsSink` and never reads anything back.
//! `ClientStats` is the in-memory sink: atomic counters plus fixed-bucket
//! latency histograms, drained with `snapshot_and_reset`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::batch::{BatchKind, OpKind};
use crate::model::ShardId;

/// Fixed latency buckets (microseconds) shared by every histogram.
const LATENCY_BUCKETS_US: [u64; 12] = [
    100,     // 0.1ms
    250,     // 0.25ms
    500,     // 0.5ms
    1_000,   // 1ms
    2_000,   // 2ms
    5_000,   // 5ms
    10_000,  // 10ms
    20_000,  // 20ms
    50_000,  // 50ms
    100_000, // 100ms
    200_000, // 200ms
    500_000, // 500ms
];

/// One executed batch.
#[derive(Clone, Copy, Debug)]
pub struct BatchRecord {
    pub kind: BatchKind,
    pub shard: ShardId,
    /// Enqueue time of the oldest call in the batch.
    pub batch_start: Instant,
    pub execution_start: Instant,
    pub calls: usize,
    pub value_bytes: usize,
    pub failed: bool,
}

/// One completed call.
#[derive(Clone, Copy, Debug)]
pub struct CallRecord {
    pub op: OpKind,
    pub enqueued_at: Instant,
    pub value_bytes: usize,
    pub failed: bool,
}

pub trait MetricsSink: Send + Sync + 'static {
    fn on_batch(&self, record: &BatchRecord);
    fn on_call(&self, record: &CallRecord);
}

/// Discards every record.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn on_batch(&self, _record: &BatchRecord) {}

    fn on_call(&self, _record: &CallRecord) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Lock-free latency histogram over `LATENCY_BUCKETS_US` plus an overflow bucket.
struct LatencyHistogram {
    counts: [AtomicU64; LATENCY_BUCKETS_US.len() + 1],
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    fn record(&self, us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
        let idx = LATENCY_BUCKETS_US
            .iter()
            .position(|upper| us <= *upper)
            .unwrap_or(LATENCY_BUCKETS_US.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn record_since(&self, start: Instant) {
        self.record(start.elapsed().as_micros().min(u128::from(u64::MAX)) as u64);
    }

    fn snapshot_and_reset(&self) -> LatencySnapshot {
        let count = self.count.swap(0, Ordering::Relaxed);
        let total_us = self.total_us.swap(0, Ordering::Relaxed);
        let max_us = self.max_us.swap(0, Ordering::Relaxed);

        let mut buckets = [0u64; LATENCY_BUCKETS_US.len() + 1];
        for (i, c) in self.counts.iter().enumerate() {
            buckets[i] = c.swap(0, Ordering::Relaxed);
        }

        LatencySnapshot {
            count,
            avg_ms: if count == 0 {
                0.0
            } else {
                (total_us as f64 / count as f64) / 1000.0
            },
            p50_ms: percentile_us(&buckets, 50.0, max_us) as f64 / 1000.0,
            p95_ms: percentile_us(&buckets, 95.0, max_us) as f64 / 1000.0,
            p99_ms: percentile_us(&buckets, 99.0, max_us) as f64 / 1000.0,
            max_ms: max_us as f64 / 1000.0,
        }
    }
}

/// Upper bound of the bucket holding the `p`th percentile sample.
fn percentile_us(counts: &[u64; LATENCY_BUCKETS_US.len() + 1], p: f64, max_us: u64) -> u64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0;
    }
    let target = (total as f64 * (p / 100.0)).ceil() as u64;
    let mut cumulative = 0u64;
    for (i, count) in counts.iter().enumerate() {
        cumulative += *count;
        if cumulative >= target {
            if i < LATENCY_BUCKETS_US.len() {
                return LATENCY_BUCKETS_US[i];
            }
            // Overflow bucket: the largest observation is the best bound we have.
            return max_us.max(LATENCY_BUCKETS_US[LATENCY_BUCKETS_US.len() - 1]);
        }
    }
    max_us
}

#[derive(Default)]
struct OpStats {
    completed: AtomicU64,
    errors: AtomicU64,
    value_bytes: AtomicU64,
    latency: LatencyHistogram,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct OpStatsSnapshot {
    pub completed: u64,
    pub errors: u64,
    pub value_bytes: u64,
    pub latency: LatencySnapshot,
}

#[derive(Default)]
struct BatchStats {
    batches: AtomicU64,
    errors: AtomicU64,
    calls: AtomicU64,
    max_calls: AtomicU64,
    value_bytes: AtomicU64,
    /// Oldest enqueue to completion.
    total_latency: LatencyHistogram,
    /// Execution start to completion.
    exec_latency: LatencyHistogram,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BatchStatsSnapshot {
    pub batches: u64,
    pub errors: u64,
    pub calls: u64,
    pub max_calls: u64,
    pub avg_calls: f64,
    pub value_bytes: u64,
    pub total_latency: LatencySnapshot,
    pub exec_latency: LatencySnapshot,
}

impl BatchStats {
    fn snapshot_and_reset(&self) -> BatchStatsSnapshot {
        let batches = self.batches.swap(0, Ordering::Relaxed);
        let calls = self.calls.swap(0, Ordering::Relaxed);
        BatchStatsSnapshot {
            batches,
            errors: self.errors.swap(0, Ordering::Relaxed),
            calls,
            max_calls: self.max_calls.swap(0, Ordering::Relaxed),
            avg_calls: if batches == 0 {
                0.0
            } else {
                calls as f64 / batches as f64
            },
            value_bytes: self.value_bytes.swap(0, Ordering::Relaxed),
            total_latency: self.total_latency.snapshot_and_reset(),
            exec_latency: self.exec_latency.snapshot_and_reset(),
        }
    }
}

/// In-memory metrics sink.
#[derive(Default)]
pub struct ClientStats {
    ops: [OpStats; 4],
    write_batches: BatchStats,
    read_batches: BatchStats,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClientStatsSnapshot {
    pub ops: BTreeMap<&'static str, OpStatsSnapshot>,
    pub write_batches: BatchStatsSnapshot,
    pub read_batches: BatchStatsSnapshot,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn op(&self, op: OpKind) -> &OpStats {
        &self.ops[op as usize]
    }

    fn batches(&self, kind: BatchKind) -> &BatchStats {
        match kind {
            BatchKind::Write => &self.write_batches,
            BatchKind::Read => &self.read_batches,
        }
    }

    /// Drain all counters and histograms into a serializable snapshot.
    pub fn snapshot_and_reset(&self) -> ClientStatsSnapshot {
        let ops = OpKind::ALL
            .iter()
            .map(|op| {
                let stats = self.op(*op);
                let snapshot = OpStatsSnapshot {
                    completed: stats.completed.swap(0, Ordering::Relaxed),
                    errors: stats.errors.swap(0, Ordering::Relaxed),
                    value_bytes: stats.value_bytes.swap(0, Ordering::Relaxed),
                    latency: stats.latency.snapshot_and_reset(),
                };
                (op.as_str(), snapshot)
            })
            .collect();
        ClientStatsSnapshot {
            ops,
            write_batches: self.write_batches.snapshot_and_reset(),
            read_batches: self.read_batches.snapshot_and_reset(),
        }
    }
}

impl MetricsSink for ClientStats {
    fn on_batch(&self, record: &BatchRecord) {
        let stats = self.batches(record.kind);
        stats.batches.fetch_add(1, Ordering::Relaxed);
        if record.failed {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        stats.calls.fetch_add(record.calls as u64, Ordering::Relaxed);
        stats.max_calls.fetch_max(record.calls as u64, Ordering::Relaxed);
        stats
            .value_bytes
            .fetch_add(record.value_bytes as u64, Ordering::Relaxed);
        stats.total_latency.record_since(record.batch_start);
        stats.exec_latency.record_since(record.execution_start);
    }

    fn on_call(&self, record: &CallRecord) {
        let stats = self.op(record.op);
        stats.completed.fetch_add(1, Ordering::Relaxed);
        if record.failed {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .value_bytes
            .fetch_add(record.value_bytes as u64, Ordering::Relaxed);
        stats.latency.record_since(record.enqueued_at);
    }
}

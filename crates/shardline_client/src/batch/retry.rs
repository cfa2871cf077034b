use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{self, Instant};

use crate::error::{ClientError, ClientResult};
use crate::model::ShardId;

const BACKOFF_MAX_SHIFT: u32 = 16;

/// Bounds for the retry delay sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

/// Exponential backoff with jitter in [80%, 120%] of the capped delay.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay before the next attempt; grows with each call until `max`.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let shift = self.failures.saturating_sub(1).min(BACKOFF_MAX_SHIFT);
        let initial_ms = self.config.initial.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.config.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let capped_ms = initial_ms.saturating_mul(1u64 << shift).min(max_ms);

        // Spread retries from many batchers hitting the same failed leader.
        let jitter_percent = rand::thread_rng().gen_range(80u64..=120);
        let jittered_ms = capped_ms.saturating_mul(jitter_percent) / 100;
        Duration::from_millis(jittered_ms.max(1))
    }
}

/// Run `attempt` until it succeeds, fails terminally, or `timeout` elapses.
///
/// Each attempt is bounded by the overall deadline. A retriable failure whose
/// next backoff would overrun the deadline is returned as-is.
pub(crate) async fn with_retries<T, F, Fut>(
    op: &'static str,
    shard: ShardId,
    timeout: Duration,
    backoff: BackoffConfig,
    mut attempt: F,
) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut backoff = Backoff::new(backoff);
    loop {
        let err = match time::timeout_at(deadline, attempt()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => return Err(ClientError::DeadlineExceeded { timeout }),
        };
        if !err.is_retriable() {
            return Err(err);
        }

        let delay = backoff.next_delay();
        if Instant::now() + delay >= deadline {
            tracing::debug!(op, shard, error = %err, "retry budget exhausted");
            return Err(err);
        }
        tracing::debug!(
            op,
            shard,
            error = %err,
            retry_after = ?delay,
            "request failed, retrying"
        );
        time::sleep(delay).await;
    }
}

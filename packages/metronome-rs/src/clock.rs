//! Time sources for the scheduler.
//!
//! All time reads inside the crate go through the [`Clock`] trait, which
//! keeps planner math, lease arithmetic, and rate-limiter refills testable:
//!
//! - [`SystemClock`] — wall time with a monotonic guard. `now()` never goes
//!   backwards within a process even if the wall clock is adjusted.
//! - [`VirtualClock`] — test double. `advance()` moves time forward
//!   deterministically and fires pending sleepers in deadline order.
//!
//! Sleeps are cancel-aware: an aborted sleep fails with a `canceled` error
//! rather than completing silently, so callers can tell shutdown apart from
//! an elapsed wait.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;

/// A source of current time and cancel-aware sleeps.
///
/// `now()` is monotonically non-decreasing within a process.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `duration`, or fail with a `canceled` error when `cancel`
    /// fires first.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken)
        -> Result<(), SchedulerError>;
}

// =============================================================================
// System Clock
// =============================================================================

/// Wall-clock time with a monotonic guard.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_micros: AtomicI64,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let prev = self.last_micros.fetch_max(wall, Ordering::AcqRel);
        let micros = wall.max(prev);
        DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }

    async fn sleep(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(SchedulerError::canceled("sleep aborted")),
        }
    }
}

// =============================================================================
// Virtual Clock
// =============================================================================

/// A pending virtual sleeper, ordered by `(deadline, seq)` so that two
/// sleepers with the same deadline fire in registration order.
struct Sleeper {
    deadline: DateTime<Utc>,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct VirtualState {
    now: DateTime<Utc>,
    seq: u64,
    sleepers: BinaryHeap<Reverse<Sleeper>>,
}

/// Deterministic clock for tests.
///
/// Time only moves when [`VirtualClock::advance`] is called. Sleepers whose
/// deadline falls within the advanced window complete in deadline order,
/// with `now()` observing each intermediate deadline as it fires.
///
/// # Example
///
/// ```ignore
/// let clock = Arc::new(VirtualClock::at(start));
/// let sleeper = tokio::spawn({
///     let clock = clock.clone();
///     async move { clock.sleep(Duration::from_secs(60), &token).await }
/// });
/// clock.advance(Duration::from_secs(60));
/// sleeper.await??; // completed deterministically
/// ```
pub struct VirtualClock {
    state: Mutex<VirtualState>,
}

impl VirtualClock {
    /// Create a virtual clock starting at `start`.
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(VirtualState {
                now: start,
                seq: 0,
                sleepers: BinaryHeap::new(),
            }),
        }
    }

    /// Create a virtual clock starting at the current wall time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Advance virtual time by `duration`, firing pending sleepers whose
    /// deadline is reached, in deadline order.
    pub fn advance(&self, duration: Duration) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let target = state.now
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());

        loop {
            let due = matches!(state.sleepers.peek(), Some(Reverse(head)) if head.deadline <= target);
            if !due {
                break;
            }
            let Some(Reverse(sleeper)) = state.sleepers.pop() else {
                break;
            };
            state.now = state.now.max(sleeper.deadline);
            let _ = sleeper.tx.send(());
        }
        state.now = state.now.max(target);
    }

    /// Number of sleepers currently waiting (for test assertions).
    pub fn sleeper_count(&self) -> usize {
        match self.state.lock() {
            Ok(s) => s.sleepers.len(),
            Err(poisoned) => poisoned.into_inner().sleepers.len(),
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        f.debug_struct("VirtualClock")
            .field("now", &state.now)
            .field("sleepers", &state.sleepers.len())
            .finish()
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.state.lock() {
            Ok(s) => s.now,
            Err(poisoned) => poisoned.into_inner().now,
        }
    }

    async fn sleep(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        if duration.is_zero() {
            return Ok(());
        }
        let rx = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            let deadline = state.now
                + chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let seq = state.seq;
            state.seq += 1;
            let (tx, rx) = oneshot::channel();
            state.sleepers.push(Reverse(Sleeper { deadline, seq, tx }));
            rx
        };
        tokio::select! {
            res = rx => match res {
                Ok(()) => Ok(()),
                Err(_) => Err(SchedulerError::canceled("clock dropped")),
            },
            _ = cancel.cancelled() => Err(SchedulerError::canceled("sleep aborted")),
        }
    }
}

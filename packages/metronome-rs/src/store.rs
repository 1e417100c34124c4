//! Persistent records and the store contract.
//!
//! The store owns all durable state: jobs, triggers, and runs. Engine
//! instances hold only transient state (timers, in-flight counts, limiter
//! tokens) and coordinate with each other exclusively through the store.
//!
//! # Implementer Notes
//!
//! - [`SchedulerStore::claim_trigger`] must be linearizable with respect to
//!   other claims of the same trigger (one winner per lease window). All
//!   other writes may be single-record atomic.
//! - [`SchedulerStore::record_run_start`] is an upsert keyed by run id:
//!   recording an already-present run must not duplicate side effects.
//! - `list_due_triggers` orders by `(next_run_at ASC, priority DESC, id
//!   ASC)`; the engine dispatches in exactly that order.
//! - Every trigger write bumps [`Revision`]; SQL stores typically map the
//!   lease claim to a conditional `UPDATE ... WHERE` and the due query to
//!   an indexed scan.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::backoff::BackoffStrategy;
use crate::rate_limit::RateLimitConfig;
use crate::trigger::{TriggerId, TriggerOptions};

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the store layer.
///
/// The distinction matters for engine behavior: `Conflict` and `State` are
/// expected under concurrency and handled locally; `Backend` pauses the
/// drain cycle and, repeated past a cap, stops the engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced record does not exist.
    #[error("record not found")]
    NotFound,

    /// Another writer modified the record since it was read.
    #[error("revision conflict: record was modified concurrently")]
    Conflict,

    /// The write is not legal for the record's current state.
    #[error("illegal transition: {0}")]
    State(String),

    /// Storage backend failed (timeout, connection, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

// =============================================================================
// Revision
// =============================================================================

/// Monotonic per-record revision, bumped on every store write.
///
/// [`Revision::NONE`] marks a record that has never been persisted.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    /// Sentinel for a record that has never been saved.
    pub const NONE: Revision = Revision(0);

    /// The next revision (for save operations).
    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    /// Whether this is the NONE sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            f.write_str("NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Per-job retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 means no retries).
    pub max_attempts: u32,
    /// Attempt-number → delay before that attempt.
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    /// Retry up to `max_attempts` total attempts with the given strategy.
    pub fn new(max_attempts: u32, strategy: BackoffStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
        }
    }
}

/// Abstract executor descriptor, interpreted by an external worker
/// executor instead of an in-process handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    /// Which executor family interprets this definition.
    pub kind: String,
    /// Opaque executor-specific payload.
    pub spec: Value,
}

/// The persisted shape of a registered job.
///
/// Handlers are process-local and never persisted; a job carries either an
/// in-process handler (registered on the engine) or a [`WorkerDefinition`]
/// for an external executor. A job with neither is a configuration error
/// surfaced when a run starts.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Unique job name.
    pub name: String,
    /// Max in-flight runs of this job on one engine.
    pub concurrency: u32,
    /// Per-run execution timeout.
    pub timeout: Option<Duration>,
    /// Retry policy; `None` means a single attempt.
    pub retry: Option<RetryPolicy>,
    /// Per-job admission rate limit.
    pub rate_limit: Option<RateLimitConfig>,
    /// Opaque metadata, the default run payload.
    pub metadata: Option<Value>,
    /// Paused jobs keep their triggers but admit no runs.
    pub paused: bool,
    /// External executor descriptor.
    pub worker: Option<WorkerDefinition>,
}

/// A persisted trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    /// Owning job name.
    pub job: String,
    pub options: TriggerOptions,
    /// The next planned fire; `None` once exhausted.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Failed or stalled attempts since the last completed run.
    pub failure_count: u32,
    /// Higher wins a fire-time tie in the drain order.
    pub priority: i32,
    pub paused: bool,
    pub revision: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Engine instance currently holding the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_until: Option<DateTime<Utc>>,
}

impl Trigger {
    /// Whether the trigger is free to claim at `now` (no lease, or the
    /// lease expired).
    pub fn claimable(&self, now: DateTime<Utc>) -> bool {
        match (&self.lease_owner, self.leased_until) {
            (Some(_), Some(until)) => now >= until,
            _ => true,
        }
    }
}

/// Unique, monotonic (per process) run identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Compose a run id from an engine instance prefix and a sequence
    /// number. Sequence ordering makes ids sortable within one process.
    pub fn compose(instance: &str, seq: u64) -> Self {
        Self(format!("{instance}-{seq:010}"))
    }

    /// The string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    Stalled,
}

impl RunStatus {
    /// Whether this status ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled | RunStatus::Stalled
        )
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub trigger_id: TriggerId,
    /// Owning job name.
    pub job: String,
    /// The planned fire instant.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// 1-based attempt index within the retry chain.
    pub attempt: u32,
    pub status: RunStatus,
    /// 0..=100, monotonically non-decreasing within the run.
    pub progress: Option<u8>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Terminal update applied by [`SchedulerStore::record_run_end`].
#[derive(Debug, Clone)]
pub struct RunEnd {
    pub status: RunStatus,
    pub ended_at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

// =============================================================================
// Store Contract
// =============================================================================

/// The pluggable persistence contract.
///
/// A single-process deployment uses the in-memory reference store; a
/// multi-process deployment plugs in a store whose `claim_trigger` is
/// backed by an atomic check-and-set, making leases exclusive across
/// engines.
#[async_trait]
pub trait SchedulerStore: Send + Sync + 'static {
    // --- jobs ---------------------------------------------------------------

    /// Insert or replace a job record.
    async fn upsert_job(&self, job: JobRecord) -> Result<(), StoreError>;

    /// Fetch a job by name.
    async fn get_job(&self, name: &str) -> Result<Option<JobRecord>, StoreError>;

    /// All job records.
    async fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Pause or resume a job.
    async fn set_job_paused(&self, name: &str, paused: bool) -> Result<(), StoreError>;

    /// Remove a job record.
    async fn remove_job(&self, name: &str) -> Result<(), StoreError>;

    // --- triggers -----------------------------------------------------------

    /// Insert or replace a trigger, checking its revision. The stored
    /// revision advances; the new revision is returned.
    async fn upsert_trigger(&self, trigger: Trigger) -> Result<Revision, StoreError>;

    /// Fetch a trigger by id.
    async fn get_trigger(&self, id: &TriggerId) -> Result<Option<Trigger>, StoreError>;

    /// All trigger records.
    async fn list_triggers(&self) -> Result<Vec<Trigger>, StoreError>;

    /// Delete a trigger.
    async fn delete_trigger(&self, id: &TriggerId) -> Result<(), StoreError>;

    /// Unpaused triggers with `next_run_at <= until` whose lease is free or
    /// expired, ordered `(next_run_at ASC, priority DESC, id ASC)`, capped
    /// at `limit`.
    async fn list_due_triggers(
        &self,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Trigger>, StoreError>;

    /// Atomically claim a trigger for `lease` iff it is free or its lease
    /// expired. Returns whether the claim succeeded.
    async fn claim_trigger(
        &self,
        id: &TriggerId,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Release a lease iff `owner` holds it.
    async fn release_trigger(&self, id: &TriggerId, owner: &str) -> Result<(), StoreError>;

    // --- runs ---------------------------------------------------------------

    /// Record (or idempotently update) a run. Keyed by run id; re-recording
    /// an existing run must not create a duplicate.
    async fn record_run_start(&self, run: Run) -> Result<(), StoreError>;

    /// Apply a terminal status to a pending or running run.
    async fn record_run_end(&self, run_id: &RunId, end: RunEnd) -> Result<(), StoreError>;

    /// Update the run's heartbeat and, optionally, its progress. Progress
    /// must be in 0..=100 and non-decreasing; a violation fails with
    /// [`StoreError::State`] and leaves the recorded progress unchanged.
    async fn touch_run(&self, run_id: &RunId, progress: Option<u8>) -> Result<(), StoreError>;

    /// Running runs whose heartbeat is older than `now - heartbeat_timeout`.
    async fn find_stalled_runs(
        &self,
        heartbeat_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Run>, StoreError>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError>;
}

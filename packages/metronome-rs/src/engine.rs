//! The scheduler engine.
//!
//! One engine instance owns one logical loop: the drainer converts due
//! triggers into dispatched runs, the pending queue feeds retries and
//! immediate executions, and the stall sweeper recovers runs whose
//! heartbeat went quiet. Handlers execute on spawned tasks; everything the
//! engine itself mutates in-process (active-run counts, limiter tokens,
//! the pending queue) is transient, and cross-process coordination goes
//! through store leases.
//!
//! ```text
//! timer/wake ──► drain_pass ──► claim ──► misfire reconcile ──► admit
//!                   │                                            │
//!                   │                                            ▼
//!                   │                                        fire_run ──► spawn handler
//!                   │                                            │            │
//!                   └── advance next_run_at ◄────────────────────┘            ▼
//!                                                                    completed / retry /
//!                                                                    canceled / stalled
//! ```
//!
//! Instance lifecycle: `created → running ⇄ paused → draining → stopped`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::bus::{
    CanceledEvent, CompletedEvent, DrainEvent, ErrorEvent, EventBus, PausedEvent, ResumedEvent,
    RetryEvent, RunStartedEvent, ScheduledEvent, SchedulerEvent, ShutdownEvent, StalledEvent,
};
use crate::clock::{Clock, SystemClock};
use crate::error::SchedulerError;
use crate::job::{JobDefinition, JobHandler, RunContext, TouchHandle, WorkerExecutor};
use crate::memory::InMemoryStore;
use crate::planner::TriggerPlanner;
use crate::rate_limit::RateLimiter;
use crate::store::{
    JobRecord, Revision, Run, RunEnd, RunId, RunStatus, SchedulerStore, StoreError, Trigger,
};
use crate::trigger::{MisfirePolicy, TriggerId, TriggerKind, TriggerOptions};

// =============================================================================
// Configuration
// =============================================================================

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lease owner identity; unique per engine instance.
    pub instance_id: String,
    /// Due-trigger look-ahead per drain pass.
    pub horizon: Duration,
    /// Lower clamp on the loop sleep.
    pub min_tick: Duration,
    /// Max triggers drained per pass.
    pub drain_batch: usize,
    /// Trigger lease duration while firing.
    pub lease: Duration,
    /// Lag beyond which the misfire policy applies.
    pub misfire_tolerance: Duration,
    /// Engine-wide cap on concurrent runs.
    pub max_concurrent_runs: usize,
    /// Cadence of engine heartbeats and the stall sweeper.
    pub heartbeat_interval: Duration,
    /// Heartbeat age at which a running run counts as stalled.
    pub stalled_after: Duration,
    /// Max catch-up fires per trigger per drain pass.
    pub catch_up_cap: usize,
    /// Consecutive store failures before the engine stops.
    pub store_failure_cap: u32,
    /// Default graceful-shutdown grace.
    pub default_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("engine-{}", Uuid::new_v4().simple()),
            horizon: Duration::from_millis(500),
            min_tick: Duration::from_millis(25),
            drain_batch: 100,
            lease: Duration::from_secs(30),
            misfire_tolerance: Duration::from_secs(5),
            max_concurrent_runs: 64,
            heartbeat_interval: Duration::from_secs(30),
            stalled_after: Duration::from_secs(120),
            catch_up_cap: 32,
            store_failure_cap: 5,
            default_grace: Duration::from_secs(30),
        }
    }
}

/// Instance-wide lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Paused,
    Draining,
    Stopped,
}

/// Options for [`Scheduler::shutdown`]. Defaults to graceful.
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    /// Skip the grace wait when `false`.
    pub graceful: bool,
    /// Overrides [`SchedulerConfig::default_grace`].
    pub grace: Option<Duration>,
    /// Recorded on the shutdown event.
    pub reason: Option<String>,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self::graceful()
    }
}

impl ShutdownOptions {
    /// Graceful shutdown with the default grace.
    pub fn graceful() -> Self {
        Self {
            graceful: true,
            grace: None,
            reason: None,
        }
    }

    /// Immediate shutdown.
    pub fn immediate() -> Self {
        Self {
            graceful: false,
            grace: None,
            reason: None,
        }
    }

    /// Attach a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Options for [`Scheduler::execute_now`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteNowOptions {
    /// Fire instant; `now` when omitted.
    pub run_at: Option<DateTime<Utc>>,
    /// Payload override for this run.
    pub payload: Option<Value>,
}

// =============================================================================
// Internal State
// =============================================================================

/// Process-local runtime of a registered job.
struct JobRuntime {
    handler: Option<Arc<dyn JobHandler>>,
    limiter: Option<Arc<RateLimiter>>,
    pending_remove: std::sync::atomic::AtomicBool,
}

/// A run waiting in the engine's time-ordered queue (retries and
/// immediate executions).
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRun {
    at: DateTime<Utc>,
    run_id: RunId,
    trigger_id: TriggerId,
    job: String,
}

impl PartialOrd for PendingRun {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRun {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, &self.run_id).cmp(&(other.at, &other.run_id))
    }
}

/// RAII accounting for one in-flight run. Dropping the guard releases the
/// engine-wide and per-job slots and finishes a deferred unregistration
/// when the last run of a removed job ends.
struct RunGuard {
    inner: Arc<EngineInner>,
    job: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.active_global.fetch_sub(1, Ordering::AcqRel);
        let mut zero = false;
        if let Some(mut count) = self.inner.jobs_active.get_mut(&self.job) {
            *count = count.saturating_sub(1);
            zero = *count == 0;
        }
        if zero {
            self.inner.jobs_active.remove_if(&self.job, |_, c| *c == 0);
            if let Some(runtime) = self.inner.jobs.get(&self.job) {
                if runtime.pending_remove.load(Ordering::Acquire) {
                    let inner = self.inner.clone();
                    let job = self.job.clone();
                    tokio::spawn(async move {
                        inner.finalize_unregister(&job).await;
                    });
                }
            }
        }
        self.inner.wake.notify_one();
    }
}

enum FireOutcome {
    Fired,
    Deferred,
}

enum RunOutcome {
    Success(Option<Value>),
    Failed(String),
    TimedOut(Duration),
    Canceled,
    Misconfigured(String),
}

struct EngineInner {
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    config: SchedulerConfig,
    worker_executor: Option<Arc<dyn WorkerExecutor>>,

    state: Mutex<EngineState>,
    shutdown: CancellationToken,
    wake: Notify,

    jobs: DashMap<String, Arc<JobRuntime>>,
    planners: Mutex<HashMap<TriggerId, TriggerPlanner>>,
    pending: Mutex<BinaryHeap<Reverse<PendingRun>>>,

    active_global: AtomicUsize,
    jobs_active: DashMap<String, usize>,
    run_seq: AtomicU64,
    store_failures: AtomicU32,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Scheduler`].
///
/// # Example
///
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .with_store(Arc::new(InMemoryStore::new()))
///     .with_config(SchedulerConfig::default())
///     .build();
/// scheduler.start().await;
/// ```
pub struct SchedulerBuilder {
    store: Option<Arc<dyn SchedulerStore>>,
    clock: Option<Arc<dyn Clock>>,
    bus: Option<EventBus>,
    config: SchedulerConfig,
    worker_executor: Option<Arc<dyn WorkerExecutor>>,
}

impl SchedulerBuilder {
    /// New builder with default configuration.
    pub fn new() -> Self {
        Self {
            store: None,
            clock: None,
            bus: None,
            config: SchedulerConfig::default(),
            worker_executor: None,
        }
    }

    /// Use a specific store (defaults to a fresh in-memory store).
    pub fn with_store(mut self, store: Arc<dyn SchedulerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a specific clock (defaults to the system clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share an existing event bus.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Override the engine configuration.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Plug in an executor for jobs defined by worker descriptors.
    pub fn with_worker_executor(mut self, executor: Arc<dyn WorkerExecutor>) -> Self {
        self.worker_executor = Some(executor);
        self
    }

    /// Build the scheduler. The engine loop starts on [`Scheduler::start`]
    /// or on the first `schedule`/`execute_now`.
    pub fn build(self) -> Scheduler {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::with_clock(clock.clone())));
        Scheduler {
            inner: Arc::new(EngineInner {
                store,
                clock,
                bus: self.bus.unwrap_or_default(),
                config: self.config,
                worker_executor: self.worker_executor,
                state: Mutex::new(EngineState::Created),
                shutdown: CancellationToken::new(),
                wake: Notify::new(),
                jobs: DashMap::new(),
                planners: Mutex::new(HashMap::new()),
                pending: Mutex::new(BinaryHeap::new()),
                active_global: AtomicUsize::new(0),
                jobs_active: DashMap::new(),
                run_seq: AtomicU64::new(0),
                store_failures: AtomicU32::new(0),
                tasks: Mutex::new(Vec::new()),
                loop_handle: Mutex::new(None),
            }),
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Public Surface
// =============================================================================

/// The scheduler: register jobs, schedule triggers, observe events.
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<EngineInner>,
}

impl Scheduler {
    /// Start building a scheduler.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// The event bus.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// This engine's lease-owner identity.
    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Number of in-flight runs on this engine.
    pub fn in_flight(&self) -> usize {
        self.inner.active_global.load(Ordering::Acquire)
    }

    /// Start the engine loop (idempotent; also implied by the first
    /// `schedule` or `execute_now`).
    pub async fn start(&self) {
        self.inner.ensure_started();
    }

    /// Register a job. Fails with a conflict when the name is taken and
    /// the definition does not request upsert semantics.
    pub async fn register_job(&self, def: JobDefinition) -> Result<JobHandle, SchedulerError> {
        self.inner.ensure_accepting()?;
        let existing = self.inner.store.get_job(&def.name).await?;
        if existing.is_some() && !def.upsert {
            return Err(SchedulerError::Conflict(format!(
                "job already registered: {}",
                def.name
            )));
        }
        let paused = existing.map(|j| j.paused).unwrap_or(false);
        self.inner.store.upsert_job(def.to_record(paused)).await?;
        self.inner.jobs.insert(
            def.name.clone(),
            Arc::new(JobRuntime {
                handler: def.handler.clone(),
                limiter: def
                    .rate_limit
                    .as_ref()
                    .map(|cfg| Arc::new(RateLimiter::new(cfg, self.inner.clock.clone()))),
                pending_remove: std::sync::atomic::AtomicBool::new(false),
            }),
        );
        debug!(job = %def.name, "job registered");
        Ok(JobHandle {
            name: def.name,
            inner: self.inner.clone(),
        })
    }

    /// Create a trigger for a registered job. Validates the options,
    /// computes the initial fire, persists the trigger, and emits
    /// `scheduled`.
    pub async fn schedule(
        &self,
        job: &str,
        options: TriggerOptions,
    ) -> Result<TriggerHandle, SchedulerError> {
        self.inner.ensure_accepting()?;
        if self.inner.store.get_job(job).await?.is_none() {
            return Err(SchedulerError::NotFound {
                what: "job",
                name: job.to_string(),
            });
        }

        // Idempotent enqueue: an existing live trigger with the same key wins.
        if let Some(key) = &options.idempotency_key {
            for trigger in self.inner.store.list_triggers().await? {
                if trigger.job == job && trigger.options.idempotency_key.as_deref() == Some(key) {
                    return Ok(TriggerHandle {
                        id: trigger.id,
                        job: trigger.job,
                        inner: self.inner.clone(),
                    });
                }
            }
        }

        let now = self.inner.clock.now();
        let mut options = options;
        // Anchor interval and rrule series at creation so replanning is
        // stable across restarts and engines.
        if options.start_at.is_none() {
            if let TriggerKind::Every { .. } | TriggerKind::Rrule { .. } = options.kind {
                options.start_at = Some(now);
            }
        }

        let mut planner = TriggerPlanner::new(&options, now)?;
        let from = options.start_at.map_or(now, |s| s.max(now));
        let first_at = planner
            .first(from)?
            .ok_or_else(|| SchedulerError::Validation("trigger would never fire".into()))?;

        let trigger = Trigger {
            id: TriggerId::new(),
            job: job.to_string(),
            priority: options.priority,
            metadata: options.metadata.clone(),
            options,
            next_run_at: Some(first_at),
            last_run_at: None,
            failure_count: 0,
            paused: false,
            revision: Revision::NONE,
            lease_owner: None,
            leased_until: None,
        };
        let id = trigger.id;
        self.inner.store.upsert_trigger(trigger).await?;
        {
            let mut planners = self.inner.lock_planners();
            planners.insert(id, planner);
        }

        self.inner.bus.emit(SchedulerEvent::Scheduled(ScheduledEvent {
            job: job.to_string(),
            trigger_id: id,
            run_id: None,
            at: first_at,
        }));
        info!(job, trigger_id = %id, at = %first_at, "trigger scheduled");

        self.inner.ensure_started();
        self.inner.wake.notify_one();
        Ok(TriggerHandle {
            id,
            job: job.to_string(),
            inner: self.inner.clone(),
        })
    }

    /// Fire a job once, now (or at `overrides.run_at`). Returns the ids of
    /// the one-shot trigger and its run.
    pub async fn execute_now(
        &self,
        job: &str,
        overrides: Option<ExecuteNowOptions>,
    ) -> Result<(TriggerId, RunId), SchedulerError> {
        self.inner.ensure_accepting()?;
        if self.inner.store.get_job(job).await?.is_none() {
            return Err(SchedulerError::NotFound {
                what: "job",
                name: job.to_string(),
            });
        }

        let overrides = overrides.unwrap_or_default();
        let run_at = overrides.run_at.unwrap_or_else(|| self.inner.clock.now());
        let mut options = TriggerOptions::at(run_at).with_max_runs(1);
        if let Some(payload) = overrides.payload {
            options = options.with_metadata(payload);
        }

        // The engine feeds this run through its pending queue directly, so
        // the trigger is persisted already exhausted (for lineage) and is
        // never picked up by a drainer.
        let trigger = Trigger {
            id: TriggerId::new(),
            job: job.to_string(),
            priority: 0,
            metadata: options.metadata.clone(),
            options,
            next_run_at: None,
            last_run_at: None,
            failure_count: 0,
            paused: false,
            revision: Revision::NONE,
            lease_owner: None,
            leased_until: None,
        };
        let trigger_id = trigger.id;
        self.inner.store.upsert_trigger(trigger).await?;

        let run_id = self.inner.next_run_id();
        let run = Run {
            run_id: run_id.clone(),
            trigger_id,
            job: job.to_string(),
            scheduled_at: run_at,
            started_at: None,
            ended_at: None,
            attempt: 1,
            status: RunStatus::Pending,
            progress: None,
            heartbeat_at: None,
            result: None,
            error: None,
        };
        self.inner.store.record_run_start(run).await?;
        {
            let mut pending = self.inner.lock_pending();
            pending.push(Reverse(PendingRun {
                at: run_at,
                run_id: run_id.clone(),
                trigger_id,
                job: job.to_string(),
            }));
        }
        self.inner.bus.emit(SchedulerEvent::Scheduled(ScheduledEvent {
            job: job.to_string(),
            trigger_id,
            run_id: Some(run_id.clone()),
            at: run_at,
        }));

        self.inner.ensure_started();
        self.inner.wake.notify_one();
        Ok((trigger_id, run_id))
    }

    /// Pause the whole scheduler: the drainer and pending queue stop, but
    /// in-flight runs continue.
    pub async fn pause_all(&self) -> Result<(), SchedulerError> {
        self.inner.ensure_accepting()?;
        self.inner.ensure_started();
        {
            let mut state = self.inner.lock_state();
            if *state == EngineState::Running {
                *state = EngineState::Paused;
            }
        }
        self.inner
            .bus
            .emit(SchedulerEvent::Paused(PausedEvent { job: None }));
        Ok(())
    }

    /// Resume a paused scheduler.
    pub async fn resume_all(&self) -> Result<(), SchedulerError> {
        self.inner.ensure_accepting()?;
        {
            let mut state = self.inner.lock_state();
            if *state == EngineState::Paused {
                *state = EngineState::Running;
            }
        }
        self.inner
            .bus
            .emit(SchedulerEvent::Resumed(ResumedEvent { job: None }));
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Fetch a run record.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, SchedulerError> {
        Ok(self.inner.store.get_run(run_id).await?)
    }

    /// Stop the engine. Graceful shutdown signals cancellation to in-flight
    /// handlers, waits up to the grace period, then releases held leases.
    pub async fn shutdown(&self, opts: ShutdownOptions) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.lock_state();
            if *state == EngineState::Stopped {
                return Ok(());
            }
            *state = EngineState::Draining;
        }

        let in_flight = self.inner.active_global.load(Ordering::Acquire);
        let grace = opts.grace.unwrap_or(self.inner.config.default_grace);
        self.inner.bus.emit(SchedulerEvent::Drain(DrainEvent {
            in_flight,
            grace_ms: opts.graceful.then(|| grace.as_millis() as u64),
        }));
        info!(in_flight, graceful = opts.graceful, "scheduler draining");

        self.inner.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.lock_tasks();
            tasks.drain(..).collect()
        };
        let loop_handle = self.inner.lock_loop_handle().take();

        if opts.graceful {
            let grace_cancel = CancellationToken::new();
            tokio::select! {
                _ = futures::future::join_all(tasks) => {}
                _ = self.inner.clock.sleep(grace, &grace_cancel) => {
                    warn!("grace period elapsed with runs still in flight");
                }
            }
            if let Some(handle) = loop_handle {
                let _ = handle.await;
            }
        } else {
            for task in tasks {
                task.abort();
            }
            if let Some(handle) = loop_handle {
                handle.abort();
            }
        }

        self.inner.release_held_leases().await;
        *self.inner.lock_state() = EngineState::Stopped;
        self.inner.bus.emit(SchedulerEvent::Shutdown(ShutdownEvent {
            graceful: opts.graceful,
            reason: opts.reason,
        }));
        info!("scheduler stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("instance_id", &self.inner.config.instance_id)
            .field("state", &self.inner.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Handle to a registered job.
pub struct JobHandle {
    name: String,
    inner: Arc<EngineInner>,
}

impl JobHandle {
    /// The job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pause the job: its triggers stay due but admit no runs.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.inner.store.set_job_paused(&self.name, true).await?;
        self.inner.bus.emit(SchedulerEvent::Paused(PausedEvent {
            job: Some(self.name.clone()),
        }));
        Ok(())
    }

    /// Resume the job.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.inner.store.set_job_paused(&self.name, false).await?;
        self.inner.bus.emit(SchedulerEvent::Resumed(ResumedEvent {
            job: Some(self.name.clone()),
        }));
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Remove the job and its triggers. With runs in flight, removal is
    /// deferred until the last one terminates.
    pub async fn unregister(&self) -> Result<(), SchedulerError> {
        let active = self
            .inner
            .jobs_active
            .get(&self.name)
            .map(|c| *c)
            .unwrap_or(0);
        if active > 0 {
            if let Some(runtime) = self.inner.jobs.get(&self.name) {
                runtime.pending_remove.store(true, Ordering::Release);
            }
            debug!(job = %self.name, active, "unregister deferred until runs finish");
            return Ok(());
        }
        self.inner.finalize_unregister(&self.name).await;
        Ok(())
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("name", &self.name).finish()
    }
}

/// Handle to a scheduled trigger.
pub struct TriggerHandle {
    id: TriggerId,
    job: String,
    inner: Arc<EngineInner>,
}

impl TriggerHandle {
    /// The trigger id.
    pub fn id(&self) -> TriggerId {
        self.id
    }

    /// The owning job name.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Pause this trigger.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.set_paused(true).await
    }

    /// Resume this trigger.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.set_paused(false).await?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Remove the trigger. In-flight runs it spawned are not aborted.
    pub async fn cancel(&self) -> Result<(), SchedulerError> {
        self.inner.store.delete_trigger(&self.id).await?;
        self.inner.lock_planners().remove(&self.id);
        debug!(trigger_id = %self.id, "trigger canceled");
        Ok(())
    }

    async fn set_paused(&self, paused: bool) -> Result<(), SchedulerError> {
        let mut trigger =
            self.inner
                .store
                .get_trigger(&self.id)
                .await?
                .ok_or(SchedulerError::NotFound {
                    what: "trigger",
                    name: self.id.to_string(),
                })?;
        trigger.paused = paused;
        self.inner.store.upsert_trigger(trigger).await?;
        Ok(())
    }
}

impl std::fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerHandle")
            .field("id", &self.id)
            .field("job", &self.job)
            .finish()
    }
}

// =============================================================================
// Engine Internals
// =============================================================================

impl EngineInner {
    fn state(&self) -> EngineState {
        *self.lock_state()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_planners(&self) -> std::sync::MutexGuard<'_, HashMap<TriggerId, TriggerPlanner>> {
        match self.planners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Reverse<PendingRun>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_loop_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.loop_handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_accepting(&self) -> Result<(), SchedulerError> {
        match self.state() {
            EngineState::Draining | EngineState::Stopped => Err(SchedulerError::State(
                "scheduler is shutting down".into(),
            )),
            _ => Ok(()),
        }
    }

    fn ensure_started(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if *state != EngineState::Created {
            return;
        }
        *state = EngineState::Running;
        drop(state);

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            inner.run_loop().await;
        });
        *self.lock_loop_handle() = Some(handle);
    }

    fn next_run_id(&self) -> RunId {
        let seq = self.run_seq.fetch_add(1, Ordering::AcqRel) + 1;
        RunId::compose(&self.config.instance_id, seq)
    }

    // --- main loop ----------------------------------------------------------

    async fn run_loop(self: Arc<Self>) {
        info!(instance = %self.config.instance_id, "scheduler engine started");
        let hb = self.config.heartbeat_interval;
        let mut next_sweep = self.clock.now()
            + chrono::Duration::from_std(hb).unwrap_or_else(|_| chrono::Duration::seconds(30));

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let state = self.state();
            if matches!(state, EngineState::Draining | EngineState::Stopped) {
                break;
            }

            if state == EngineState::Running {
                self.drain_pass().await;
                self.dispatch_pending().await;

                let now = self.clock.now();
                if now >= next_sweep {
                    self.sweep_stalled(now).await;
                    self.lock_tasks().retain(|h| !h.is_finished());
                    next_sweep = now
                        + chrono::Duration::from_std(hb)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                }
            }

            let now = self.clock.now();
            let mut wake_at = next_sweep;
            if state == EngineState::Running {
                if let Some(at) = self.earliest_trigger_at().await {
                    wake_at = wake_at.min(at);
                }
                if let Some(at) = self.earliest_pending_at() {
                    wake_at = wake_at.min(at);
                }
            }
            let sleep = (wake_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(self.config.min_tick, hb);

            tokio::select! {
                _ = self.wake.notified() => {}
                res = self.clock.sleep(sleep, &self.shutdown) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(instance = %self.config.instance_id, "engine loop exited");
    }

    async fn earliest_trigger_at(&self) -> Option<DateTime<Utc>> {
        let triggers = self.store.list_triggers().await.ok()?;
        triggers
            .iter()
            .filter(|t| !t.paused)
            .filter_map(|t| t.next_run_at)
            .min()
    }

    fn earliest_pending_at(&self) -> Option<DateTime<Utc>> {
        self.lock_pending().peek().map(|Reverse(p)| p.at)
    }

    // --- drain --------------------------------------------------------------

    async fn drain_pass(self: &Arc<Self>) {
        let now = self.clock.now();
        let until = now
            + chrono::Duration::from_std(self.config.horizon)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let due = match self
            .store
            .list_due_triggers(until, self.config.drain_batch)
            .await
        {
            Ok(due) => {
                self.store_failures.store(0, Ordering::Release);
                due
            }
            Err(e) => {
                self.on_store_failure(e).await;
                return;
            }
        };

        for trigger in due {
            if self.shutdown.is_cancelled() || self.state() != EngineState::Running {
                break;
            }
            if let Err(e) = self.process_due_trigger(trigger).await {
                if let SchedulerError::Store(store_err) = e {
                    self.on_store_failure(store_err).await;
                } else {
                    warn!(error = %e, "drain error");
                }
            }
        }
    }

    async fn process_due_trigger(self: &Arc<Self>, trigger: Trigger) -> Result<(), SchedulerError> {
        let id = trigger.id;
        if !self
            .store
            .claim_trigger(&id, &self.config.instance_id, self.config.lease)
            .await?
        {
            return Ok(());
        }
        let result = self.fire_claimed(id).await;
        // Release even when firing failed; the lease must not outlive the pass.
        let release = self
            .store
            .release_trigger(&id, &self.config.instance_id)
            .await;
        result?;
        release?;
        Ok(())
    }

    async fn fire_claimed(self: &Arc<Self>, id: TriggerId) -> Result<(), SchedulerError> {
        // Re-read after the claim: the claim bumped the revision.
        let Some(mut trigger) = self.store.get_trigger(&id).await? else {
            return Ok(());
        };
        let Some(next_run_at) = trigger.next_run_at else {
            return Ok(());
        };

        let Some(job) = self.store.get_job(&trigger.job).await? else {
            warn!(trigger_id = %id, job = %trigger.job, "orphan trigger; deleting");
            self.store.delete_trigger(&id).await?;
            self.lock_planners().remove(&id);
            self.bus.emit(SchedulerEvent::Error(ErrorEvent {
                run_id: None,
                trigger_id: Some(id),
                job: Some(trigger.job.clone()),
                message: format!("trigger {id} references unknown job {}", trigger.job),
            }));
            return Ok(());
        };
        let now = self.clock.now();
        let mut planner = {
            let mut planners = self.lock_planners();
            planners.remove(&id)
        };
        let mut planner = match planner.take() {
            Some(p) => p,
            None => match TriggerPlanner::new(&trigger.options, now) {
                Ok(p) => p,
                Err(e) => {
                    // A trigger whose options no longer parse cannot make
                    // progress; pause it instead of spinning.
                    warn!(trigger_id = %id, error = %e, "unplannable trigger; pausing");
                    self.bus.emit(SchedulerEvent::Error(ErrorEvent {
                        run_id: None,
                        trigger_id: Some(id),
                        job: Some(trigger.job.clone()),
                        message: e.to_string(),
                    }));
                    trigger.paused = true;
                    self.update_trigger(trigger).await;
                    return Ok(());
                }
            },
        };

        if job.paused {
            // A paused job reschedules without firing, so lag does not pile
            // up behind the pause and cascade into the misfire path on
            // resume.
            match self.plan_next(&mut planner, now, &trigger) {
                None => {
                    debug!(trigger_id = %id, "trigger exhausted while job paused; deleting");
                    self.store.delete_trigger(&id).await?;
                }
                Some(next) => {
                    trigger.next_run_at = Some(next);
                    self.update_trigger(trigger).await;
                    self.lock_planners().insert(id, planner);
                }
            }
            return Ok(());
        }

        let runtime = self.jobs.get(&trigger.job).map(|r| r.value().clone());
        let tolerance = chrono::Duration::from_std(self.config.misfire_tolerance)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let lag = now - next_run_at;

        let mut last_fired: Option<DateTime<Utc>> = None;
        let mut new_next: Option<DateTime<Utc>> = Some(next_run_at);
        let mut changed = false;

        if lag > tolerance {
            match trigger.options.misfire_policy {
                MisfirePolicy::Skip => {
                    debug!(trigger_id = %id, lag_ms = lag.num_milliseconds(), "misfire: skipping");
                    new_next = self.plan_next(&mut planner, now, &trigger);
                    changed = true;
                }
                MisfirePolicy::FireNow => {
                    match self
                        .admit_and_fire(&trigger, &job, runtime.as_ref(), now)
                        .await?
                    {
                        FireOutcome::Fired => {
                            last_fired = Some(now);
                            new_next = self.plan_next(&mut planner, now, &trigger);
                            changed = true;
                        }
                        FireOutcome::Deferred => {}
                    }
                }
                MisfirePolicy::CatchUp => {
                    let mut slot = next_run_at;
                    let mut fired = 0usize;
                    loop {
                        match self
                            .admit_and_fire(&trigger, &job, runtime.as_ref(), slot)
                            .await?
                        {
                            FireOutcome::Fired => {
                                last_fired = Some(slot);
                                fired += 1;
                                changed = true;
                            }
                            FireOutcome::Deferred => {
                                new_next = Some(slot);
                                break;
                            }
                        }
                        match self.plan_next(&mut planner, slot, &trigger) {
                            Some(n) if n <= now => {
                                if fired >= self.config.catch_up_cap {
                                    new_next = Some(n);
                                    break;
                                }
                                slot = n;
                            }
                            other => {
                                new_next = other;
                                break;
                            }
                        }
                    }
                }
            }
        } else {
            match self
                .admit_and_fire(&trigger, &job, runtime.as_ref(), next_run_at)
                .await?
            {
                FireOutcome::Fired => {
                    last_fired = Some(next_run_at);
                    new_next = self.plan_next(&mut planner, next_run_at, &trigger);
                    changed = true;
                }
                FireOutcome::Deferred => {}
            }
        }

        match new_next {
            None => {
                debug!(trigger_id = %id, "trigger exhausted; deleting");
                self.store.delete_trigger(&id).await?;
            }
            Some(next) => {
                if changed {
                    trigger.next_run_at = Some(next);
                    if let Some(at) = last_fired {
                        trigger.last_run_at = Some(at);
                    }
                    self.update_trigger(trigger).await;
                }
                self.lock_planners().insert(id, planner);
            }
        }
        Ok(())
    }

    /// Planner step with the cap error folded into exhaustion (plus an
    /// `error` event); keeps the drain loop free of planner failures.
    fn plan_next(
        &self,
        planner: &mut TriggerPlanner,
        after: DateTime<Utc>,
        trigger: &Trigger,
    ) -> Option<DateTime<Utc>> {
        match planner.next(after) {
            Ok(next) => next,
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "planner gave up; exhausting trigger");
                self.bus.emit(SchedulerEvent::Error(ErrorEvent {
                    run_id: None,
                    trigger_id: Some(trigger.id),
                    job: Some(trigger.job.clone()),
                    message: e.to_string(),
                }));
                None
            }
        }
    }

    /// Persist a trigger advance, retrying once on a concurrent revision
    /// bump (for example a user pausing the trigger mid-fire).
    async fn update_trigger(&self, trigger: Trigger) {
        let id = trigger.id;
        match self.store.upsert_trigger(trigger.clone()).await {
            Ok(_) => {}
            Err(StoreError::Conflict) => {
                let fresh = match self.store.get_trigger(&id).await {
                    Ok(Some(fresh)) => fresh,
                    _ => return,
                };
                let mut merged = fresh;
                merged.next_run_at = trigger.next_run_at;
                merged.last_run_at = trigger.last_run_at;
                merged.failure_count = trigger.failure_count;
                if let Err(e) = self.store.upsert_trigger(merged).await {
                    warn!(trigger_id = %id, error = %e, "trigger advance lost");
                }
            }
            Err(e) => {
                warn!(trigger_id = %id, error = %e, "trigger update failed");
            }
        }
    }

    // --- admission & firing -------------------------------------------------

    fn try_admit(self: &Arc<Self>, job: &JobRecord) -> Option<RunGuard> {
        let prev = self.active_global.fetch_add(1, Ordering::AcqRel);
        if prev >= self.config.max_concurrent_runs {
            self.active_global.fetch_sub(1, Ordering::AcqRel);
            return None;
        }

        let mut over = false;
        self.jobs_active
            .entry(job.name.clone())
            .and_modify(|count| {
                if *count >= job.concurrency as usize {
                    over = true;
                } else {
                    *count += 1;
                }
            })
            .or_insert(1);
        if over {
            self.active_global.fetch_sub(1, Ordering::AcqRel);
            return None;
        }

        Some(RunGuard {
            inner: self.clone(),
            job: job.name.clone(),
        })
    }

    async fn admit_and_fire(
        self: &Arc<Self>,
        trigger: &Trigger,
        job: &JobRecord,
        runtime: Option<&Arc<JobRuntime>>,
        slot: DateTime<Utc>,
    ) -> Result<FireOutcome, SchedulerError> {
        if self.state() != EngineState::Running {
            return Ok(FireOutcome::Deferred);
        }

        // The horizon look-ahead claims triggers slightly early. A future
        // slot is recorded now but only starts at its planned instant, via
        // the pending queue; admission happens at dispatch.
        if slot > self.clock.now() {
            self.queue_run(trigger, job, slot).await?;
            return Ok(FireOutcome::Fired);
        }

        let Some(guard) = self.try_admit(job) else {
            return Ok(FireOutcome::Deferred);
        };

        // Rate limiting: a short wait (one tick) is absorbed here; a longer
        // one defers the fire to a later pass.
        if let Some(limiter) = runtime.and_then(|r| r.limiter.clone()) {
            let wait = limiter.ms_until(1);
            if wait > 0 {
                if wait > self.config.min_tick.as_millis() as u64 {
                    return Ok(FireOutcome::Deferred);
                }
                if self
                    .clock
                    .sleep(Duration::from_millis(wait), &self.shutdown)
                    .await
                    .is_err()
                {
                    return Ok(FireOutcome::Deferred);
                }
            }
            if !limiter.try_take(1) {
                return Ok(FireOutcome::Deferred);
            }
        }

        self.fire_run(trigger, job, slot, guard).await?;
        Ok(FireOutcome::Fired)
    }

    /// Record a claimed-but-future fire as a pending run and queue it for
    /// dispatch at its planned instant.
    async fn queue_run(
        self: &Arc<Self>,
        trigger: &Trigger,
        job: &JobRecord,
        slot: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let run_id = self.next_run_id();
        let run = Run {
            run_id: run_id.clone(),
            trigger_id: trigger.id,
            job: job.name.clone(),
            scheduled_at: slot,
            started_at: None,
            ended_at: None,
            attempt: 1,
            status: RunStatus::Pending,
            progress: None,
            heartbeat_at: None,
            result: None,
            error: None,
        };
        self.store.record_run_start(run).await?;
        {
            let mut pending = self.lock_pending();
            pending.push(Reverse(PendingRun {
                at: slot,
                run_id: run_id.clone(),
                trigger_id: trigger.id,
                job: job.name.clone(),
            }));
        }
        self.bus.emit(SchedulerEvent::Scheduled(ScheduledEvent {
            job: job.name.clone(),
            trigger_id: trigger.id,
            run_id: Some(run_id),
            at: slot,
        }));
        Ok(())
    }

    async fn fire_run(
        self: &Arc<Self>,
        trigger: &Trigger,
        job: &JobRecord,
        slot: DateTime<Utc>,
        guard: RunGuard,
    ) -> Result<(), SchedulerError> {
        let run_id = self.next_run_id();
        let run = Run {
            run_id: run_id.clone(),
            trigger_id: trigger.id,
            job: job.name.clone(),
            scheduled_at: slot,
            started_at: None,
            ended_at: None,
            attempt: 1,
            status: RunStatus::Pending,
            progress: None,
            heartbeat_at: None,
            result: None,
            error: None,
        };
        self.store.record_run_start(run.clone()).await?;
        self.bus.emit(SchedulerEvent::Scheduled(ScheduledEvent {
            job: job.name.clone(),
            trigger_id: trigger.id,
            run_id: Some(run_id),
            at: slot,
        }));

        self.start_run(run, job.clone(), guard).await
    }

    /// Transition a pending run to running and spawn its executor.
    async fn start_run(
        self: &Arc<Self>,
        mut run: Run,
        job: JobRecord,
        guard: RunGuard,
    ) -> Result<(), SchedulerError> {
        let started = self.clock.now();
        run.status = RunStatus::Running;
        run.started_at = Some(started);
        run.heartbeat_at = Some(started);
        self.store.record_run_start(run.clone()).await?;
        self.bus.emit(SchedulerEvent::Run(RunStartedEvent {
            run_id: run.run_id.clone(),
            trigger_id: run.trigger_id,
            job: run.job.clone(),
            attempt: run.attempt,
            scheduled_at: run.scheduled_at,
            started_at: started,
        }));

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            inner.execute_run(run, job, guard).await;
        });
        self.lock_tasks().push(handle);
        Ok(())
    }

    async fn execute_run(self: Arc<Self>, run: Run, job: JobRecord, guard: RunGuard) {
        let cancel = self.shutdown.child_token();
        let touch = TouchHandle::new(
            self.store.clone(),
            self.bus.clone(),
            run.run_id.clone(),
            run.trigger_id,
            run.job.clone(),
        );

        // Engine-maintained heartbeat while the handler runs, so handlers
        // that never call touch() still avoid spurious stalls.
        let hb_cancel = cancel.clone();
        let hb_store = self.store.clone();
        let hb_run_id = run.run_id.clone();
        let hb_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(hb_interval);
            interval.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = hb_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = hb_store.touch_run(&hb_run_id, None).await {
                            warn!(run_id = %hb_run_id, error = %e, "engine heartbeat failed");
                        }
                    }
                }
            }
        });

        let payload = self.resolve_payload(&run, &job).await;
        let span = tracing::info_span!(
            "run",
            run_id = %run.run_id,
            trigger_id = %run.trigger_id,
            job = %run.job,
            attempt = run.attempt,
        );
        let ctx = RunContext {
            run_id: run.run_id.clone(),
            trigger_id: run.trigger_id,
            job: run.job.clone(),
            payload,
            scheduled_at: run.scheduled_at,
            attempt: run.attempt,
            cancel: cancel.clone(),
            touch,
            logger: span.clone(),
            clock: self.clock.clone(),
        };

        let handler = self.jobs.get(&run.job).and_then(|r| r.handler.clone());
        let outcome = match (handler, &job.worker) {
            (Some(handler), _) => {
                let fut = async { handler.run(ctx).await }.instrument(span);
                self.run_bounded(fut, job.timeout, &cancel).await
            }
            (None, Some(definition)) => match self.worker_executor.clone() {
                Some(executor) => {
                    let definition = definition.clone();
                    let fut =
                        async move { executor.execute(&definition, ctx).await }.instrument(span);
                    self.run_bounded(fut, job.timeout, &cancel).await
                }
                None => RunOutcome::Misconfigured(format!(
                    "job {} has a worker definition but no worker executor is registered",
                    run.job
                )),
            },
            (None, None) => RunOutcome::Misconfigured(format!(
                "job {} has neither a handler nor a worker definition",
                run.job
            )),
        };

        // Stop the heartbeat (and signal any cooperative work the handler
        // left behind).
        cancel.cancel();
        let _ = heartbeat.await;

        self.finish_run(run, &job, outcome).await;
        drop(guard);
    }

    async fn run_bounded<F>(
        &self,
        fut: F,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> RunOutcome
    where
        F: std::future::Future<Output = anyhow::Result<Option<Value>>>,
    {
        let work = async {
            match timeout {
                Some(limit) => {
                    let timer_cancel = CancellationToken::new();
                    tokio::select! {
                        res = fut => match res {
                            Ok(value) => RunOutcome::Success(value),
                            Err(e) => RunOutcome::Failed(format!("{e:#}")),
                        },
                        _ = self.clock.sleep(limit, &timer_cancel) => RunOutcome::TimedOut(limit),
                    }
                }
                None => match fut.await {
                    Ok(value) => RunOutcome::Success(value),
                    Err(e) => RunOutcome::Failed(format!("{e:#}")),
                },
            }
        };

        // Biased so that a cancellation arriving together with a handler
        // result deterministically wins.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => RunOutcome::Canceled,
            outcome = work => outcome,
        }
    }

    async fn resolve_payload(&self, run: &Run, job: &JobRecord) -> Option<Value> {
        match self.store.get_trigger(&run.trigger_id).await {
            Ok(Some(trigger)) => trigger.metadata.or_else(|| job.metadata.clone()),
            _ => job.metadata.clone(),
        }
    }

    async fn finish_run(&self, run: Run, job: &JobRecord, outcome: RunOutcome) {
        let ended = self.clock.now();
        match outcome {
            RunOutcome::Success(result) => {
                debug!(run_id = %run.run_id, job = %run.job, "run completed");
                self.end_run(
                    &run.run_id,
                    RunEnd {
                        status: RunStatus::Completed,
                        ended_at: ended,
                        result: result.clone(),
                        error: None,
                    },
                )
                .await;
                self.bus.emit(SchedulerEvent::Completed(CompletedEvent {
                    run_id: run.run_id.clone(),
                    trigger_id: run.trigger_id,
                    job: run.job.clone(),
                    attempt: run.attempt,
                    result,
                    ended_at: ended,
                }));
                self.reset_failure_count(run.trigger_id).await;
            }
            RunOutcome::Canceled => {
                debug!(run_id = %run.run_id, job = %run.job, "run canceled");
                self.end_run(
                    &run.run_id,
                    RunEnd {
                        status: RunStatus::Canceled,
                        ended_at: ended,
                        result: None,
                        error: Some("canceled by shutdown".into()),
                    },
                )
                .await;
                self.bus.emit(SchedulerEvent::Canceled(CanceledEvent {
                    run_id: run.run_id.clone(),
                    trigger_id: run.trigger_id,
                    job: run.job.clone(),
                    attempt: run.attempt,
                    reason: "canceled by shutdown".into(),
                }));
            }
            RunOutcome::TimedOut(limit) => {
                let message = SchedulerError::Timeout { timeout: limit }.to_string();
                warn!(run_id = %run.run_id, job = %run.job, %message, "run timed out");
                self.fail_run(run, job, message).await;
            }
            RunOutcome::Failed(message) => {
                warn!(run_id = %run.run_id, job = %run.job, error = %message, "run failed");
                self.fail_run(run, job, message).await;
            }
            RunOutcome::Misconfigured(message) => {
                // Not retried: a configuration error does not heal by itself.
                error!(run_id = %run.run_id, job = %run.job, %message, "run misconfigured");
                self.end_run(
                    &run.run_id,
                    RunEnd {
                        status: RunStatus::Failed,
                        ended_at: ended,
                        result: None,
                        error: Some(message.clone()),
                    },
                )
                .await;
                self.bump_failure_count(run.trigger_id).await;
                self.bus.emit(SchedulerEvent::Error(ErrorEvent {
                    run_id: Some(run.run_id),
                    trigger_id: Some(run.trigger_id),
                    job: Some(run.job),
                    message,
                }));
            }
        }
    }

    /// Terminal failure handling: record the attempt as failed, then either
    /// schedule a retry (`retry` event) or surface the exhaustion (`error`
    /// event).
    async fn fail_run(&self, run: Run, job: &JobRecord, message: String) {
        let ended = self.clock.now();
        self.end_run(
            &run.run_id,
            RunEnd {
                status: RunStatus::Failed,
                ended_at: ended,
                result: None,
                error: Some(message.clone()),
            },
        )
        .await;
        self.bump_failure_count(run.trigger_id).await;

        if !self.schedule_retry(&run, job).await {
            self.bus.emit(SchedulerEvent::Error(ErrorEvent {
                run_id: Some(run.run_id),
                trigger_id: Some(run.trigger_id),
                job: Some(run.job),
                message,
            }));
        }
    }

    /// Schedule the next attempt if the job's policy has attempts left.
    /// Returns whether a retry was scheduled.
    async fn schedule_retry(&self, run: &Run, job: &JobRecord) -> bool {
        let Some(retry) = &job.retry else {
            return false;
        };
        if run.attempt >= retry.max_attempts {
            return false;
        }
        if self.state() == EngineState::Stopped {
            return false;
        }

        let next_attempt = run.attempt + 1;
        let delay = retry.strategy.next_delay(next_attempt);
        let at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let next_run_id = self.next_run_id();

        let retry_run = Run {
            run_id: next_run_id.clone(),
            trigger_id: run.trigger_id,
            job: run.job.clone(),
            scheduled_at: at,
            started_at: None,
            ended_at: None,
            attempt: next_attempt,
            status: RunStatus::Pending,
            progress: None,
            heartbeat_at: None,
            result: None,
            error: None,
        };
        if let Err(e) = self.store.record_run_start(retry_run).await {
            warn!(run_id = %next_run_id, error = %e, "failed to record retry run");
            return false;
        }

        {
            let mut pending = self.lock_pending();
            pending.push(Reverse(PendingRun {
                at,
                run_id: next_run_id.clone(),
                trigger_id: run.trigger_id,
                job: run.job.clone(),
            }));
        }
        self.bus.emit(SchedulerEvent::Retry(RetryEvent {
            run_id: run.run_id.clone(),
            next_run_id,
            trigger_id: run.trigger_id,
            job: run.job.clone(),
            attempt: next_attempt,
            delay_ms: delay.as_millis() as u64,
            at,
        }));
        debug!(job = %run.job, attempt = next_attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
        self.wake.notify_one();
        true
    }

    async fn end_run(&self, run_id: &RunId, end: RunEnd) {
        match self.store.record_run_end(run_id, end).await {
            Ok(()) => {}
            Err(StoreError::State(msg)) => {
                debug!(run_id = %run_id, %msg, "run already ended");
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to record run end");
            }
        }
    }

    async fn bump_failure_count(&self, trigger_id: TriggerId) {
        if let Ok(Some(mut trigger)) = self.store.get_trigger(&trigger_id).await {
            trigger.failure_count = trigger.failure_count.saturating_add(1);
            self.update_trigger(trigger).await;
        }
    }

    async fn reset_failure_count(&self, trigger_id: TriggerId) {
        if let Ok(Some(mut trigger)) = self.store.get_trigger(&trigger_id).await {
            if trigger.failure_count != 0 {
                trigger.failure_count = 0;
                self.update_trigger(trigger).await;
            }
        }
    }

    // --- pending queue ------------------------------------------------------

    async fn dispatch_pending(self: &Arc<Self>) {
        loop {
            let now = self.clock.now();
            // Peek and pop under one lock so a concurrently-pushed earlier
            // entry cannot be popped and dropped unprocessed.
            let entry = {
                let mut pending = self.lock_pending();
                match pending.peek() {
                    Some(Reverse(head)) if head.at <= now => {
                        pending.pop().map(|Reverse(p)| p)
                    }
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            if self.state() != EngineState::Running {
                self.lock_pending().push(Reverse(entry));
                break;
            }

            let run = match self.store.get_run(&entry.run_id).await {
                Ok(Some(run)) if run.status == RunStatus::Pending => run,
                Ok(_) => continue, // canceled or already handled
                Err(e) => {
                    warn!(run_id = %entry.run_id, error = %e, "pending lookup failed");
                    continue;
                }
            };

            let job = match self.store.get_job(&entry.job).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    self.end_run(
                        &entry.run_id,
                        RunEnd {
                            status: RunStatus::Canceled,
                            ended_at: now,
                            result: None,
                            error: Some("job removed".into()),
                        },
                    )
                    .await;
                    self.bus.emit(SchedulerEvent::Canceled(CanceledEvent {
                        run_id: entry.run_id.clone(),
                        trigger_id: entry.trigger_id,
                        job: entry.job.clone(),
                        attempt: run.attempt,
                        reason: "job removed".into(),
                    }));
                    continue;
                }
                Err(e) => {
                    warn!(run_id = %entry.run_id, error = %e, "pending job lookup failed");
                    self.lock_pending().push(Reverse(entry));
                    break;
                }
            };

            if job.paused {
                self.lock_pending().push(Reverse(entry));
                break;
            }
            let Some(guard) = self.try_admit(&job) else {
                self.lock_pending().push(Reverse(entry));
                break;
            };
            if let Some(limiter) = self.jobs.get(&entry.job).and_then(|r| r.limiter.clone()) {
                if !limiter.try_take(1) {
                    drop(guard);
                    self.lock_pending().push(Reverse(entry));
                    break;
                }
            }

            if let Err(e) = self.start_run(run, job, guard).await {
                warn!(run_id = %entry.run_id, error = %e, "failed to start pending run");
            }
        }
    }

    // --- stall sweeper ------------------------------------------------------

    async fn sweep_stalled(&self, now: DateTime<Utc>) {
        let stalled = match self
            .store
            .find_stalled_runs(self.config.stalled_after, now)
            .await
        {
            Ok(stalled) => stalled,
            Err(e) => {
                warn!(error = %e, "stall sweep query failed");
                return;
            }
        };

        for run in stalled {
            match self
                .store
                .record_run_end(
                    &run.run_id,
                    RunEnd {
                        status: RunStatus::Stalled,
                        ended_at: now,
                        result: None,
                        error: Some("heartbeat expired".into()),
                    },
                )
                .await
            {
                Ok(()) => {}
                // Lost the race against a live completion; nothing stalled.
                Err(StoreError::State(_)) => continue,
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "failed to mark run stalled");
                    continue;
                }
            }

            warn!(run_id = %run.run_id, job = %run.job, "run stalled");
            self.bus.emit(SchedulerEvent::Stalled(StalledEvent {
                run_id: run.run_id.clone(),
                trigger_id: run.trigger_id,
                job: run.job.clone(),
                attempt: run.attempt,
                heartbeat_at: run.heartbeat_at,
            }));
            self.bump_failure_count(run.trigger_id).await;

            if let Ok(Some(job)) = self.store.get_job(&run.job).await {
                self.schedule_retry(&run, &job).await;
            }
        }
    }

    // --- store failure handling ----------------------------------------------

    async fn on_store_failure(self: &Arc<Self>, err: StoreError) {
        let failures = self.store_failures.fetch_add(1, Ordering::AcqRel) + 1;
        error!(error = %err, failures, "store failure during drain");
        self.bus.emit(SchedulerEvent::Error(ErrorEvent {
            run_id: None,
            trigger_id: None,
            job: None,
            message: format!("store failure: {err}"),
        }));

        if failures >= self.config.store_failure_cap {
            error!("store failure cap reached; stopping engine");
            self.shutdown.cancel();
            self.release_held_leases().await;
            *self.lock_state() = EngineState::Stopped;
            self.bus.emit(SchedulerEvent::Shutdown(ShutdownEvent {
                graceful: false,
                reason: Some(format!("store failure cap reached: {err}")),
            }));
            return;
        }

        // Exponential backoff before the next drain attempt.
        let backoff = self
            .config
            .min_tick
            .saturating_mul(1u32 << failures.min(8))
            .min(Duration::from_secs(5));
        let _ = self.clock.sleep(backoff, &self.shutdown).await;
    }

    async fn release_held_leases(&self) {
        let Ok(triggers) = self.store.list_triggers().await else {
            return;
        };
        for trigger in triggers {
            if trigger.lease_owner.as_deref() == Some(self.config.instance_id.as_str()) {
                if let Err(e) = self
                    .store
                    .release_trigger(&trigger.id, &self.config.instance_id)
                    .await
                {
                    warn!(trigger_id = %trigger.id, error = %e, "lease release failed");
                }
            }
        }
    }

    async fn finalize_unregister(&self, job: &str) {
        let triggers = self.store.list_triggers().await.unwrap_or_default();
        for trigger in triggers {
            if trigger.job == job {
                let _ = self.store.delete_trigger(&trigger.id).await;
                self.lock_planners().remove(&trigger.id);
            }
        }
        match self.store.remove_job(job).await {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => warn!(job, error = %e, "failed to remove job"),
        }
        self.jobs.remove(job);
        debug!(job, "job unregistered");
    }
}

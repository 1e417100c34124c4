//! Job definitions, handlers, and the per-run context.
//!
//! A job pairs a unique name with an executor: either an in-process
//! [`JobHandler`] or a [`WorkerDefinition`] descriptor interpreted by a
//! [`WorkerExecutor`] plugged into the engine. Everything else on the
//! definition is policy: concurrency, timeout, retries, rate limit.
//!
//! Handlers receive a [`RunContext`] carrying the run's identity, payload,
//! a cancellation token, a [`TouchHandle`] for heartbeats/progress, a
//! run-scoped logger span, and the engine clock. Handler failure is a
//! value: return `Err` and the retry pipeline takes over.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::{ErrorEvent, EventBus, ProgressEvent, SchedulerEvent};
use crate::clock::Clock;
use crate::error::SchedulerError;
use crate::rate_limit::RateLimitConfig;
use crate::store::{JobRecord, RetryPolicy, RunId, SchedulerStore, StoreError, WorkerDefinition};
use crate::trigger::TriggerId;

// =============================================================================
// Handler Traits
// =============================================================================

/// An in-process job executor.
///
/// # Example
///
/// ```ignore
/// struct SendDigest;
///
/// #[async_trait]
/// impl JobHandler for SendDigest {
///     async fn run(&self, ctx: RunContext) -> anyhow::Result<Option<Value>> {
///         ctx.touch.touch(Some(10)).await?;
///         let sent = send_all(&ctx.cancel).await?;
///         Ok(Some(serde_json::json!({ "sent": sent })))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one run. The returned value is recorded as the run's result.
    async fn run(&self, ctx: RunContext) -> anyhow::Result<Option<Value>>;
}

/// Interprets abstract worker definitions for jobs that have no in-process
/// handler.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Execute one run described by a worker definition.
    async fn execute(
        &self,
        definition: &WorkerDefinition,
        ctx: RunContext,
    ) -> anyhow::Result<Option<Value>>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<Value>>> + Send>>;

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler {
    f: Box<dyn Fn(RunContext) -> HandlerFuture + Send + Sync>,
}

impl FnHandler {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn run(&self, ctx: RunContext) -> anyhow::Result<Option<Value>> {
        (self.f)(ctx).await
    }
}

// =============================================================================
// Run Context
// =============================================================================

/// Heartbeat/progress reporter handed to handlers.
///
/// `touch` updates the run's heartbeat and optionally its progress. An
/// out-of-range or decreasing progress value emits an `error` event and
/// leaves the recorded progress unchanged; it does not fail the run.
#[derive(Clone)]
pub struct TouchHandle {
    store: Arc<dyn SchedulerStore>,
    bus: EventBus,
    run_id: RunId,
    trigger_id: TriggerId,
    job: String,
}

impl TouchHandle {
    pub(crate) fn new(
        store: Arc<dyn SchedulerStore>,
        bus: EventBus,
        run_id: RunId,
        trigger_id: TriggerId,
        job: String,
    ) -> Self {
        Self {
            store,
            bus,
            run_id,
            trigger_id,
            job,
        }
    }

    /// Record a heartbeat, optionally with progress in 0..=100.
    pub async fn touch(&self, progress: Option<u8>) -> Result<(), SchedulerError> {
        match self.store.touch_run(&self.run_id, progress).await {
            Ok(()) => {
                if let Some(p) = progress {
                    self.bus.emit(SchedulerEvent::Progress(ProgressEvent {
                        run_id: self.run_id.clone(),
                        job: self.job.clone(),
                        progress: p,
                    }));
                }
                Ok(())
            }
            Err(StoreError::State(message)) => {
                self.bus.emit(SchedulerEvent::Error(ErrorEvent {
                    run_id: Some(self.run_id.clone()),
                    trigger_id: Some(self.trigger_id),
                    job: Some(self.job.clone()),
                    message,
                }));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for TouchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TouchHandle")
            .field("run_id", &self.run_id)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

/// Everything a handler knows about the run it is executing.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub trigger_id: TriggerId,
    /// Owning job name.
    pub job: String,
    /// Trigger metadata, falling back to job metadata.
    pub payload: Option<Value>,
    /// The planned fire instant (may predate `now` under misfire).
    pub scheduled_at: DateTime<Utc>,
    /// 1-based attempt index.
    pub attempt: u32,
    /// Fires on shutdown, timeout, or cancellation; handlers should wind
    /// down promptly once it does.
    pub cancel: CancellationToken,
    /// Heartbeat/progress reporter.
    pub touch: TouchHandle,
    /// Run-scoped logger span carrying `run_id`/`trigger_id`/`job`. The
    /// engine instruments the handler with it, so ambient `tracing` calls
    /// inside the handler are already run-scoped; spawned work can scope
    /// itself with `ctx.logger.clone()`.
    pub logger: tracing::Span,
    /// The engine clock.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("job", &self.job)
            .field("attempt", &self.attempt)
            .field("scheduled_at", &self.scheduled_at)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Job Definition
// =============================================================================

/// Builder for registering a job.
///
/// # Example
///
/// ```ignore
/// let job = JobDefinition::new("send-digest")
///     .with_handler_fn(|ctx| async move { run_digest(ctx).await })
///     .with_concurrency(4)
///     .with_timeout(Duration::from_secs(120))
///     .with_retries(RetryPolicy::new(
///         3,
///         BackoffStrategy::exponential(
///             Duration::from_millis(500),
///             2.0,
///             Duration::from_secs(30),
///         ),
///     ));
/// scheduler.register_job(job).await?;
/// ```
pub struct JobDefinition {
    pub(crate) name: String,
    pub(crate) concurrency: u32,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) rate_limit: Option<RateLimitConfig>,
    pub(crate) metadata: Option<Value>,
    pub(crate) worker: Option<WorkerDefinition>,
    pub(crate) handler: Option<Arc<dyn JobHandler>>,
    pub(crate) upsert: bool,
}

impl JobDefinition {
    /// New definition with default policy: concurrency 1, no timeout, no
    /// retries, no rate limit.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            timeout: None,
            retry: None,
            rate_limit: None,
            metadata: None,
            worker: None,
            handler: None,
            upsert: false,
        }
    }

    /// Attach an in-process handler.
    pub fn with_handler(mut self, handler: impl JobHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Attach an async closure as the handler.
    pub fn with_handler_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.with_handler(FnHandler::new(f))
    }

    /// Attach an abstract worker definition for an external executor.
    pub fn with_worker(mut self, worker: WorkerDefinition) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Max in-flight runs of this job (default 1).
    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Per-run execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry policy for failed or stalled runs.
    pub fn with_retries(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Per-job admission rate limit.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Opaque metadata; also the default run payload.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Replace an existing registration instead of failing on a name
    /// collision.
    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    pub(crate) fn to_record(&self, paused: bool) -> JobRecord {
        JobRecord {
            name: self.name.clone(),
            concurrency: self.concurrency,
            timeout: self.timeout,
            retry: self.retry.clone(),
            rate_limit: self.rate_limit.clone(),
            metadata: self.metadata.clone(),
            paused,
            worker: self.worker.clone(),
        }
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("has_handler", &self.handler.is_some())
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffStrategy;
    use crate::bus::EventKind;
    use crate::clock::VirtualClock;
    use crate::memory::InMemoryStore;
    use crate::store::{Run, RunStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instant(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_definition_defaults() {
        let def = JobDefinition::new("emails");
        assert_eq!(def.name, "emails");
        assert_eq!(def.concurrency, 1);
        assert!(def.timeout.is_none());
        assert!(def.retry.is_none());
        assert!(def.handler.is_none());
        assert!(!def.upsert);
    }

    #[test]
    fn test_definition_builders() {
        let def = JobDefinition::new("emails")
            .with_concurrency(0) // clamped to 1
            .with_timeout(Duration::from_secs(30))
            .with_retries(RetryPolicy::new(
                3,
                BackoffStrategy::fixed(Duration::from_secs(1)),
            ))
            .upsert();
        assert_eq!(def.concurrency, 1);
        assert_eq!(def.timeout, Some(Duration::from_secs(30)));
        assert_eq!(def.retry.as_ref().unwrap().max_attempts, 3);
        assert!(def.upsert);

        let record = def.to_record(false);
        assert_eq!(record.name, "emails");
        assert!(!record.paused);
    }

    #[tokio::test]
    async fn test_fn_handler_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let handler = FnHandler::new(move |_ctx| {
            let hits = hits_clone.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Some(serde_json::json!({"ok": true})))
            }
        });

        let store: Arc<dyn SchedulerStore> = Arc::new(InMemoryStore::new());
        let bus = EventBus::new();
        let run_id = RunId::compose("engine-a", 1);
        let trigger_id = TriggerId::new();
        let ctx = RunContext {
            run_id: run_id.clone(),
            trigger_id,
            job: "emails".into(),
            payload: None,
            scheduled_at: instant("2024-01-01T00:00:00Z"),
            attempt: 1,
            cancel: CancellationToken::new(),
            touch: TouchHandle::new(store, bus, run_id, trigger_id, "emails".into()),
            logger: tracing::Span::none(),
            clock: Arc::new(VirtualClock::at(instant("2024-01-01T00:00:00Z"))),
        };

        let result = handler.run(ctx).await.unwrap();
        assert_eq!(result, Some(serde_json::json!({"ok": true})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_touch_emits_progress_and_isolates_violations() {
        let clock = Arc::new(VirtualClock::at(instant("2024-01-01T00:00:00Z")));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let bus = EventBus::new();
        let run_id = RunId::compose("engine-a", 1);
        let trigger_id = TriggerId::new();

        store
            .record_run_start(Run {
                run_id: run_id.clone(),
                trigger_id,
                job: "emails".into(),
                scheduled_at: instant("2024-01-01T00:00:00Z"),
                started_at: Some(instant("2024-01-01T00:00:00Z")),
                ended_at: None,
                attempt: 1,
                status: RunStatus::Running,
                progress: None,
                heartbeat_at: None,
                result: None,
                error: None,
            })
            .await
            .unwrap();

        let progress_hits = Arc::new(AtomicUsize::new(0));
        let error_hits = Arc::new(AtomicUsize::new(0));
        let p = progress_hits.clone();
        let _p_sub = bus.on(EventKind::Progress, move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let e = error_hits.clone();
        let _e_sub = bus.on(EventKind::Error, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        let touch = TouchHandle::new(
            store.clone(),
            bus,
            run_id.clone(),
            trigger_id,
            "emails".into(),
        );

        touch.touch(Some(50)).await.unwrap();
        assert_eq!(progress_hits.load(Ordering::SeqCst), 1);

        // Decreasing progress: error event, no crash, stored value intact.
        touch.touch(Some(20)).await.unwrap();
        assert_eq!(error_hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get_run(&run_id).await.unwrap().unwrap().progress,
            Some(50)
        );

        // Plain heartbeat emits nothing.
        touch.touch(None).await.unwrap();
        assert_eq!(progress_hits.load(Ordering::SeqCst), 1);
    }
}

//! Typed fan-out of scheduler lifecycle events.
//!
//! # Guarantees
//!
//! - **Synchronous, in-order delivery**: listeners for one event run on the
//!   emitting task, in registration order
//! - **Isolation**: a panicking listener does not interrupt other listeners
//!   or the emitter
//! - **Reentrancy-safe**: emission iterates a snapshot, so listeners may
//!   subscribe or unsubscribe during delivery
//!
//! Events are in-memory only. Durable state (run status, trigger advance)
//! lives in the store; the bus is observability, not authority.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::store::RunId;
use crate::trigger::TriggerId;

/// The event kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Scheduled,
    Run,
    Completed,
    Canceled,
    Error,
    Stalled,
    Retry,
    Progress,
    Paused,
    Resumed,
    Drain,
    Shutdown,
}

/// A fire was planned: a trigger was created, or a run record was opened
/// for a planned instant.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledEvent {
    pub job: String,
    pub trigger_id: TriggerId,
    /// Present when this event announces a concrete run record.
    pub run_id: Option<RunId>,
    pub at: DateTime<Utc>,
}

/// A run started executing.
#[derive(Debug, Clone, Serialize)]
pub struct RunStartedEvent {
    pub run_id: RunId,
    pub trigger_id: TriggerId,
    pub job: String,
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

/// A run finished successfully.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedEvent {
    pub run_id: RunId,
    pub trigger_id: TriggerId,
    pub job: String,
    pub attempt: u32,
    pub result: Option<Value>,
    pub ended_at: DateTime<Utc>,
}

/// A run was aborted by shutdown or cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct CanceledEvent {
    pub run_id: RunId,
    pub trigger_id: TriggerId,
    pub job: String,
    pub attempt: u32,
    pub reason: String,
}

/// A run failed terminally, or an engine-level failure occurred (in which
/// case `run_id` is absent).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub run_id: Option<RunId>,
    pub trigger_id: Option<TriggerId>,
    pub job: Option<String>,
    pub message: String,
}

/// A running run's heartbeat went stale.
#[derive(Debug, Clone, Serialize)]
pub struct StalledEvent {
    pub run_id: RunId,
    pub trigger_id: TriggerId,
    pub job: String,
    pub attempt: u32,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// A failed or stalled attempt scheduled a successor.
#[derive(Debug, Clone, Serialize)]
pub struct RetryEvent {
    /// The run that failed.
    pub run_id: RunId,
    /// The retry run that will follow.
    pub next_run_id: RunId,
    pub trigger_id: TriggerId,
    pub job: String,
    /// Attempt number of the retry.
    pub attempt: u32,
    pub delay_ms: u64,
    pub at: DateTime<Utc>,
}

/// A handler reported progress.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub job: String,
    /// 0..=100.
    pub progress: u8,
}

/// A job (or, with `job: None`, the whole scheduler) was paused.
#[derive(Debug, Clone, Serialize)]
pub struct PausedEvent {
    pub job: Option<String>,
}

/// A job (or the whole scheduler) was resumed.
#[derive(Debug, Clone, Serialize)]
pub struct ResumedEvent {
    pub job: Option<String>,
}

/// The scheduler began draining in-flight runs.
#[derive(Debug, Clone, Serialize)]
pub struct DrainEvent {
    pub in_flight: usize,
    pub grace_ms: Option<u64>,
}

/// The scheduler stopped.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownEvent {
    pub graceful: bool,
    pub reason: Option<String>,
}

/// One scheduler lifecycle event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Scheduled(ScheduledEvent),
    Run(RunStartedEvent),
    Completed(CompletedEvent),
    Canceled(CanceledEvent),
    Error(ErrorEvent),
    Stalled(StalledEvent),
    Retry(RetryEvent),
    Progress(ProgressEvent),
    Paused(PausedEvent),
    Resumed(ResumedEvent),
    Drain(DrainEvent),
    Shutdown(ShutdownEvent),
}

impl SchedulerEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::Scheduled(_) => EventKind::Scheduled,
            SchedulerEvent::Run(_) => EventKind::Run,
            SchedulerEvent::Completed(_) => EventKind::Completed,
            SchedulerEvent::Canceled(_) => EventKind::Canceled,
            SchedulerEvent::Error(_) => EventKind::Error,
            SchedulerEvent::Stalled(_) => EventKind::Stalled,
            SchedulerEvent::Retry(_) => EventKind::Retry,
            SchedulerEvent::Progress(_) => EventKind::Progress,
            SchedulerEvent::Paused(_) => EventKind::Paused,
            SchedulerEvent::Resumed(_) => EventKind::Resumed,
            SchedulerEvent::Drain(_) => EventKind::Drain,
            SchedulerEvent::Shutdown(_) => EventKind::Shutdown,
        }
    }
}

type Listener = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

struct Registered {
    id: u64,
    once: bool,
    listener: Listener,
}

struct BusInner {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<Registered>>>,
}

impl BusInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<Registered>>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Subscription handle returned by [`EventBus::on`] / [`EventBus::once`].
pub struct Subscription {
    inner: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Remove the listener. A no-op if it already fired (`once`) or the bus
    /// is gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut listeners = inner.lock();
            if let Some(list) = listeners.get_mut(&self.kind) {
                list.retain(|r| r.id != self.id);
            }
        }
    }
}

/// Typed event bus with registration-ordered synchronous listeners.
///
/// # Example
///
/// ```ignore
/// let bus = scheduler.bus();
/// let sub = bus.on(EventKind::Completed, |event| {
///     if let SchedulerEvent::Completed(done) = event {
///         println!("{} finished attempt {}", done.job, done.attempt);
///     }
/// });
/// // later
/// sub.unsubscribe();
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new event bus with no listeners.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn register(
        &self,
        kind: EventKind,
        once: bool,
        listener: impl Fn(&SchedulerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().entry(kind).or_default().push(Registered {
            id,
            once,
            listener: Arc::new(listener),
        });
        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Subscribe to an event kind. Returns an unsubscribe handle.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&SchedulerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(kind, false, listener)
    }

    /// Subscribe for a single delivery.
    pub fn once(
        &self,
        kind: EventKind,
        listener: impl Fn(&SchedulerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(kind, true, listener)
    }

    /// Remove all listeners for one kind, or every listener when `kind` is
    /// `None`.
    pub fn remove_all(&self, kind: Option<EventKind>) {
        let mut listeners = self.inner.lock();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            }
            None => listeners.clear(),
        }
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Emit an event to its listeners, in registration order. Returns the
    /// number of listeners invoked.
    ///
    /// Delivery iterates a snapshot taken at emit time: listeners added or
    /// removed during delivery affect later emissions, not this one. A
    /// panicking listener is logged and skipped.
    pub fn emit(&self, event: SchedulerEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(u64, bool, Listener)> = {
            let listeners = self.inner.lock();
            listeners
                .get(&kind)
                .map(|list| {
                    list.iter()
                        .map(|r| (r.id, r.once, r.listener.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut fired_once_ids = Vec::new();
        for (id, once, listener) in &snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| (listener.as_ref())(&event)));
            if result.is_err() {
                tracing::warn!(kind = ?kind, listener_id = id, "event listener panicked");
            }
            if *once {
                fired_once_ids.push(*id);
            }
        }

        if !fired_once_ids.is_empty() {
            let mut listeners = self.inner.lock();
            if let Some(list) = listeners.get_mut(&kind) {
                list.retain(|r| !fired_once_ids.contains(&r.id));
            }
        }

        snapshot.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.inner.lock();
        let total: usize = listeners.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("listener_count", &total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn paused_event() -> SchedulerEvent {
        SchedulerEvent::Paused(PausedEvent { job: None })
    }

    fn resumed_event() -> SchedulerEvent {
        SchedulerEvent::Resumed(ResumedEvent { job: None })
    }

    #[test]
    fn test_emit_and_receive() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let _sub = bus.on(EventKind::Paused, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.emit(paused_event()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kind_filtering() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let _sub = bus.on(EventKind::Paused, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(resumed_event());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for label in ["first", "second", "third"] {
            let order = order.clone();
            subs.push(bus.on(EventKind::Paused, move |_| {
                order.lock().unwrap().push(label);
            }));
        }

        bus.emit(paused_event());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let sub = bus.on(EventKind::Paused, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(paused_event());
        sub.unsubscribe();
        bus.emit(paused_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Paused), 0);
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let _sub = bus.once(EventKind::Paused, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(paused_event());
        bus.emit(paused_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Paused), 0);
    }

    #[test]
    fn test_remove_all_for_kind() {
        let bus = EventBus::new();
        let _a = bus.on(EventKind::Paused, |_| {});
        let _b = bus.on(EventKind::Paused, |_| {});
        let _c = bus.on(EventKind::Resumed, |_| {});

        bus.remove_all(Some(EventKind::Paused));
        assert_eq!(bus.listener_count(EventKind::Paused), 0);
        assert_eq!(bus.listener_count(EventKind::Resumed), 1);

        bus.remove_all(None);
        assert_eq!(bus.listener_count(EventKind::Resumed), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _panicker = bus.on(EventKind::Paused, |_| panic!("listener exploded"));
        let hits_clone = hits.clone();
        let _survivor = bus.on(EventKind::Paused, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        let invoked = bus.emit(paused_event());
        assert_eq!(invoked, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_subscribe_during_emit() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let bus_clone = bus.clone();
        let hits_clone = hits.clone();
        let _sub = bus.on(EventKind::Paused, move |_| {
            let hits = hits_clone.clone();
            // Subscribing mid-emit affects later emissions only. Dropping
            // the handle does not unsubscribe; only `unsubscribe()` does.
            let _sub = bus_clone.on(EventKind::Paused, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });

        bus.emit(paused_event());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.emit(paused_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(paused_event().kind(), EventKind::Paused);
        assert_eq!(
            SchedulerEvent::Shutdown(ShutdownEvent {
                graceful: true,
                reason: None
            })
            .kind(),
            EventKind::Shutdown
        );
    }

    #[test]
    fn test_events_serialize() {
        let json = serde_json::to_value(SchedulerEvent::Drain(DrainEvent {
            in_flight: 3,
            grace_ms: Some(5_000),
        }))
        .unwrap();
        assert_eq!(json["event"], "drain");
        assert_eq!(json["in_flight"], 3);
    }

    #[test]
    fn test_debug_impl() {
        let bus = EventBus::new();
        let _sub = bus.on(EventKind::Paused, |_| {});
        assert!(format!("{bus:?}").contains("EventBus"));
    }
}

//! # Metronome
//!
//! A durable, timezone-aware job scheduler: triggers plan fire instants,
//! one engine loop drains them into runs, and a pluggable store coordinates
//! engines across processes.
//!
//! ## Core Concepts
//!
//! Metronome separates **planning** from **execution**:
//! - A [`TriggerOptions`] describes *when* (cron, recurrence rule, fixed
//!   interval, or one-shot), in a named timezone, filtered by calendars
//! - A [`JobDefinition`] describes *what* (a handler or an abstract worker
//!   definition) and *how hard to try* (concurrency, timeout, retries,
//!   rate limit)
//! - The [`Scheduler`] engine turns due triggers into [`Run`] records and
//!   shepherds each through its lifecycle
//!
//! ## Architecture
//!
//! ```text
//! schedule() ──► Trigger (store) ◄── lease claim ──┐
//!                                                  │
//!     timer ──► Drainer ──► misfire reconcile ──► fire
//!                  │                               │
//!                  ▼                               ▼
//!           next_run_at advance            Run: pending → running
//!                                                  │
//!                              completed ◄── handler ──► failed ──► retry
//!                                                  │
//!                                     stall sweeper (heartbeats)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Leases gate dispatch** - only the lease holder may schedule a run
//!    for a trigger, so one fire instant yields at most one run across
//!    engines
//! 2. **Failure is a value** - handler errors land in the run's `error`
//!    field and the retry pipeline; they never unwind into the engine
//! 3. **Time goes through the clock** - planners, leases, limiters, and
//!    stall detection all read the injectable [`Clock`]
//! 4. **The store owns durable state** - engines keep only transient
//!    counters and timers
//!
//! ## Example
//!
//! ```ignore
//! use metronome::{
//!     JobDefinition, Scheduler, SchedulerBuilder, TriggerOptions,
//! };
//!
//! let scheduler = SchedulerBuilder::new().build();
//!
//! scheduler
//!     .register_job(
//!         JobDefinition::new("daily-report")
//!             .with_handler_fn(|ctx| async move {
//!                 ctx.touch.touch(Some(50)).await?;
//!                 Ok(Some(serde_json::json!({ "rows": 1024 })))
//!             })
//!             .with_concurrency(2),
//!     )
//!     .await?;
//!
//! scheduler
//!     .schedule(
//!         "daily-report",
//!         TriggerOptions::cron("0 0 9 * * ? *").with_timezone("Asia/Jakarta"),
//!     )
//!     .await?;
//! ```
//!
//! ## What This Is Not
//!
//! Metronome is **not**:
//! - A distributed database (stores are pluggable; only the in-memory
//!   reference store ships here)
//! - A subprocess runner or a workflow DAG engine
//! - An event-sourcing system (the bus is observability, not authority)

// Core modules
mod backoff;
mod bus;
mod calendar;
mod clock;
mod cron;
mod duration;
mod engine;
mod error;
mod job;
mod memory;
mod planner;
mod rate_limit;
mod rrule;
mod store;
mod timezone;
mod trigger;


// Re-export clocks
pub use clock::{Clock, SystemClock, VirtualClock};

// Re-export timezone extraction
pub use timezone::{local_fields, resolve_zone, LocalFields};

// Re-export calendar rules
pub use calendar::{CalendarFilter, CalendarRule};

// Re-export duration parsing
pub use duration::parse_duration;

// Re-export planners and their grammars
pub use cron::CronExpr;
pub use planner::TriggerPlanner;
pub use rrule::{Frequency, RRule};

// Re-export backoff strategies and rate limiting
pub use backoff::BackoffStrategy;
pub use rate_limit::{RateLimitConfig, RateLimiter};

// Re-export the event bus
pub use bus::{
    CanceledEvent, CompletedEvent, DrainEvent, ErrorEvent, EventBus, EventKind, PausedEvent,
    ProgressEvent, ResumedEvent, RetryEvent, RunStartedEvent, ScheduledEvent, SchedulerEvent,
    ShutdownEvent, StalledEvent, Subscription,
};

// Re-export records and the store contract
pub use store::{
    JobRecord, RetryPolicy, Revision, Run, RunEnd, RunId, RunStatus, SchedulerStore, StoreError,
    Trigger, WorkerDefinition,
};

// Re-export the reference store
pub use memory::InMemoryStore;

// Re-export trigger options
pub use trigger::{MisfirePolicy, TriggerId, TriggerKind, TriggerOptions};

// Re-export jobs and run context
pub use job::{FnHandler, JobDefinition, JobHandler, RunContext, TouchHandle, WorkerExecutor};

// Re-export the engine (primary entry point)
pub use engine::{
    EngineState, ExecuteNowOptions, JobHandle, Scheduler, SchedulerBuilder, SchedulerConfig,
    ShutdownOptions, TriggerHandle,
};

// Re-export error types
pub use error::{ErrorKind, SchedulerError};

// Re-export commonly used external types
pub use async_trait::async_trait;

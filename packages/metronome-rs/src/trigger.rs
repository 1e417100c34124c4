//! Trigger options — what to fire, when, and how to recover.
//!
//! A trigger is a persistent specification that produces a sequence of
//! planned fire instants for a job. Options select one of four planner
//! kinds (`cron`, `every`, `at`, `rrule`) plus base constraints shared by
//! all kinds: timezone, calendar rules, misfire policy, start/end bounds,
//! a run cap, a priority, and an idempotency key.
//!
//! Options are plain data and serialize as part of the persisted trigger
//! record; validation happens when the scheduler builds a planner from
//! them, so `schedule()` rejects malformed expressions synchronously.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::calendar::CalendarRule;

/// Unique trigger identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TriggerId(Uuid);

impl TriggerId {
    /// Create a new random trigger id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for TriggerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do with a planned fire that is already in the past by more than
/// the configured tolerance when the drainer reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MisfirePolicy {
    /// Advance past the missed fire without running it.
    Skip,
    /// Fire a single run immediately.
    #[default]
    FireNow,
    /// Fire one run per missed slot, in order, bounded by the engine's
    /// catch-up cap.
    CatchUp,
}

/// The planner kind and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TriggerKind {
    /// Extended cron expression with seconds (6 fields) or seconds and year
    /// (7 fields), including the Quartz `?`/`L`/`W`/`#` modifiers.
    Cron {
        expr: String,
    },
    /// Fixed interval from an anchor: a human duration (`"30s"`, `"5m"`) or
    /// bare milliseconds, with an optional phase offset.
    Every {
        every: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<String>,
    },
    /// A single absolute instant.
    At {
        run_at: DateTime<Utc>,
    },
    /// iCalendar recurrence rule subset (`FREQ=DAILY|WEEKLY|MONTHLY`).
    Rrule {
        rule: String,
    },
}

/// Options describing one trigger.
///
/// # Example
///
/// ```ignore
/// let options = TriggerOptions::cron("0 0 9 * * ? *")
///     .with_timezone("Asia/Jakarta")
///     .with_priority(10)
///     .with_misfire_policy(MisfirePolicy::CatchUp);
/// scheduler.schedule("reports", options).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerOptions {
    /// The planner kind.
    #[serde(flatten)]
    pub kind: TriggerKind,
    /// IANA zone for calendar arithmetic; UTC when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Include/exclude date rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calendars: Vec<CalendarRule>,
    /// What to do with fires missed past the tolerance.
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    /// No fire before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    /// No fire after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    /// Total fires before the trigger is exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    /// Dedupe key: scheduling the same key for the same job returns the
    /// existing trigger instead of creating a duplicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Higher priority wins a fire-time tie in the drain order.
    #[serde(default)]
    pub priority: i32,
    /// Opaque payload handed to the job handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TriggerOptions {
    fn with_kind(kind: TriggerKind) -> Self {
        Self {
            kind,
            timezone: None,
            calendars: Vec::new(),
            misfire_policy: MisfirePolicy::default(),
            start_at: None,
            end_at: None,
            max_runs: None,
            idempotency_key: None,
            priority: 0,
            metadata: None,
        }
    }

    /// Cron trigger from an extended cron expression.
    pub fn cron(expr: impl Into<String>) -> Self {
        Self::with_kind(TriggerKind::Cron { expr: expr.into() })
    }

    /// Fixed-interval trigger from a human duration or bare milliseconds.
    pub fn every(every: impl Into<String>) -> Self {
        Self::with_kind(TriggerKind::Every {
            every: every.into(),
            offset: None,
        })
    }

    /// One-shot trigger at an absolute instant.
    pub fn at(run_at: DateTime<Utc>) -> Self {
        Self::with_kind(TriggerKind::At { run_at })
    }

    /// Recurrence-rule trigger.
    pub fn rrule(rule: impl Into<String>) -> Self {
        Self::with_kind(TriggerKind::Rrule { rule: rule.into() })
    }

    /// Set the phase offset of an `every` trigger. No effect on other kinds.
    pub fn with_offset(mut self, offset: impl Into<String>) -> Self {
        if let TriggerKind::Every { offset: o, .. } = &mut self.kind {
            *o = Some(offset.into());
        }
        self
    }

    /// Set the IANA timezone.
    pub fn with_timezone(mut self, zone: impl Into<String>) -> Self {
        self.timezone = Some(zone.into());
        self
    }

    /// Add a calendar rule.
    pub fn with_calendar(mut self, rule: CalendarRule) -> Self {
        self.calendars.push(rule);
        self
    }

    /// Set the misfire policy.
    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    /// No fire before this instant.
    pub fn with_start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    /// No fire after this instant.
    pub fn with_end_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_at = Some(at);
        self
    }

    /// Exhaust the trigger after this many fires.
    pub fn with_max_runs(mut self, max: u32) -> Self {
        self.max_runs = Some(max);
        self
    }

    /// Set the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the drain-order priority (higher wins a fire-time tie).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach an opaque payload passed to the handler.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

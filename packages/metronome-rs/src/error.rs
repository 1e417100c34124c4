//! Structured error types for the scheduler.
//!
//! `SchedulerError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Every failure the scheduler can surface maps to exactly
//! one [`ErrorKind`], so callers and event listeners can branch on the kind
//! without string matching.
//!
//! # The Error Boundary Rule
//!
//! > **Run failures are values, not exceptions.**
//!
//! - `anyhow` is internal transport (ergonomic for job handlers)
//! - A failed run carries its error in the run record and on the `error`
//!   event; it never propagates into the engine loop or other runs
//!
//! # Example
//!
//! ```ignore
//! use metronome::{SchedulerError, ErrorKind};
//!
//! match scheduler.schedule("reports", options).await {
//!     Ok(handle) => println!("scheduled {}", handle.id()),
//!     Err(e) if e.kind() == ErrorKind::Validation => {
//!         eprintln!("bad trigger options: {}", e);
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Classification of scheduler failures.
///
/// Kinds are stable; the error variants carrying them may grow context
/// fields without breaking callers that branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid trigger options, unknown trigger kind, or a job registered
    /// without any executor.
    Configuration,
    /// Malformed cron / rrule / calendar / duration input.
    Validation,
    /// Unknown job, trigger, or run.
    NotFound,
    /// Duplicate job name (non-upsert) or revision mismatch.
    Conflict,
    /// Illegal state transition (progress out of range, run end for a
    /// non-running run, operation on a stopped scheduler).
    State,
    /// Handler exceeded its configured timeout.
    Timeout,
    /// Run aborted by shutdown or trigger cancel.
    Canceled,
    /// Heartbeat expired.
    Stalled,
    /// Admission denied because the rate limiter stayed exhausted past the
    /// wait cap.
    RateLimited,
    /// Underlying store operation failure.
    Store,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::State => "state",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Stalled => "stalled",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Store => "store",
        };
        f.write_str(s)
    }
}

/// Structured error type for scheduler operations.
///
/// Validation and configuration errors surface synchronously from
/// `register_job` / `schedule`. Per-run errors are captured on the run
/// record and emitted on the `error` event instead of being returned.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job or trigger is not executable as configured.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The input failed grammar-level validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced record does not exist.
    #[error("{what} not found: {name}")]
    NotFound {
        /// Which record family was looked up ("job", "trigger", "run").
        what: &'static str,
        /// The identifier that missed.
        name: String,
    },

    /// The operation collided with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation is not legal in the current state.
    #[error("illegal state: {0}")]
    State(String),

    /// The handler ran past its timeout and was canceled.
    #[error("run exceeded timeout of {timeout:?}")]
    Timeout {
        /// The configured per-run timeout.
        timeout: Duration,
    },

    /// The operation was aborted before completion.
    #[error("canceled: {reason}")]
    Canceled {
        /// Why the operation was aborted.
        reason: String,
    },

    /// A running run's heartbeat went stale.
    #[error("heartbeat expired after {stalled_after:?}")]
    Stalled {
        /// The stall threshold that was crossed.
        stalled_after: Duration,
    },

    /// The rate limiter stayed exhausted past the admission wait cap.
    #[error("rate limited: no tokens available within the wait cap")]
    RateLimited,

    /// The backing store failed.
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// Shorthand for a canceled error with a reason.
    pub fn canceled(reason: impl Into<String>) -> Self {
        SchedulerError::Canceled {
            reason: reason.into(),
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Configuration(_) => ErrorKind::Configuration,
            SchedulerError::Validation(_) => ErrorKind::Validation,
            SchedulerError::NotFound { .. } => ErrorKind::NotFound,
            SchedulerError::Conflict(_) => ErrorKind::Conflict,
            SchedulerError::State(_) => ErrorKind::State,
            SchedulerError::Timeout { .. } => ErrorKind::Timeout,
            SchedulerError::Canceled { .. } => ErrorKind::Canceled,
            SchedulerError::Stalled { .. } => ErrorKind::Stalled,
            SchedulerError::RateLimited => ErrorKind::RateLimited,
            SchedulerError::Store(_) => ErrorKind::Store,
        }
    }

    /// True if the error came from the store layer.
    pub fn is_store(&self) -> bool {
        matches!(self, SchedulerError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SchedulerError::Validation("bad cron".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SchedulerError::NotFound {
                what: "job",
                name: "emails".into()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SchedulerError::Timeout {
                timeout: Duration::from_secs(5)
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(SchedulerError::RateLimited.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn test_store_error_converts() {
        let err: SchedulerError = StoreError::Conflict.into();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert!(err.is_store());
    }

    #[test]
    fn test_display_carries_context() {
        let err = SchedulerError::NotFound {
            what: "trigger",
            name: "t-123".into(),
        };
        assert!(err.to_string().contains("trigger"));
        assert!(err.to_string().contains("t-123"));

        let err = SchedulerError::canceled("shutdown");
        assert!(err.to_string().contains("shutdown"));
    }

    #[test]
    fn test_kind_display_is_stable() {
        assert_eq!(ErrorKind::Configuration.to_string(), "configuration");
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate_limited");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = SchedulerError::Conflict("job already registered: emails".into());
        match &err {
            SchedulerError::Conflict(msg) => assert!(msg.contains("emails")),
            _ => panic!("expected Conflict"),
        }
    }
}

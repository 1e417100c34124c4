//! Human duration grammar.
//!
//! An integer with an optional unit suffix: `ms`, `s`, `m`, `h`, `d`.
//! A bare integer is milliseconds. `"5m"` is 300 000 ms.

use std::time::Duration;

use crate::error::SchedulerError;

/// Parse a human duration string into a [`Duration`].
///
/// # Example
///
/// ```ignore
/// assert_eq!(parse_duration("5m")?, Duration::from_secs(300));
/// assert_eq!(parse_duration("250")?, Duration::from_millis(250));
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, SchedulerError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(SchedulerError::Validation("empty duration".into()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let value: u64 = digits.parse().map_err(|_| {
        SchedulerError::Validation(format!("invalid duration: {input:?}"))
    })?;

    let millis = match unit {
        "" | "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        "d" => value.saturating_mul(86_400_000),
        other => {
            return Err(SchedulerError::Validation(format!(
                "unknown duration unit {other:?} in {input:?}"
            )))
        }
    };

    Ok(Duration::from_millis(millis))
}

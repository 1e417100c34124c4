//! Local calendar field extraction for named timezones.
//!
//! Maps an absolute instant to the local calendar fields of an IANA zone
//! using the platform timezone database (via `chrono-tz`). An omitted zone
//! means UTC. Given the same instant and zone, the output is deterministic
//! and follows the zone's rules across DST transitions.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::SchedulerError;

/// Local calendar fields of an instant in some zone.
///
/// `day_of_week` uses 0=Sunday through 6=Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFields {
    pub year: i32,
    /// 1-12.
    pub month: u32,
    /// 1-31.
    pub day: u32,
    /// 0=Sunday .. 6=Saturday.
    pub day_of_week: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

/// Resolve an optional IANA zone name; `None` means UTC.
pub fn resolve_zone(name: Option<&str>) -> Result<Tz, SchedulerError> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| SchedulerError::Validation(format!("unknown timezone: {name}"))),
    }
}

/// Extract the local calendar fields of `instant` in `zone` (UTC if omitted).
pub fn local_fields(
    instant: DateTime<Utc>,
    zone: Option<&str>,
) -> Result<LocalFields, SchedulerError> {
    let tz = resolve_zone(zone)?;
    Ok(fields_in(instant, tz))
}

/// Extract local fields in an already-resolved zone.
pub(crate) fn fields_in(instant: DateTime<Utc>, tz: Tz) -> LocalFields {
    let local = tz.from_utc_datetime(&instant.naive_utc());
    LocalFields {
        year: local.year(),
        month: local.month(),
        day: local.day(),
        day_of_week: local.weekday().num_days_from_sunday(),
        hour: local.hour(),
        minute: local.minute(),
        second: local.second(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_defaults_to_utc() {
        let fields = local_fields(instant("2024-03-01T12:34:56Z"), None).unwrap();
        assert_eq!(fields.year, 2024);
        assert_eq!(fields.month, 3);
        assert_eq!(fields.day, 1);
        assert_eq!(fields.hour, 12);
        assert_eq!(fields.minute, 34);
        assert_eq!(fields.second, 56);
        // 2024-03-01 is a Friday.
        assert_eq!(fields.day_of_week, 5);
    }

    #[test]
    fn test_fixed_offset_zone() {
        // Jakarta is UTC+7 year-round.
        let fields = local_fields(instant("2024-03-01T00:00:00Z"), Some("Asia/Jakarta")).unwrap();
        assert_eq!(fields.day, 1);
        assert_eq!(fields.hour, 7);
    }

    #[test]
    fn test_day_rollover_across_zone() {
        let fields =
            local_fields(instant("2024-03-01T20:00:00Z"), Some("Pacific/Auckland")).unwrap();
        // NZDT is UTC+13 on this date: 20:00Z is 09:00 on March 2.
        assert_eq!(fields.day, 2);
        assert_eq!(fields.hour, 9);
    }

    #[test]
    fn test_dst_transition() {
        // 2024-03-10 06:59Z is 01:59 EST; 07:00Z is 03:00 EDT (spring forward).
        let before =
            local_fields(instant("2024-03-10T06:59:00Z"), Some("America/New_York")).unwrap();
        assert_eq!(before.hour, 1);
        assert_eq!(before.minute, 59);

        let after =
            local_fields(instant("2024-03-10T07:00:00Z"), Some("America/New_York")).unwrap();
        assert_eq!(after.hour, 3);
        assert_eq!(after.minute, 0);
    }

    #[test]
    fn test_unknown_zone_is_validation_error() {
        let err = local_fields(instant("2024-01-01T00:00:00Z"), Some("Mars/Olympus")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_sunday_is_zero() {
        // 2024-03-03 is a Sunday.
        let fields = local_fields(instant("2024-03-03T00:00:00Z"), None).unwrap();
        assert_eq!(fields.day_of_week, 0);
    }
}

//! Extended cron expressions with Quartz modifiers.
//!
//! Accepts 6 fields (`sec min hour dom mon dow`) or 7 with a trailing
//! `year`. Tokens: literals, `*`, ranges `a-b`, steps `a/n` and `*/n`,
//! lists `a,b,c`, day/month names, and the Quartz day modifiers:
//!
//! - `?` — placeholder in day-of-month or day-of-week (at most one of the
//!   two may be `?`, and at most one may be constrained)
//! - `L`, `L-N` — last day of month, optionally offset back by N days
//! - `LW` — last weekday (Mon-Fri) of the month
//! - `NW` — nearest weekday to day N, within the month
//! - `dL` — last weekday `d` of the month
//! - `d#n` — the nth weekday `d` of the month
//!
//! Day-of-week numbering is 0=Sunday through 6=Saturday; 7 is accepted as
//! an alias for Sunday. The planner works in the trigger's local timezone:
//! it steps candidate days, matches the day against the date fields, then
//! enumerates matching times of day in ascending order, converting each
//! back to an absolute instant. Local times that do not exist (the DST
//! spring-forward gap) are skipped; ambiguous local times resolve to their
//! earliest instant.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::calendar::CalendarFilter;
use crate::error::SchedulerError;

/// Hard bound on candidate-day iteration per `next` call.
pub(crate) const MAX_PLAN_STEPS: usize = 200_000;

// =============================================================================
// Field Types
// =============================================================================

/// Day-of-month field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomField {
    /// `*` — no constraint.
    Any,
    /// `?` — constraint lives in the day-of-week field.
    Unspecified,
    /// Explicit days, as a bitmask over bits 1..=31.
    Days(u32),
    /// `L` / `L-N` — last day of the month, minus `offset`.
    Last { offset: u32 },
    /// `LW` — last weekday of the month.
    LastWeekday,
    /// `NW` — nearest weekday to day N within the month.
    NearestWeekday(u32),
}

/// Day-of-week field (0=Sunday .. 6=Saturday).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DowField {
    Any,
    Unspecified,
    /// Explicit weekdays, as a bitmask over bits 0..=6.
    Days(u8),
    /// `dL` — last weekday `d` of the month.
    Last(u8),
    /// `d#n` — the nth weekday `d` of the month.
    Nth { weekday: u8, nth: u8 },
}

impl DomField {
    fn is_constrained(&self) -> bool {
        !matches!(self, DomField::Any | DomField::Unspecified)
    }
}

impl DowField {
    fn is_constrained(&self) -> bool {
        !matches!(self, DowField::Any | DowField::Unspecified)
    }
}

// =============================================================================
// Expression
// =============================================================================

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    /// Ascending matching seconds.
    seconds: Vec<u32>,
    /// Ascending matching minutes.
    minutes: Vec<u32>,
    /// Ascending matching hours.
    hours: Vec<u32>,
    /// Bitmask over bits 1..=12.
    months: u16,
    dom: DomField,
    dow: DowField,
    /// `None` means any year (6-field form or `*`).
    years: Option<BTreeSet<i32>>,
}

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 2099;

fn invalid(expr: &str, detail: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Validation(format!("invalid cron expression {expr:?}: {detail}"))
}

/// Resolve a field element to a number, honoring names.
fn lookup(token: &str, names: &[&str], name_base: u32) -> Option<u32> {
    if let Ok(v) = token.parse::<u32>() {
        return Some(v);
    }
    names
        .iter()
        .position(|n| n.eq_ignore_ascii_case(token))
        .map(|i| i as u32 + name_base)
}

/// Expand `a`, `a-b`, `a/n`, `a-b/n`, `*`, `*/n`, and comma lists into the
/// matching values within `[min, max]`.
fn parse_values(
    expr: &str,
    field: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> Result<Vec<u32>, SchedulerError> {
    let mut out = BTreeSet::new();
    for elem in field.split(',') {
        let (range_part, step) = match elem.split_once('/') {
            Some((r, s)) => {
                let step = s
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| invalid(expr, format!("bad step in {elem:?}")))?;
                (r, step)
            }
            None => (elem, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let a = lookup(a, names, name_base)
                .ok_or_else(|| invalid(expr, format!("bad value in {elem:?}")))?;
            let b = lookup(b, names, name_base)
                .ok_or_else(|| invalid(expr, format!("bad value in {elem:?}")))?;
            (a, b)
        } else {
            let v = lookup(range_part, names, name_base)
                .ok_or_else(|| invalid(expr, format!("bad value in {elem:?}")))?;
            // A bare value with a step runs to the end of the range.
            if elem.contains('/') {
                (v, max)
            } else {
                (v, v)
            }
        };

        if start < min || end > max || start > end {
            return Err(invalid(
                expr,
                format!("{elem:?} out of range {min}..={max}"),
            ));
        }
        let mut v = start;
        while v <= end {
            out.insert(v);
            v += step;
        }
    }
    Ok(out.into_iter().collect())
}

fn parse_dom(expr: &str, field: &str) -> Result<DomField, SchedulerError> {
    let upper = field.to_ascii_uppercase();
    match upper.as_str() {
        "?" => Ok(DomField::Unspecified),
        "*" => Ok(DomField::Any),
        "L" => Ok(DomField::Last { offset: 0 }),
        "LW" => Ok(DomField::LastWeekday),
        f if f.starts_with("L-") => {
            let offset = f[2..]
                .parse::<u32>()
                .ok()
                .filter(|n| (1..=30).contains(n))
                .ok_or_else(|| invalid(expr, format!("bad offset in {field:?}")))?;
            Ok(DomField::Last { offset })
        }
        f if f.ends_with('W') => {
            let day = f[..f.len() - 1]
                .parse::<u32>()
                .ok()
                .filter(|d| (1..=31).contains(d))
                .ok_or_else(|| invalid(expr, format!("bad weekday target in {field:?}")))?;
            Ok(DomField::NearestWeekday(day))
        }
        _ => {
            let values = parse_values(expr, &upper, 1, 31, &[], 0)?;
            let mask = values.iter().fold(0u32, |m, &d| m | (1 << d));
            Ok(DomField::Days(mask))
        }
    }
}

fn parse_dow(expr: &str, field: &str) -> Result<DowField, SchedulerError> {
    let upper = field.to_ascii_uppercase();
    match upper.as_str() {
        "?" => Ok(DowField::Unspecified),
        "*" => Ok(DowField::Any),
        f if f.contains('#') => {
            let (day, nth) = f
                .split_once('#')
                .ok_or_else(|| invalid(expr, format!("bad nth token {field:?}")))?;
            let weekday = lookup(day, &DAY_NAMES, 0)
                .filter(|d| *d <= 7)
                .map(|d| if d == 7 { 0 } else { d })
                .ok_or_else(|| invalid(expr, format!("bad weekday in {field:?}")))?;
            let nth = nth
                .parse::<u8>()
                .ok()
                .filter(|n| (1..=5).contains(n))
                .ok_or_else(|| invalid(expr, format!("bad nth in {field:?}")))?;
            Ok(DowField::Nth {
                weekday: weekday as u8,
                nth,
            })
        }
        f if f.len() > 1 && f.ends_with('L') => {
            let weekday = lookup(&f[..f.len() - 1], &DAY_NAMES, 0)
                .filter(|d| *d <= 7)
                .map(|d| if d == 7 { 0 } else { d })
                .ok_or_else(|| invalid(expr, format!("bad weekday in {field:?}")))?;
            Ok(DowField::Last(weekday as u8))
        }
        _ => {
            let values = parse_values(expr, &upper, 0, 7, &DAY_NAMES, 0)?;
            let mask = values
                .iter()
                .map(|&d| if d == 7 { 0 } else { d })
                .fold(0u8, |m, d| m | (1 << d));
            Ok(DowField::Days(mask))
        }
    }
}

impl CronExpr {
    /// Parse a 6- or 7-field extended cron expression.
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 && fields.len() != 7 {
            return Err(invalid(expr, format!("expected 6 or 7 fields, got {}", fields.len())));
        }

        let seconds = parse_values(expr, fields[0], 0, 59, &[], 0)?;
        let minutes = parse_values(expr, fields[1], 0, 59, &[], 0)?;
        let hours = parse_values(expr, fields[2], 0, 23, &[], 0)?;
        let dom = parse_dom(expr, fields[3])?;
        let months = parse_values(expr, &fields[4].to_ascii_uppercase(), 1, 12, &MONTH_NAMES, 1)?
            .iter()
            .fold(0u16, |m, &v| m | (1 << v));
        let dow = parse_dow(expr, fields[5])?;

        let years = if fields.len() == 7 && fields[6] != "*" {
            let values = parse_values(
                expr,
                fields[6],
                MIN_YEAR as u32,
                MAX_YEAR as u32,
                &[],
                0,
            )?;
            Some(values.into_iter().map(|y| y as i32).collect())
        } else {
            None
        };

        if dom == DomField::Unspecified && dow == DowField::Unspecified {
            return Err(invalid(expr, "only one of day-of-month/day-of-week may be '?'"));
        }
        if dom.is_constrained() && dow.is_constrained() {
            return Err(invalid(
                expr,
                "day-of-month and day-of-week cannot both be constrained; use '?'",
            ));
        }

        Ok(Self {
            seconds,
            minutes,
            hours,
            months,
            dom,
            dow,
            years,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        if let Some(years) = &self.years {
            if !years.contains(&date.year()) {
                return false;
            }
        }
        match (&self.dom, &self.dow) {
            (DomField::Unspecified, dow) => dow_matches(dow, date),
            (dom, DowField::Unspecified) => dom_matches(dom, date),
            (dom, dow) => dom_matches(dom, date) && dow_matches(dow, date),
        }
    }

    /// Matching times of day, ascending, at or after `floor` when given.
    fn times(&self, floor: Option<NaiveTime>) -> Vec<(u32, u32, u32)> {
        let mut out = Vec::new();
        for &h in &self.hours {
            if let Some(f) = floor {
                if h < f.hour() {
                    continue;
                }
            }
            for &m in &self.minutes {
                if let Some(f) = floor {
                    if h == f.hour() && m < f.minute() {
                        continue;
                    }
                }
                for &s in &self.seconds {
                    if let Some(f) = floor {
                        if h == f.hour() && m == f.minute() && s < f.second() {
                            continue;
                        }
                    }
                    out.push((h, m, s));
                }
            }
        }
        out
    }

    /// First fire strictly after `after`, in `tz`, honoring the calendar
    /// filter. `Ok(None)` means the series is exhausted (the year field ran
    /// out); hitting the iteration cap is an error.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
        tz: Tz,
        calendar: Option<&CalendarFilter>,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let after_local = tz.from_utc_datetime(&after.naive_utc()).naive_local();
        let mut date = after_local.date();
        let mut first_day = true;

        for _ in 0..MAX_PLAN_STEPS {
            if let Some(years) = &self.years {
                match years.iter().next_back() {
                    Some(&max_year) if date.year() > max_year => return Ok(None),
                    None => return Ok(None),
                    _ => {}
                }
            }

            if self.day_matches(date) && calendar.map_or(true, |c| c.accepts(date)) {
                let floor = first_day.then(|| after_local.time());
                for (h, m, s) in self.times(floor) {
                    let Some(naive) = date.and_hms_opt(h, m, s) else {
                        continue;
                    };
                    let resolved = match tz.from_local_datetime(&naive) {
                        // Local time inside the spring-forward gap.
                        chrono::LocalResult::None => continue,
                        chrono::LocalResult::Single(dt) => dt,
                        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
                    };
                    let utc = resolved.with_timezone(&Utc);
                    if utc > after {
                        return Ok(Some(utc));
                    }
                }
            }

            date = match date.succ_opt() {
                Some(d) => d,
                None => return Ok(None),
            };
            first_day = false;
        }

        Err(SchedulerError::State(format!(
            "no cron occurrence found within {MAX_PLAN_STEPS} candidate days"
        )))
    }
}

// =============================================================================
// Date Helpers
// =============================================================================

fn dom_matches(dom: &DomField, date: NaiveDate) -> bool {
    match dom {
        DomField::Any | DomField::Unspecified => true,
        DomField::Days(mask) => mask & (1 << date.day()) != 0,
        DomField::Last { offset } => {
            let last = days_in_month(date.year(), date.month());
            last >= *offset && date.day() == last - offset
        }
        DomField::LastWeekday => date.day() == last_weekday_day(date.year(), date.month()),
        DomField::NearestWeekday(target) => {
            date.day() == nearest_weekday_day(date.year(), date.month(), *target)
        }
    }
}

fn dow_matches(dow: &DowField, date: NaiveDate) -> bool {
    let weekday = date.weekday().num_days_from_sunday() as u8;
    match dow {
        DowField::Any | DowField::Unspecified => true,
        DowField::Days(mask) => mask & (1 << weekday) != 0,
        DowField::Last(target) => {
            weekday == *target && date.day() + 7 > days_in_month(date.year(), date.month())
        }
        DowField::Nth { weekday: target, nth } => {
            weekday == *target && (date.day() - 1) / 7 + 1 == u32::from(*nth)
        }
    }
}

pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn last_weekday_day(year: i32, month: u32) -> u32 {
    let mut day = days_in_month(year, month);
    while day > 1 {
        match NaiveDate::from_ymd_opt(year, month, day).map(|d| d.weekday()) {
            Some(Weekday::Sat) | Some(Weekday::Sun) => day -= 1,
            _ => break,
        }
    }
    day
}

fn nearest_weekday_day(year: i32, month: u32, target: u32) -> u32 {
    let last = days_in_month(year, month);
    let day = target.min(last);
    match NaiveDate::from_ymd_opt(year, month, day).map(|d| d.weekday()) {
        Some(Weekday::Sat) => {
            if day > 1 {
                day - 1
            } else {
                day + 2
            }
        }
        Some(Weekday::Sun) => {
            if day < last {
                day + 1
            } else {
                day - 2
            }
        }
        _ => day,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarRule;

    fn instant(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn next(expr: &str, tz: &str, after: &str) -> Option<DateTime<Utc>> {
        let cron = CronExpr::parse(expr).unwrap();
        let tz: Tz = tz.parse().unwrap();
        cron.next_after(instant(after), tz, None).unwrap()
    }

    #[test]
    fn test_fixed_offset_timezone() {
        assert_eq!(
            next("0 0 9 * * ? *", "Asia/Jakarta", "2024-03-01T00:00:00Z"),
            Some(instant("2024-03-01T02:00:00Z"))
        );
    }

    #[test]
    fn test_dst_gap_skips_to_next_day() {
        // 2024-03-10 02:30 does not exist in America/New_York.
        assert_eq!(
            next("0 30 2 * * ? *", "America/New_York", "2024-03-10T06:00:00Z"),
            Some(instant("2024-03-11T06:30:00Z"))
        );
    }

    #[test]
    fn test_nearest_weekday() {
        // June 15 2024 is a Saturday; nearest weekday is Friday the 14th.
        assert_eq!(
            next("0 0 9 15W * ? *", "UTC", "2024-06-13T12:00:00Z"),
            Some(instant("2024-06-14T09:00:00Z"))
        );
    }

    #[test]
    fn test_nearest_weekday_sunday_rolls_forward() {
        // September 15 2024 is a Sunday; nearest weekday is Monday the 16th.
        assert_eq!(
            next("0 0 9 15W * ? *", "UTC", "2024-09-01T00:00:00Z"),
            Some(instant("2024-09-16T09:00:00Z"))
        );
    }

    #[test]
    fn test_last_day_of_month_leap() {
        assert_eq!(
            next("0 0 2 L * ? *", "UTC", "2024-02-28T00:00:00Z"),
            Some(instant("2024-02-29T02:00:00Z"))
        );
    }

    #[test]
    fn test_last_day_with_offset() {
        // L-2 in April (30 days) is the 28th.
        assert_eq!(
            next("0 0 0 L-2 * ? *", "UTC", "2024-04-01T00:00:00Z"),
            Some(instant("2024-04-28T00:00:00Z"))
        );
    }

    #[test]
    fn test_last_weekday_of_month() {
        // March 31 2024 is a Sunday, so LW is Friday the 29th.
        assert_eq!(
            next("0 0 8 LW * ? *", "UTC", "2024-03-01T00:00:00Z"),
            Some(instant("2024-03-29T08:00:00Z"))
        );
    }

    #[test]
    fn test_nth_weekday() {
        // 2#3: third Tuesday (0=Sunday). May 2024: 7th, 14th, 21st.
        assert_eq!(
            next("0 45 6 ? * 2#3 *", "UTC", "2024-05-20T00:00:00Z"),
            Some(instant("2024-05-21T06:45:00Z"))
        );
    }

    #[test]
    fn test_last_weekday_of_week_kind() {
        // 5L: last Friday of June 2024 is the 28th.
        assert_eq!(
            next("0 0 12 ? * 5L *", "UTC", "2024-06-01T00:00:00Z"),
            Some(instant("2024-06-28T12:00:00Z"))
        );
    }

    #[test]
    fn test_day_and_month_names() {
        assert_eq!(
            next("0 0 9 ? JAN MON *", "UTC", "2024-12-31T00:00:00Z"),
            // First Monday of January 2025 is the 6th.
            Some(instant("2025-01-06T09:00:00Z"))
        );
    }

    #[test]
    fn test_ranges_steps_lists() {
        let cron = CronExpr::parse("0 */15 9-17 ? * MON-FRI").unwrap();
        // Friday 2024-06-14 09:00 onward, every 15 minutes.
        let tz = Tz::UTC;
        let t1 = cron
            .next_after(instant("2024-06-14T09:01:00Z"), tz, None)
            .unwrap()
            .unwrap();
        assert_eq!(t1, instant("2024-06-14T09:15:00Z"));
        // 17:45 is the last fire of the day; next is Monday 09:00.
        let t2 = cron
            .next_after(instant("2024-06-14T17:45:00Z"), tz, None)
            .unwrap()
            .unwrap();
        assert_eq!(t2, instant("2024-06-17T09:00:00Z"));
    }

    #[test]
    fn test_seconds_field() {
        assert_eq!(
            next("30 0 0 * * ? *", "UTC", "2024-01-01T00:00:00Z"),
            Some(instant("2024-01-01T00:00:30Z"))
        );
        assert_eq!(
            next("15,45 0 0 * * ? *", "UTC", "2024-01-01T00:00:20Z"),
            Some(instant("2024-01-01T00:00:45Z"))
        );
    }

    #[test]
    fn test_strictly_after() {
        // A fire exactly at `after` is not returned.
        assert_eq!(
            next("0 0 9 * * ? *", "UTC", "2024-03-01T09:00:00Z"),
            Some(instant("2024-03-02T09:00:00Z"))
        );
    }

    #[test]
    fn test_year_field_exhausts() {
        let cron = CronExpr::parse("0 0 0 1 1 ? 2030").unwrap();
        assert_eq!(
            cron.next_after(instant("2024-06-01T00:00:00Z"), Tz::UTC, None)
                .unwrap(),
            Some(instant("2030-01-01T00:00:00Z"))
        );
        assert_eq!(
            cron.next_after(instant("2030-01-01T00:00:00Z"), Tz::UTC, None)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_calendar_filter_applies_after_field_match() {
        let filter =
            CalendarFilter::new(&[CalendarRule::exclude(["2024-01-01"])]).unwrap();
        let cron = CronExpr::parse("0 0 0 * * ? *").unwrap();
        assert_eq!(
            cron.next_after(instant("2023-12-31T12:00:00Z"), Tz::UTC, Some(&filter))
                .unwrap(),
            Some(instant("2024-01-02T00:00:00Z"))
        );
    }

    #[test]
    fn test_monotonic_planning() {
        let cron = CronExpr::parse("0 17 3,9 ? * MON-FRI *").unwrap();
        let a = instant("2024-02-01T00:00:00Z");
        let b = instant("2024-02-04T00:00:00Z");
        let na = cron.next_after(a, Tz::UTC, None).unwrap().unwrap();
        let nb = cron.next_after(b, Tz::UTC, None).unwrap().unwrap();
        assert!(nb >= na);
    }

    #[test]
    fn test_sunday_as_seven() {
        let with_zero = CronExpr::parse("0 0 10 ? * 0 *").unwrap();
        let with_seven = CronExpr::parse("0 0 10 ? * 7 *").unwrap();
        let after = instant("2024-03-01T00:00:00Z");
        assert_eq!(
            with_zero.next_after(after, Tz::UTC, None).unwrap(),
            with_seven.next_after(after, Tz::UTC, None).unwrap(),
        );
    }

    #[test]
    fn test_parse_rejections() {
        for bad in [
            "",
            "* * * * *",                 // five fields
            "0 0 0 * * ? * extra",       // eight fields
            "60 0 0 * * ?",              // second out of range
            "0 0 25 * * ?",              // hour out of range
            "0 0 0 32 * ?",              // day out of range
            "0 0 0 * 13 ?",              // month out of range
            "0 0 0 ? * ?",               // both '?'
            "0 0 0 15 * MON",            // both constrained
            "0 0 0 L-31 * ?",            // offset out of range
            "0 0 0 * * 2#6",             // nth out of range
            "0 0 0 * * FOO",             // unknown name
            "0 0 0 5-2 * ?",             // reversed range
            "0 0/0 0 * * ?",             // zero step
        ] {
            assert!(CronExpr::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_six_field_form() {
        let cron = CronExpr::parse("0 0 9 * * ?").unwrap();
        assert_eq!(
            cron.next_after(instant("2024-03-01T00:00:00Z"), Tz::UTC, None)
                .unwrap(),
            Some(instant("2024-03-01T09:00:00Z"))
        );
    }

    #[test]
    fn test_helper_days_in_month() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
        assert_eq!(days_in_month(2024, 4), 30);
    }
}

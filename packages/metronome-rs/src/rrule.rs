//! iCalendar recurrence rules (subset).
//!
//! Semicolon-separated `KEY=VALUE` pairs. Supported keys: `FREQ`
//! (`DAILY|WEEKLY|MONTHLY`), `INTERVAL`, `COUNT`, `UNTIL` (`YYYYMMDD` or
//! ISO-8601), `BYDAY` (`SU|MO|TU|WE|TH|FR|SA` list), `BYMONTHDAY`,
//! `BYMONTH`, `BYSETPOS` (non-zero integers), `BYHOUR`, `BYMINUTE`,
//! `BYSECOND`, `DTSTART`, `EXDATE`. Unknown keys are rejected.
//!
//! Candidate days align to the series start by frequency and interval:
//! DAILY divides the day difference, WEEKLY the Monday-aligned week
//! difference, MONTHLY the month difference. Within an aligned day,
//! candidates enumerate over `BYHOUR × BYMINUTE × BYSECOND` ascending
//! (defaulting to the start-of-series time of day) and are tested against
//! `BYMONTH`, `BYMONTHDAY`, `BYDAY`, and `BYSETPOS`. `EXDATE`s and the
//! calendar filter exclude matches. Local times that fall into a DST gap
//! are skipped; ambiguous times resolve to their earliest instant.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::calendar::CalendarFilter;
use crate::cron::{days_in_month, MAX_PLAN_STEPS};
use crate::error::SchedulerError;

/// Recurrence frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RRule {
    freq: Frequency,
    interval: u32,
    count: Option<u32>,
    until: Option<DateTime<Utc>>,
    /// 0=Sunday .. 6=Saturday.
    by_day: Vec<u8>,
    /// Non-zero; negatives count from the end of the month.
    by_month_day: Vec<i32>,
    by_month: Vec<u32>,
    /// Non-zero; negatives count from the end of the occurrence list.
    by_set_pos: Vec<i32>,
    by_hour: Vec<u32>,
    by_minute: Vec<u32>,
    by_second: Vec<u32>,
    dtstart: Option<DateTime<Utc>>,
    exdates: Vec<DateTime<Utc>>,
}

fn invalid(rule: &str, detail: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Validation(format!("invalid rrule {rule:?}: {detail}"))
}

/// Parse `YYYYMMDD`, `YYYYMMDDTHHMMSS[Z]`, or RFC 3339. Returns the instant
/// and whether the input was date-only.
fn parse_stamp(s: &str) -> Option<(DateTime<Utc>, bool)> {
    let s = s.trim();
    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        let date = NaiveDate::parse_from_str(s, "%Y%m%d").ok()?;
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some((Utc.from_utc_datetime(&naive), true));
    }
    for fmt in ["%Y%m%dT%H%M%SZ", "%Y%m%dT%H%M%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some((Utc.from_utc_datetime(&naive), false));
        }
    }
    s.parse::<DateTime<Utc>>().ok().map(|dt| (dt, false))
}

fn parse_list<T, F>(rule: &str, key: &str, value: &str, mut f: F) -> Result<Vec<T>, SchedulerError>
where
    F: FnMut(&str) -> Option<T>,
{
    value
        .split(',')
        .map(|item| {
            f(item.trim()).ok_or_else(|| invalid(rule, format!("bad {key} item {item:?}")))
        })
        .collect()
}

impl RRule {
    /// Parse a recurrence rule string.
    pub fn parse(rule: &str) -> Result<Self, SchedulerError> {
        let mut freq = None;
        let mut out = RRule {
            freq: Frequency::Daily,
            interval: 1,
            count: None,
            until: None,
            by_day: Vec::new(),
            by_month_day: Vec::new(),
            by_month: Vec::new(),
            by_set_pos: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
            by_second: Vec::new(),
            dtstart: None,
            exdates: Vec::new(),
        };

        for part in rule.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(rule, format!("expected KEY=VALUE, got {part:?}")))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();

            match key.as_str() {
                "FREQ" => {
                    freq = Some(match value.to_ascii_uppercase().as_str() {
                        "DAILY" => Frequency::Daily,
                        "WEEKLY" => Frequency::Weekly,
                        "MONTHLY" => Frequency::Monthly,
                        other => return Err(invalid(rule, format!("unsupported FREQ {other:?}"))),
                    });
                }
                "INTERVAL" => {
                    out.interval = value
                        .parse::<u32>()
                        .ok()
                        .filter(|i| *i >= 1)
                        .ok_or_else(|| invalid(rule, format!("bad INTERVAL {value:?}")))?;
                }
                "COUNT" => {
                    out.count = Some(
                        value
                            .parse::<u32>()
                            .ok()
                            .filter(|c| *c >= 1)
                            .ok_or_else(|| invalid(rule, format!("bad COUNT {value:?}")))?,
                    );
                }
                "UNTIL" => {
                    let (instant, date_only) = parse_stamp(value)
                        .ok_or_else(|| invalid(rule, format!("bad UNTIL {value:?}")))?;
                    // A date-only UNTIL includes the whole day.
                    out.until = Some(if date_only {
                        instant + chrono::Duration::seconds(86_399)
                    } else {
                        instant
                    });
                }
                "BYDAY" => {
                    out.by_day = parse_list(rule, "BYDAY", value, |item| {
                        match item.to_ascii_uppercase().as_str() {
                            "SU" => Some(0u8),
                            "MO" => Some(1),
                            "TU" => Some(2),
                            "WE" => Some(3),
                            "TH" => Some(4),
                            "FR" => Some(5),
                            "SA" => Some(6),
                            _ => None,
                        }
                    })?;
                }
                "BYMONTHDAY" => {
                    out.by_month_day = parse_list(rule, "BYMONTHDAY", value, |item| {
                        item.parse::<i32>()
                            .ok()
                            .filter(|d| *d != 0 && d.abs() <= 31)
                    })?;
                }
                "BYMONTH" => {
                    out.by_month = parse_list(rule, "BYMONTH", value, |item| {
                        item.parse::<u32>().ok().filter(|m| (1..=12).contains(m))
                    })?;
                }
                "BYSETPOS" => {
                    out.by_set_pos = parse_list(rule, "BYSETPOS", value, |item| {
                        item.parse::<i32>()
                            .ok()
                            .filter(|p| *p != 0 && p.abs() <= 366)
                    })?;
                }
                "BYHOUR" => {
                    out.by_hour = parse_list(rule, "BYHOUR", value, |item| {
                        item.parse::<u32>().ok().filter(|h| *h <= 23)
                    })?;
                }
                "BYMINUTE" => {
                    out.by_minute = parse_list(rule, "BYMINUTE", value, |item| {
                        item.parse::<u32>().ok().filter(|m| *m <= 59)
                    })?;
                }
                "BYSECOND" => {
                    out.by_second = parse_list(rule, "BYSECOND", value, |item| {
                        item.parse::<u32>().ok().filter(|s| *s <= 59)
                    })?;
                }
                "DTSTART" => {
                    out.dtstart = Some(
                        parse_stamp(value)
                            .ok_or_else(|| invalid(rule, format!("bad DTSTART {value:?}")))?
                            .0,
                    );
                }
                "EXDATE" => {
                    out.exdates = parse_list(rule, "EXDATE", value, |item| {
                        parse_stamp(item).map(|(dt, _)| dt)
                    })?;
                }
                other => return Err(invalid(rule, format!("unknown key {other:?}"))),
            }
        }

        out.freq = freq.ok_or_else(|| invalid(rule, "missing FREQ"))?;
        for list in [&mut out.by_hour, &mut out.by_minute, &mut out.by_second] {
            list.sort_unstable();
            list.dedup();
        }
        Ok(out)
    }

    /// The explicit series start, when `DTSTART` was given.
    pub fn dtstart(&self) -> Option<DateTime<Utc>> {
        self.dtstart
    }

    fn day_aligned(&self, date: NaiveDate, start: NaiveDate) -> bool {
        match self.freq {
            Frequency::Daily => {
                (date - start).num_days() % i64::from(self.interval) == 0
            }
            Frequency::Weekly => {
                let week = |d: NaiveDate| {
                    d - chrono::Duration::days(i64::from(d.weekday().num_days_from_monday()))
                };
                ((week(date) - week(start)).num_days() / 7) % i64::from(self.interval) == 0
            }
            Frequency::Monthly => {
                let months = i64::from(date.year() - start.year()) * 12
                    + i64::from(date.month() as i32 - start.month() as i32);
                months % i64::from(self.interval) == 0
            }
        }
    }

    fn day_filters_pass(&self, date: NaiveDate, start: NaiveDate) -> bool {
        if !self.by_month.is_empty() && !self.by_month.contains(&date.month()) {
            return false;
        }

        if !self.by_month_day.is_empty() {
            let last = days_in_month(date.year(), date.month()) as i32;
            let day = date.day() as i32;
            let hit = self
                .by_month_day
                .iter()
                .any(|&d| if d > 0 { day == d } else { day == last + d + 1 });
            if !hit {
                return false;
            }
        }

        let weekday = date.weekday().num_days_from_sunday() as u8;
        if !self.by_day.is_empty() {
            if !self.by_day.contains(&weekday) {
                return false;
            }
        } else {
            // Defaults from the series start when no day rule is present.
            match self.freq {
                Frequency::Weekly => {
                    if weekday != start.weekday().num_days_from_sunday() as u8 {
                        return false;
                    }
                }
                Frequency::Monthly => {
                    if self.by_month_day.is_empty() && date.day() != start.day() {
                        return false;
                    }
                }
                Frequency::Daily => {}
            }
        }

        if !self.by_set_pos.is_empty() {
            let (occurrence, total) = match self.freq {
                Frequency::Monthly => {
                    // Occurrence index of this weekday within the month.
                    let occurrence = (date.day() - 1) / 7 + 1;
                    let first = (date.day() - 1) % 7 + 1;
                    let total = (days_in_month(date.year(), date.month()) - first) / 7 + 1;
                    (occurrence as i32, total as i32)
                }
                Frequency::Weekly => {
                    // Index within the sorted BYDAY set.
                    let mut days = if self.by_day.is_empty() {
                        vec![start.weekday().num_days_from_sunday() as u8]
                    } else {
                        self.by_day.clone()
                    };
                    days.sort_unstable();
                    days.dedup();
                    let idx = days.iter().position(|&d| d == weekday).unwrap_or(0) as i32;
                    (idx + 1, days.len() as i32)
                }
                Frequency::Daily => return true,
            };
            let hit = self.by_set_pos.iter().any(|&p| {
                if p > 0 {
                    occurrence == p
                } else {
                    occurrence == total + p + 1
                }
            });
            if !hit {
                return false;
            }
        }

        true
    }

    /// First occurrence strictly after `after`, in `tz`, with `series_start`
    /// as the fallback when the rule has no `DTSTART`.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
        tz: Tz,
        series_start: DateTime<Utc>,
        calendar: Option<&CalendarFilter>,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let start = self.dtstart.unwrap_or(series_start);
        let start_local = tz.from_utc_datetime(&start.naive_utc()).naive_local();
        let start_date = start_local.date();

        let hours = if self.by_hour.is_empty() {
            vec![start_local.hour()]
        } else {
            self.by_hour.clone()
        };
        let minutes = if self.by_minute.is_empty() {
            vec![start_local.minute()]
        } else {
            self.by_minute.clone()
        };
        let seconds = if self.by_second.is_empty() {
            vec![start_local.second()]
        } else {
            self.by_second.clone()
        };

        let mut emitted: u32 = 0;
        let mut date = start_date;

        for _ in 0..MAX_PLAN_STEPS {
            if self.day_aligned(date, start_date)
                && self.day_filters_pass(date, start_date)
                && calendar.map_or(true, |c| c.accepts(date))
            {
                for &h in &hours {
                    for &m in &minutes {
                        for &s in &seconds {
                            let Some(naive) = date.and_hms_opt(h, m, s) else {
                                continue;
                            };
                            let resolved = match tz.from_local_datetime(&naive) {
                                chrono::LocalResult::None => continue,
                                chrono::LocalResult::Single(dt) => dt,
                                chrono::LocalResult::Ambiguous(earliest, _) => earliest,
                            };
                            let utc = resolved.with_timezone(&Utc);
                            if utc < start {
                                continue;
                            }
                            if let Some(until) = self.until {
                                if utc > until {
                                    return Ok(None);
                                }
                            }
                            if self.exdates.contains(&utc) {
                                continue;
                            }
                            emitted += 1;
                            if let Some(count) = self.count {
                                if emitted > count {
                                    return Ok(None);
                                }
                            }
                            if utc > after {
                                return Ok(Some(utc));
                            }
                        }
                    }
                }
            }

            date = match date.succ_opt() {
                Some(d) => d,
                None => return Ok(None),
            };
        }

        Err(SchedulerError::State(format!(
            "no rrule occurrence found within {MAX_PLAN_STEPS} candidate days"
        )))
    }
}

//! Include/exclude date rules with wildcards.
//!
//! Calendar rules restrict the dates a trigger may fire on. Each entry has
//! the form `YYYY-MM-DD` where `*` is permitted in any of the three
//! positions. The filter accepts a date iff:
//!
//! - no include entry exists, OR the date matches some include entry; AND
//! - no exclude entry matches.
//!
//! Exact entries (no wildcards) are matched through a set; wildcard entries
//! compare field by field against the date's local fields. Malformed
//! entries fail at construction, not at match time.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// One include/exclude rule, as carried in trigger options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarRule {
    /// Dates the trigger may fire on. Empty means "no include constraint".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    /// Dates the trigger must not fire on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl CalendarRule {
    /// Rule with only include entries.
    pub fn include<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: entries.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    /// Rule with only exclude entries.
    pub fn exclude<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: Vec::new(),
            exclude: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Add exclude entries to an include rule.
    pub fn with_exclude<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(entries.into_iter().map(Into::into));
        self
    }
}

/// A parsed `YYYY-MM-DD` entry with optional wildcard fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DatePattern {
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
}

impl DatePattern {
    fn parse(entry: &str) -> Result<Self, SchedulerError> {
        let bad = || SchedulerError::Validation(format!("malformed calendar entry: {entry:?}"));

        let mut parts = entry.split('-');
        let (Some(y), Some(m), Some(d), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };

        let year = match y {
            "*" => None,
            s => Some(s.parse::<i32>().map_err(|_| bad())?),
        };
        let month = match m {
            "*" => None,
            s => Some(s.parse::<u32>().map_err(|_| bad())?),
        };
        let day = match d {
            "*" => None,
            s => Some(s.parse::<u32>().map_err(|_| bad())?),
        };

        if let Some(m) = month {
            if !(1..=12).contains(&m) {
                return Err(SchedulerError::Validation(format!(
                    "calendar month out of range in {entry:?}"
                )));
            }
        }
        if let Some(d) = day {
            if !(1..=31).contains(&d) {
                return Err(SchedulerError::Validation(format!(
                    "calendar day out of range in {entry:?}"
                )));
            }
        }

        Ok(Self { year, month, day })
    }

    fn is_exact(&self) -> bool {
        self.year.is_some() && self.month.is_some() && self.day.is_some()
    }

    fn matches(&self, date: NaiveDate) -> bool {
        self.year.map_or(true, |y| y == date.year())
            && self.month.map_or(true, |m| m == date.month())
            && self.day.map_or(true, |d| d == date.day())
    }
}

/// Compiled calendar filter.
#[derive(Debug, Clone, Default)]
pub struct CalendarFilter {
    has_include: bool,
    include_exact: HashSet<(i32, u32, u32)>,
    include_wild: Vec<DatePattern>,
    exclude_exact: HashSet<(i32, u32, u32)>,
    exclude_wild: Vec<DatePattern>,
}

impl CalendarFilter {
    /// Compile a set of rules, validating every entry.
    pub fn new(rules: &[CalendarRule]) -> Result<Self, SchedulerError> {
        let mut filter = CalendarFilter::default();
        for rule in rules {
            for entry in &rule.include {
                filter.has_include = true;
                let pattern = DatePattern::parse(entry)?;
                if pattern.is_exact() {
                    filter.include_exact.insert((
                        pattern.year.unwrap_or_default(),
                        pattern.month.unwrap_or_default(),
                        pattern.day.unwrap_or_default(),
                    ));
                } else {
                    filter.include_wild.push(pattern);
                }
            }
            for entry in &rule.exclude {
                let pattern = DatePattern::parse(entry)?;
                if pattern.is_exact() {
                    filter.exclude_exact.insert((
                        pattern.year.unwrap_or_default(),
                        pattern.month.unwrap_or_default(),
                        pattern.day.unwrap_or_default(),
                    ));
                } else {
                    filter.exclude_wild.push(pattern);
                }
            }
        }
        Ok(filter)
    }

    /// Whether the filter accepts a local date.
    pub fn accepts(&self, date: NaiveDate) -> bool {
        let key = (date.year(), date.month(), date.day());

        if self.has_include {
            let included = self.include_exact.contains(&key)
                || self.include_wild.iter().any(|p| p.matches(date));
            if !included {
                return false;
            }
        }

        !(self.exclude_exact.contains(&key)
            || self.exclude_wild.iter().any(|p| p.matches(date)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = CalendarFilter::new(&[]).unwrap();
        assert!(filter.accepts(date("2024-06-15")));
    }

    #[test]
    fn test_include_restricts() {
        let filter =
            CalendarFilter::new(&[CalendarRule::include(["2024-01-02", "2024-01-03"])]).unwrap();
        assert!(filter.accepts(date("2024-01-02")));
        assert!(filter.accepts(date("2024-01-03")));
        assert!(!filter.accepts(date("2024-01-04")));
    }

    #[test]
    fn test_exclude_removes() {
        let filter = CalendarFilter::new(&[CalendarRule::exclude(["2024-12-25"])]).unwrap();
        assert!(filter.accepts(date("2024-12-24")));
        assert!(!filter.accepts(date("2024-12-25")));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = CalendarFilter::new(&[
            CalendarRule::include(["2024-01-02", "2024-01-03"]).with_exclude(["2024-01-03"])
        ])
        .unwrap();
        assert!(filter.accepts(date("2024-01-02")));
        assert!(!filter.accepts(date("2024-01-03")));
    }

    #[test]
    fn test_wildcard_day() {
        // First of every month, any year.
        let filter = CalendarFilter::new(&[CalendarRule::include(["*-*-01"])]).unwrap();
        assert!(filter.accepts(date("2024-03-01")));
        assert!(filter.accepts(date("2031-11-01")));
        assert!(!filter.accepts(date("2024-03-02")));
    }

    #[test]
    fn test_wildcard_month_exclude() {
        // Never fire on the 13th of any month in 2024.
        let filter = CalendarFilter::new(&[CalendarRule::exclude(["2024-*-13"])]).unwrap();
        assert!(!filter.accepts(date("2024-09-13")));
        assert!(filter.accepts(date("2025-09-13")));
    }

    #[test]
    fn test_multiple_rules_combine() {
        let filter = CalendarFilter::new(&[
            CalendarRule::include(["2024-06-*"]),
            CalendarRule::exclude(["2024-06-15"]),
        ])
        .unwrap();
        assert!(filter.accepts(date("2024-06-14")));
        assert!(!filter.accepts(date("2024-06-15")));
        assert!(!filter.accepts(date("2024-07-01")));
    }

    #[test]
    fn test_malformed_entries_fail_at_construction() {
        for bad in ["2024-01", "2024/01/02", "2024-13-01", "2024-00-10", "2024-01-32", "x-*-*"] {
            let err = CalendarFilter::new(&[CalendarRule::include([bad])]).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Validation, "{bad:?}");
        }
    }
}

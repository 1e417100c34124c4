//! Trigger planners.
//!
//! Every trigger kind reduces to one interface: the first fire instant
//! strictly after a given instant, or none when the series is exhausted.
//! [`TriggerPlanner`] is the tagged facade over the four kinds; it owns the
//! shared constraints (`start_at`, `end_at`, `max_runs`, calendar filter,
//! timezone) so the engine depends only on `next()`.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::calendar::CalendarFilter;
use crate::cron::{CronExpr, MAX_PLAN_STEPS};
use crate::duration::parse_duration;
use crate::error::SchedulerError;
use crate::rrule::RRule;
use crate::timezone::resolve_zone;
use crate::trigger::{TriggerKind, TriggerOptions};

#[derive(Debug, Clone)]
enum PlannerKind {
    Cron(CronExpr),
    Every {
        anchor: DateTime<Utc>,
        interval_ms: i64,
    },
    At {
        run_at: DateTime<Utc>,
    },
    Rrule {
        rule: RRule,
        series_start: DateTime<Utc>,
    },
}

/// Planner for one trigger, embedding the shared constraints.
///
/// `next` is strictly-after; the engine computes a trigger's initial
/// `next_run_at` through [`TriggerPlanner::first`], which is at-or-after.
#[derive(Debug, Clone)]
pub struct TriggerPlanner {
    kind: PlannerKind,
    tz: Tz,
    calendar: Option<CalendarFilter>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    max_runs: Option<u32>,
    emitted: u32,
}

impl TriggerPlanner {
    /// Validate options and build the planner. `created_at` anchors an
    /// `every` series (and an rrule series without `DTSTART`) when the
    /// options carry no `start_at`.
    pub fn new(
        options: &TriggerOptions,
        created_at: DateTime<Utc>,
    ) -> Result<Self, SchedulerError> {
        let tz = resolve_zone(options.timezone.as_deref())?;
        let calendar = if options.calendars.is_empty() {
            None
        } else {
            Some(CalendarFilter::new(&options.calendars)?)
        };

        let kind = match &options.kind {
            TriggerKind::Cron { expr } => PlannerKind::Cron(CronExpr::parse(expr)?),
            TriggerKind::Every { every, offset } => {
                let interval = parse_duration(every)?;
                let interval_ms = interval.as_millis() as i64;
                if interval_ms <= 0 {
                    return Err(SchedulerError::Validation(
                        "every interval must be positive".into(),
                    ));
                }
                let offset_ms = match offset {
                    Some(o) => parse_duration(o)?.as_millis() as i64,
                    None => 0,
                };
                let anchor = options.start_at.unwrap_or(created_at)
                    + chrono::Duration::milliseconds(offset_ms);
                PlannerKind::Every {
                    anchor,
                    interval_ms,
                }
            }
            TriggerKind::At { run_at } => PlannerKind::At { run_at: *run_at },
            TriggerKind::Rrule { rule } => {
                let rule = RRule::parse(rule)?;
                let series_start = rule
                    .dtstart()
                    .or(options.start_at)
                    .unwrap_or(created_at);
                PlannerKind::Rrule { rule, series_start }
            }
        };

        Ok(Self {
            kind,
            tz,
            calendar,
            start_at: options.start_at,
            end_at: options.end_at,
            max_runs: options.max_runs,
            emitted: 0,
        })
    }

    /// First fire strictly after `after`, or `Ok(None)` once exhausted.
    pub fn next(&mut self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        if let Some(max) = self.max_runs {
            if self.emitted >= max {
                return Ok(None);
            }
        }

        let after = match self.start_at {
            Some(start) if start > after => start - chrono::Duration::milliseconds(1),
            _ => after,
        };

        let next = match &self.kind {
            PlannerKind::Cron(expr) => expr.next_after(after, self.tz, self.calendar.as_ref())?,
            PlannerKind::Every {
                anchor,
                interval_ms,
            } => self.next_every(*anchor, *interval_ms, after)?,
            PlannerKind::At { run_at } => {
                let accepted = self.calendar.as_ref().map_or(true, |c| {
                    c.accepts(self.tz.from_utc_datetime(&run_at.naive_utc()).date_naive())
                });
                (*run_at > after && accepted).then_some(*run_at)
            }
            PlannerKind::Rrule { rule, series_start } => {
                rule.next_after(after, self.tz, *series_start, self.calendar.as_ref())?
            }
        };

        match next {
            Some(t) if self.end_at.map_or(true, |end| t <= end) => {
                self.emitted += 1;
                Ok(Some(t))
            }
            _ => Ok(None),
        }
    }

    /// First fire at or after `from`.
    pub fn first(&mut self, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        self.next(from - chrono::Duration::milliseconds(1))
    }

    fn next_every(
        &self,
        anchor: DateTime<Utc>,
        interval_ms: i64,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let mut k = if after < anchor {
            0
        } else {
            (after - anchor).num_milliseconds() / interval_ms + 1
        };

        for _ in 0..MAX_PLAN_STEPS {
            let Some(offset) = interval_ms.checked_mul(k) else {
                return Ok(None);
            };
            let candidate = anchor + chrono::Duration::milliseconds(offset);
            if let Some(end) = self.end_at {
                if candidate > end {
                    return Ok(None);
                }
            }
            let local_date = self
                .tz
                .from_utc_datetime(&candidate.naive_utc())
                .date_naive();
            if self.calendar.as_ref().map_or(true, |c| c.accepts(local_date)) {
                return Ok(Some(candidate));
            }
            k += 1;
        }

        Err(SchedulerError::State(format!(
            "no interval occurrence found within {MAX_PLAN_STEPS} candidates"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarRule;
    use crate::trigger::TriggerOptions;

    fn instant(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn planner(options: TriggerOptions, created: &str) -> TriggerPlanner {
        TriggerPlanner::new(&options, instant(created)).unwrap()
    }

    #[test]
    fn test_every_fires_on_anchor_grid() {
        let mut p = planner(TriggerOptions::every("30s"), "2024-01-01T00:00:00Z");
        assert_eq!(
            p.next(instant("2024-01-01T00:00:00Z")).unwrap(),
            Some(instant("2024-01-01T00:00:30Z"))
        );
        // Mid-interval lands on the next grid point.
        assert_eq!(
            p.next(instant("2024-01-01T00:01:10Z")).unwrap(),
            Some(instant("2024-01-01T00:01:30Z"))
        );
    }

    #[test]
    fn test_every_offset_shifts_anchor() {
        let mut p = planner(
            TriggerOptions::every("1m").with_offset("15s"),
            "2024-01-01T00:00:00Z",
        );
        assert_eq!(
            p.next(instant("2024-01-01T00:00:00Z")).unwrap(),
            Some(instant("2024-01-01T00:00:15Z"))
        );
        assert_eq!(
            p.next(instant("2024-01-01T00:00:15Z")).unwrap(),
            Some(instant("2024-01-01T00:01:15Z"))
        );
    }

    #[test]
    fn test_every_bare_millis() {
        let mut p = planner(TriggerOptions::every("1500"), "2024-01-01T00:00:00Z");
        assert_eq!(
            p.next(instant("2024-01-01T00:00:00Z")).unwrap(),
            Some(instant("2024-01-01T00:00:01.500Z"))
        );
    }

    #[test]
    fn test_every_respects_start_at() {
        let mut p = planner(
            TriggerOptions::every("1h").with_start_at(instant("2024-06-01T00:00:00Z")),
            "2024-01-01T00:00:00Z",
        );
        // Asked for a fire long before start_at: the anchor fire itself.
        assert_eq!(
            p.next(instant("2024-01-15T00:00:00Z")).unwrap(),
            Some(instant("2024-06-01T00:00:00Z"))
        );
    }

    #[test]
    fn test_every_end_at_exhausts() {
        let mut p = planner(
            TriggerOptions::every("1h").with_end_at(instant("2024-01-01T02:00:00Z")),
            "2024-01-01T00:00:00Z",
        );
        assert_eq!(
            p.next(instant("2024-01-01T01:30:00Z")).unwrap(),
            Some(instant("2024-01-01T02:00:00Z"))
        );
        assert_eq!(p.next(instant("2024-01-01T02:00:00Z")).unwrap(), None);
    }

    #[test]
    fn test_every_skips_excluded_dates() {
        let mut p = planner(
            TriggerOptions::every("12h").with_calendar(CalendarRule::exclude(["2024-01-02"])),
            "2024-01-01T00:00:00Z",
        );
        assert_eq!(
            p.next(instant("2024-01-01T12:00:00Z")).unwrap(),
            // Both Jan 2 grid points are excluded.
            Some(instant("2024-01-03T00:00:00Z"))
        );
    }

    #[test]
    fn test_max_runs_counts_fires() {
        let mut p = planner(
            TriggerOptions::every("1m").with_max_runs(2),
            "2024-01-01T00:00:00Z",
        );
        let first = p.next(instant("2024-01-01T00:00:00Z")).unwrap().unwrap();
        let second = p.next(first).unwrap().unwrap();
        assert_eq!(second, instant("2024-01-01T00:02:00Z"));
        assert_eq!(p.next(second).unwrap(), None);
    }

    #[test]
    fn test_at_fires_exactly_once() {
        let mut p = planner(
            TriggerOptions::at(instant("2024-05-01T10:00:00Z")),
            "2024-01-01T00:00:00Z",
        );
        assert_eq!(
            p.next(instant("2024-04-30T00:00:00Z")).unwrap(),
            Some(instant("2024-05-01T10:00:00Z"))
        );
        assert_eq!(p.next(instant("2024-05-01T10:00:00Z")).unwrap(), None);
    }

    #[test]
    fn test_first_is_at_or_after() {
        let run_at = instant("2024-05-01T10:00:00Z");
        let mut p = planner(TriggerOptions::at(run_at), "2024-01-01T00:00:00Z");
        assert_eq!(p.first(run_at).unwrap(), Some(run_at));
    }

    #[test]
    fn test_cron_kind_dispatches() {
        let mut p = planner(
            TriggerOptions::cron("0 0 9 * * ? *").with_timezone("Asia/Jakarta"),
            "2024-01-01T00:00:00Z",
        );
        assert_eq!(
            p.next(instant("2024-03-01T00:00:00Z")).unwrap(),
            Some(instant("2024-03-01T02:00:00Z"))
        );
    }

    #[test]
    fn test_rrule_kind_uses_start_at_as_series_start() {
        let mut p = planner(
            TriggerOptions::rrule("FREQ=MONTHLY;BYDAY=MO;BYSETPOS=1")
                .with_timezone("Pacific/Auckland")
                .with_start_at(instant("2024-01-01T01:00:00Z")),
            "2023-06-01T00:00:00Z",
        );
        assert_eq!(
            p.next(instant("2024-02-01T00:00:00Z")).unwrap(),
            Some(instant("2024-02-05T01:00:00Z"))
        );
    }

    #[test]
    fn test_validation_errors_surface() {
        let bad_cron = TriggerPlanner::new(
            &TriggerOptions::cron("not a cron"),
            instant("2024-01-01T00:00:00Z"),
        );
        assert!(bad_cron.is_err());

        let bad_every = TriggerPlanner::new(
            &TriggerOptions::every("5parsecs"),
            instant("2024-01-01T00:00:00Z"),
        );
        assert!(bad_every.is_err());

        let zero_every = TriggerPlanner::new(
            &TriggerOptions::every("0"),
            instant("2024-01-01T00:00:00Z"),
        );
        assert!(zero_every.is_err());

        let bad_zone = TriggerPlanner::new(
            &TriggerOptions::every("5m").with_timezone("Nowhere/Void"),
            instant("2024-01-01T00:00:00Z"),
        );
        assert!(bad_zone.is_err());
    }

    #[test]
    fn test_monotonic_over_kinds() {
        for options in [
            TriggerOptions::cron("0 0 */6 * * ? *"),
            TriggerOptions::every("45m"),
            TriggerOptions::rrule("FREQ=DAILY;BYHOUR=6,18;BYMINUTE=0;BYSECOND=0"),
        ] {
            let mut p = planner(options.clone(), "2024-01-01T00:00:00Z");
            let a = p.next(instant("2024-01-02T00:00:00Z")).unwrap().unwrap();
            let mut p2 = planner(options, "2024-01-01T00:00:00Z");
            let b = p2.next(instant("2024-01-03T00:00:00Z")).unwrap().unwrap();
            assert!(b >= a);
        }
    }
}

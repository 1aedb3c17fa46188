//! When recurring jobs fire.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult};

/// Computes fire times for a recurring job.
pub trait Schedule: Send + Sync + fmt::Debug {
    /// The first fire time after `after`, or `None` if the schedule is exhausted.
    fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// The first fire time once the worker starts at `now`.
    fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_run(now)
    }
}

/// Fire immediately on start, then every `every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    every: Duration,
}

impl Interval {
    #[must_use]
    pub const fn new(every: Duration) -> Self {
        Self { every }
    }

    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }
}

impl Schedule for Interval {
    fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let every = chrono::Duration::from_std(self.every).ok()?;
        after.checked_add_signed(every)
    }

    fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(now)
    }
}

/// Standard 5-field cron expression evaluated in UTC.
///
/// Numeric days of the week follow crontab: `0` and `7` are Sunday.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse `minute hour day-of-month month day-of-week`.
    pub fn parse(expression: &str) -> ControlResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day, month, weekday] = fields[..] else {
            return Err(ControlError::Config(format!(
                "cron expression {expression:?} must have 5 fields"
            )));
        };

        let normalized = format!(
            "0 {minute} {hour} {day} {month} {}",
            normalize_weekdays(weekday)
        );
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            ControlError::Config(format!("invalid cron expression {expression:?}: {e}"))
        })?;

        Ok(Self {
            expression: expression.to_owned(),
            schedule,
        })
    }

    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl Schedule for CronSchedule {
    fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Map crontab day numbers (Sunday = 0 or 7) to names, which the parser
/// reads unambiguously.
fn normalize_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(normalize_weekday_part)
        .collect::<Vec<_>>()
        .join(",")
}

fn normalize_weekday_part(part: &str) -> String {
    const NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

    let day = |token: &str| -> String {
        token
            .parse::<usize>()
            .ok()
            .and_then(|n| NAMES.get(n))
            .map_or_else(|| token.to_owned(), |name| (*name).to_owned())
    };

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };
    let with_step = |range: String| match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
    };

    let Some((start, end)) = range.split_once('-') else {
        return with_step(day(range));
    };

    // Names wrap Sunday to the front, so a range ending at 7 would descend.
    let start_day = start.parse::<usize>().ok();
    match (start_day, end.parse::<usize>().ok()) {
        (Some(0), Some(7)) => with_step("SUN-SAT".to_owned()),
        (Some(7), Some(7)) => "SUN".to_owned(),
        (Some(first @ 1..=6), Some(7)) => {
            let every = step.and_then(|s| s.parse::<usize>().ok()).unwrap_or(1);
            let weekdays = with_step(format!("{}-SAT", day(start)));
            if every > 0 && (7 - first) % every == 0 {
                format!("{weekdays},SUN")
            } else {
                weekdays
            }
        }
        _ => with_step(format!("{}-{}", day(start), day(end))),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn interval_fires_immediately_then_periodically() {
        let schedule = Interval::from_secs(600);
        let now = at(2026, 3, 1, 12, 0);

        assert_eq!(schedule.first_run(now), Some(now));
        assert_eq!(schedule.next_run(now), Some(at(2026, 3, 1, 12, 10)));
    }

    #[test]
    fn cron_waits_for_next_match() {
        let hourly = CronSchedule::parse("0 * * * *").expect("parse failed");
        let now = at(2026, 3, 1, 12, 30);

        assert_eq!(hourly.first_run(now), Some(at(2026, 3, 1, 13, 0)));
        assert_eq!(
            hourly.next_run(at(2026, 3, 1, 13, 0)),
            Some(at(2026, 3, 1, 14, 0))
        );

        let midnight = CronSchedule::parse("0 0 * * *").expect("parse failed");
        assert_eq!(midnight.next_run(now), Some(at(2026, 3, 2, 0, 0)));
    }

    #[test]
    fn cron_weekdays_use_crontab_numbering() {
        let sunday = CronSchedule::parse("0 9 * * 0").expect("parse failed");
        let next = sunday.next_run(at(2026, 3, 2, 0, 0)).expect("no next run");
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.hour(), 9);

        let also_sunday = CronSchedule::parse("0 9 * * 7").expect("parse failed");
        assert_eq!(also_sunday.next_run(at(2026, 3, 2, 0, 0)), Some(next));

        let weekdays = CronSchedule::parse("30 8 * * 1-5").expect("parse failed");
        let next = weekdays.next_run(at(2026, 3, 7, 0, 0)).expect("no next run");
        assert_eq!(next.weekday(), Weekday::Mon);

        // 2026-03-02 is a Monday.
        let weekend = CronSchedule::parse("0 9 * * 5-7").expect("parse failed");
        let fire_days: Vec<_> = weekend
            .schedule
            .after(&at(2026, 3, 2, 0, 0))
            .take(4)
            .map(|t| t.weekday())
            .collect();
        assert_eq!(
            fire_days,
            [Weekday::Fri, Weekday::Sat, Weekday::Sun, Weekday::Fri]
        );

        let every_day = CronSchedule::parse("0 9 * * 0-7").expect("parse failed");
        let next = every_day.next_run(at(2026, 3, 2, 0, 0)).expect("no next run");
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn weekday_ranges_ending_on_sunday_keep_their_steps() {
        assert_eq!(normalize_weekdays("5-7"), "FRI-SAT,SUN");
        assert_eq!(normalize_weekdays("0-7"), "SUN-SAT");
        assert_eq!(normalize_weekdays("1-7/2"), "MON-SAT/2,SUN");
        assert_eq!(normalize_weekdays("2-7/2"), "TUE-SAT/2");
        assert_eq!(normalize_weekdays("7-7"), "SUN");
        assert_eq!(normalize_weekdays("1,3-5"), "MON,WED-FRI");
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("0 0 * * * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
    }

    #[test]
    fn normalizes_weekday_lists_and_steps() {
        assert_eq!(normalize_weekdays("*"), "*");
        assert_eq!(normalize_weekdays("0,6"), "SUN,SAT");
        assert_eq!(normalize_weekdays("1-5/2"), "MON-FRI/2");
        assert_eq!(normalize_weekdays("*/2"), "*/2");
        assert_eq!(normalize_weekdays("MON"), "MON");
    }
}

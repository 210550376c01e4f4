//! Schedule computation for job definitions.
//!
//! Two kinds of schedule are supported: a fixed interval in seconds and a
//! cron expression. Cron expressions use the conventional five fields
//! (`minute hour day month weekday`), optionally preceded by a seconds field.
//! Evaluation happens in the job's timezone.

use super::job::ValidationError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Longest accepted interval.
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 3600;

/// When a job definition should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Run every `seconds` seconds.
    Interval { seconds: u64 },
    /// Run at the times matched by a cron expression.
    Cron { expression: String },
}

impl JobSchedule {
    pub fn interval(seconds: u64) -> Self {
        JobSchedule::Interval { seconds }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        JobSchedule::Cron {
            expression: expression.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobSchedule::Interval { .. } => "interval",
            JobSchedule::Cron { .. } => "cron",
        }
    }

    /// The value persisted alongside `kind()`.
    pub fn value(&self) -> String {
        match self {
            JobSchedule::Interval { seconds } => seconds.to_string(),
            JobSchedule::Cron { expression } => expression.clone(),
        }
    }

    pub fn from_parts(kind: &str, value: &str) -> Result<Self, ValidationError> {
        match kind {
            "interval" => value
                .parse::<u64>()
                .map(JobSchedule::interval)
                .map_err(|_| ValidationError::InvalidSchedule(format!("bad interval '{}'", value))),
            "cron" => Ok(JobSchedule::cron(value)),
            other => Err(ValidationError::InvalidSchedule(format!(
                "unknown schedule type '{}'",
                other
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            JobSchedule::Interval { seconds } if *seconds == 0 => Err(
                ValidationError::InvalidSchedule("interval must be at least 1 second".to_string()),
            ),
            JobSchedule::Interval { seconds } if *seconds > MAX_INTERVAL_SECS => {
                Err(ValidationError::InvalidSchedule(format!(
                    "interval must be at most {} seconds (366 days)",
                    MAX_INTERVAL_SECS
                )))
            }
            JobSchedule::Interval { .. } => Ok(()),
            JobSchedule::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// The first instant strictly after `after` matched by this schedule.
    pub fn next_run_after(
        &self,
        after: DateTime<Utc>,
        tz: Tz,
    ) -> Result<DateTime<Utc>, ValidationError> {
        match self {
            JobSchedule::Interval { seconds } => i64::try_from(*seconds)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|interval| after.checked_add_signed(interval))
                .ok_or_else(|| {
                    ValidationError::InvalidSchedule(format!(
                        "interval of {} seconds is out of range",
                        seconds
                    ))
                }),
            JobSchedule::Cron { expression } => {
                parse_cron(expression)?
                    .next_after(&after.with_timezone(&tz))
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok_or_else(|| {
                        ValidationError::InvalidSchedule(format!(
                            "'{}' has no future occurrence",
                            expression
                        ))
                    })
            }
        }
    }

    /// Next run for a job given its last run. A never-run interval job is due
    /// immediately; a never-run cron job waits for its next occurrence.
    pub fn next_run(
        &self,
        last_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<DateTime<Utc>, ValidationError> {
        match (self, last_run_at) {
            (_, Some(last)) => self.next_run_after(last, tz),
            (JobSchedule::Interval { .. }, None) => Ok(now),
            (JobSchedule::Cron { .. }, None) => self.next_run_after(now, tz),
        }
    }
}

/// Resolves an optional IANA timezone name, falling back to `default`.
pub fn resolve_timezone(name: Option<&str>, default: Tz) -> Result<Tz, ValidationError> {
    match name {
        None => Ok(default),
        Some(name) => Tz::from_str(name)
            .map_err(|_| ValidationError::InvalidTimezone(name.to_string())),
    }
}

/// A parsed cron expression. When both day-of-month and day-of-week are
/// restricted a day matches if either field does, so the expression is kept
/// as two schedules, each with one of the day fields widened to `*`.
struct CronSchedule {
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    fn next_after(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(after).next())
            .min()
    }
}

fn parse_cron(expression: &str) -> Result<CronSchedule, ValidationError> {
    let fields = normalize_cron(expression)?;
    let is_wildcard = |f: &str| f == "*" || f == "?";

    let variants = if is_wildcard(&fields[3]) || is_wildcard(&fields[5]) {
        vec![fields]
    } else {
        let mut by_month_day = fields.clone();
        by_month_day[5] = "*".to_string();
        let mut by_weekday = fields;
        by_weekday[3] = "*".to_string();
        vec![by_month_day, by_weekday]
    };

    let schedules = variants
        .iter()
        .map(|f| {
            cron::Schedule::from_str(&f.join(" ")).map_err(|e| {
                ValidationError::InvalidSchedule(format!("'{}': {}", expression, e))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CronSchedule { schedules })
}

/// Rewrites a 5- or 6-field expression into the seconds-first fields the
/// `cron` crate parses, translating numeric weekdays (0-7, Sunday = 0 or 7)
/// into names since the crate numbers Sunday as 1.
fn normalize_cron(expression: &str) -> Result<Vec<String>, ValidationError> {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => {
            return Err(ValidationError::InvalidSchedule(format!(
                "'{}' has {} fields, expected 5 or 6",
                expression, n
            )))
        }
    }

    fields[5] = translate_weekdays(&fields[5])
        .map_err(|e| ValidationError::InvalidSchedule(format!("'{}': {}", expression, e)))?;
    Ok(fields)
}

fn translate_weekdays(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        if item.is_empty() {
            return Err("empty weekday item".to_string());
        }
        if item.chars().any(|c| c.is_ascii_alphabetic()) || item == "*" || item == "?" {
            items.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("bad weekday step '{}'", step))?,
            ),
            None => (item, 1),
        };
        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => (parse_weekday(a)?, parse_weekday(b)?),
                None if item.contains('/') => (parse_weekday(range)?, 7),
                None => {
                    let day = parse_weekday(range)?;
                    (day, day)
                }
            },
        };
        if start > end {
            return Err(format!("bad weekday range '{}'", range));
        }
        for day in (start..=end).step_by(step) {
            let name = WEEKDAY_NAMES[day % 7];
            if !items.iter().any(|i| i == name) {
                items.push(name.to_string());
            }
        }
    }
    Ok(items.join(","))
}

fn parse_weekday(s: &str) -> Result<usize, String> {
    s.parse::<usize>()
        .ok()
        .filter(|d| *d <= 7)
        .ok_or_else(|| format!("bad weekday '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_monday_nine_after_nine_is_next_week() {
        // 2024-01-15 is a Monday.
        let schedule = JobSchedule::cron("0 9 * * MON");
        let next = schedule
            .next_run_after(utc(2024, 1, 15, 9, 5), Tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2024, 1, 22, 9, 0));
    }

    #[test]
    fn test_monday_nine_before_nine_is_same_day() {
        let schedule = JobSchedule::cron("0 9 * * MON");
        let next = schedule
            .next_run_after(utc(2024, 1, 15, 8, 59), Tz::UTC)
            .unwrap();
        assert_eq!(next, utc(2024, 1, 15, 9, 0));
    }

    #[test]
    fn test_cron_evaluated_in_timezone() {
        let schedule = JobSchedule::cron("0 9 * * MON");
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = schedule
            .next_run_after(utc(2024, 1, 15, 12, 0), tz)
            .unwrap();
        // 09:00 EST is 14:00 UTC.
        assert_eq!(next, utc(2024, 1, 15, 14, 0));
    }

    #[test]
    fn test_numeric_weekdays_use_sunday_zero() {
        let schedule = JobSchedule::cron("30 6 * * 0");
        let next = schedule
            .next_run_after(utc(2024, 1, 15, 0, 0), Tz::UTC)
            .unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!((next.hour(), next.minute()), (6, 30));

        let seven = JobSchedule::cron("30 6 * * 7")
            .next_run_after(utc(2024, 1, 15, 0, 0), Tz::UTC)
            .unwrap();
        assert_eq!(seven, next);
    }

    #[test]
    fn test_weekday_range_and_step() {
        assert_eq!(translate_weekdays("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(translate_weekdays("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(translate_weekdays("5-7").unwrap(), "FRI,SAT,SUN");
        assert_eq!(translate_weekdays("MON-FRI").unwrap(), "MON-FRI");
        assert!(translate_weekdays("8").is_err());
        assert!(translate_weekdays("5-2").is_err());
    }

    #[test]
    fn test_six_field_expression_accepted() {
        let schedule = JobSchedule::cron("30 0 3 * * *");
        let next = schedule
            .next_run_after(utc(2024, 1, 15, 4, 0), Tz::UTC)
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 16, 3, 0, 30).unwrap());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(JobSchedule::cron("not a cron").validate().is_err());
        assert!(JobSchedule::cron("0 9 * *").validate().is_err());
        assert!(JobSchedule::cron("99 9 * * *").validate().is_err());
        assert!(JobSchedule::interval(0).validate().is_err());
        assert!(JobSchedule::interval(60).validate().is_ok());
    }

    #[test]
    fn test_restricted_month_day_or_weekday_matches_either() {
        // 2024-01-02 is a Tuesday; the next Monday comes before Feb 1.
        let schedule = JobSchedule::cron("0 9 1 * MON");
        assert_eq!(
            schedule
                .next_run_after(utc(2024, 1, 2, 0, 0), Tz::UTC)
                .unwrap(),
            utc(2024, 1, 8, 9, 0)
        );
        // From Wed 2024-01-31 the 1st of February (a Thursday) is first.
        assert_eq!(
            schedule
                .next_run_after(utc(2024, 1, 31, 12, 0), Tz::UTC)
                .unwrap(),
            utc(2024, 2, 1, 9, 0)
        );
        // A wildcard day field keeps the other one authoritative.
        assert_eq!(
            JobSchedule::cron("0 9 1 * *")
                .next_run_after(utc(2024, 1, 2, 0, 0), Tz::UTC)
                .unwrap(),
            utc(2024, 2, 1, 9, 0)
        );
    }

    #[test]
    fn test_interval_bounds() {
        assert!(JobSchedule::interval(MAX_INTERVAL_SECS).validate().is_ok());
        for seconds in [MAX_INTERVAL_SECS + 1, 100_000_000_000_000_000, u64::MAX] {
            assert!(matches!(
                JobSchedule::interval(seconds).validate(),
                Err(ValidationError::InvalidSchedule(_))
            ));
        }
        // Past the chrono range the computation fails instead of panicking.
        for seconds in [100_000_000_000_000_000, u64::MAX] {
            assert!(JobSchedule::interval(seconds)
                .next_run_after(utc(2024, 1, 15, 10, 0), Tz::UTC)
                .is_err());
        }
    }

    #[test]
    fn test_interval_next_run() {
        let schedule = JobSchedule::interval(60);
        let now = utc(2024, 1, 15, 10, 0);
        assert_eq!(schedule.next_run(None, now, Tz::UTC).unwrap(), now);
        assert_eq!(
            schedule.next_run(Some(now), now, Tz::UTC).unwrap(),
            utc(2024, 1, 15, 10, 1)
        );
    }

    #[test]
    fn test_storage_parts_round_trip() {
        let schedule = JobSchedule::cron("0 3 * * *");
        let parsed = JobSchedule::from_parts(schedule.kind(), &schedule.value()).unwrap();
        assert_eq!(parsed, schedule);
        assert!(JobSchedule::from_parts("hook", "x").is_err());
    }

    #[test]
    fn test_resolve_timezone() {
        assert_eq!(resolve_timezone(None, Tz::UTC).unwrap(), Tz::UTC);
        assert_eq!(
            resolve_timezone(Some("Europe/Rome"), Tz::UTC).unwrap(),
            Tz::Europe__Rome
        );
        assert!(resolve_timezone(Some("Mars/Olympus"), Tz::UTC).is_err());
    }
}

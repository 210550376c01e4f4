//! Per-user notification preferences, settings and delivery-time rules.

use super::models::{Channel, NotificationTrigger};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_DELIVERY_TIME: &str = "09:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Instant,
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Instant => "instant",
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instant" => Some(Frequency::Instant),
            "hourly" => Some(Frequency::Hourly),
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            _ => None,
        }
    }
}

/// Channels and delivery schedule for one trigger of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPreference {
    pub trigger: NotificationTrigger,
    pub channels: Vec<Channel>,
    pub frequency: Frequency,
    /// "HH:MM" in the user's timezone.
    #[serde(default)]
    pub time: Option<String>,
    /// Weekday name, used by weekly delivery.
    #[serde(default)]
    pub day_of_week: Option<String>,
}

impl TriggerPreference {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(time) = &self.time {
            parse_hhmm(time).ok_or_else(|| format!("invalid time '{}', expected HH:MM", time))?;
        }
        if let Some(day) = &self.day_of_week {
            parse_weekday(day).ok_or_else(|| format!("invalid day of week '{}'", day))?;
        }
        Ok(())
    }
}

/// Channels a freshly registered user gets for `trigger`. An empty set is an
/// explicit opt-out.
pub fn default_channels(trigger: NotificationTrigger) -> Vec<Channel> {
    use Channel::*;
    use NotificationTrigger::*;
    match trigger {
        NewMatch | MutualFavorite | Favorited | PiiGranted => vec![Email, Push],
        ShortlistAdded | PiiDenied | PiiExpiring | AccountStatus | UnreadMessages
        | NewUsersMatching | WeeklyDigest | MonthlyDigest | AdminNotice => vec![Email],
        ProfileView => vec![Push],
        NewMessage => vec![Sms, Push],
        PiiRequest | SuspiciousLogin => vec![Email, Sms],
        _ => vec![],
    }
}

pub fn default_preference(trigger: NotificationTrigger) -> TriggerPreference {
    let (frequency, time, day_of_week) = match trigger {
        NotificationTrigger::WeeklyDigest => (
            Frequency::Weekly,
            Some(DEFAULT_DELIVERY_TIME.to_string()),
            Some("monday".to_string()),
        ),
        _ => (Frequency::Instant, None, None),
    };
    TriggerPreference {
        trigger,
        channels: default_channels(trigger),
        frequency,
        time,
        day_of_week,
    }
}

/// A full preference map: one entry for every trigger.
pub fn default_preferences() -> Vec<TriggerPreference> {
    NotificationTrigger::ALL
        .iter()
        .map(|t| default_preference(*t))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    pub timezone: String,
    pub exceptions: Vec<NotificationTrigger>,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: true,
            start: "22:00".to_string(),
            end: "08:00".to_string(),
            timezone: "UTC".to_string(),
            exceptions: vec![
                NotificationTrigger::PiiRequest,
                NotificationTrigger::SuspiciousLogin,
            ],
        }
    }
}

impl QuietHours {
    pub fn validate(&self) -> Result<(), String> {
        for value in [&self.start, &self.end] {
            parse_hhmm(value).ok_or_else(|| format!("invalid time '{}', expected HH:MM", value))?;
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|_| format!("invalid timezone '{}'", self.timezone))?;
        Ok(())
    }

    /// If `at` falls inside the quiet window, the instant the window ends.
    pub fn deferral(&self, at: DateTime<Utc>, trigger: NotificationTrigger) -> Option<DateTime<Utc>> {
        if !self.enabled || self.exceptions.contains(&trigger) {
            return None;
        }
        let start = parse_hhmm(&self.start)?;
        let end = parse_hhmm(&self.end)?;
        if start == end {
            return None;
        }
        let tz: Tz = self.timezone.parse().ok()?;
        let local = at.with_timezone(&tz);
        let t = local.time();
        let date = local.date_naive();

        let end_date = if start < end {
            if t < start || t >= end {
                return None;
            }
            date
        } else if t >= start {
            date.succ_opt()?
        } else if t < end {
            date
        } else {
            return None;
        };
        Some(local_to_utc(tz, end_date.and_time(end)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatePeriod {
    Hourly,
    Daily,
    Weekly,
}

impl RatePeriod {
    pub fn window(&self) -> Duration {
        match self {
            RatePeriod::Hourly => Duration::hours(1),
            RatePeriod::Daily => Duration::days(1),
            RatePeriod::Weekly => Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub period: RatePeriod,
}

/// User-level notification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub username: String,
    pub timezone: String,
    pub quiet_hours: QuietHours,
    pub rate_limits: BTreeMap<Channel, RateLimit>,
}

impl NotificationSettings {
    pub fn defaults_for(username: impl Into<String>, timezone: impl Into<String>) -> Self {
        let timezone = timezone.into();
        let mut rate_limits = BTreeMap::new();
        rate_limits.insert(
            Channel::Sms,
            RateLimit {
                max: 5,
                period: RatePeriod::Daily,
            },
        );
        rate_limits.insert(
            Channel::Email,
            RateLimit {
                max: 20,
                period: RatePeriod::Daily,
            },
        );
        Self {
            username: username.into(),
            quiet_hours: QuietHours {
                timezone: timezone.clone(),
                ..QuietHours::default()
            },
            timezone,
            rate_limits,
        }
    }

    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }
}

pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

pub fn parse_weekday(s: &str) -> Option<Weekday> {
    s.parse::<Weekday>().ok()
}

/// Resolves a local wall-clock time, skipping forward across DST gaps.
fn local_to_utc(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = naive;
    for _ in 0..3 {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return dt.with_timezone(&Utc);
        }
        candidate += Duration::hours(1);
    }
    Utc.from_utc_datetime(&naive)
}

/// When a notification with the given delivery schedule should be sent.
/// `None` means as soon as possible.
pub fn next_delivery_time(
    frequency: Frequency,
    time: Option<&str>,
    day_of_week: Option<&str>,
    now: DateTime<Utc>,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let local = now.with_timezone(&tz);
    let today: NaiveDate = local.date_naive();
    let at = time
        .and_then(parse_hhmm)
        .or_else(|| parse_hhmm(DEFAULT_DELIVERY_TIME))?;

    match frequency {
        Frequency::Instant => None,
        Frequency::Hourly => {
            let top = today.and_hms_opt(local.hour(), 0, 0)? + Duration::hours(1);
            Some(local_to_utc(tz, top))
        }
        Frequency::Daily => {
            let candidate = local_to_utc(tz, today.and_time(at));
            if candidate > now {
                Some(candidate)
            } else {
                Some(local_to_utc(tz, today.succ_opt()?.and_time(at)))
            }
        }
        Frequency::Weekly => {
            let target = day_of_week.and_then(parse_weekday).unwrap_or(Weekday::Mon);
            let days_ahead = (target.num_days_from_monday() as i64
                - today.weekday().num_days_from_monday() as i64)
                .rem_euclid(7);
            let date = today + Duration::days(days_ahead);
            let candidate = local_to_utc(tz, date.and_time(at));
            if candidate > now {
                Some(candidate)
            } else {
                Some(local_to_utc(tz, (date + Duration::days(7)).and_time(at)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_default_preferences_cover_every_trigger() {
        let prefs = default_preferences();
        assert_eq!(prefs.len(), NotificationTrigger::ALL.len());
        for trigger in NotificationTrigger::ALL {
            assert!(prefs.iter().any(|p| p.trigger == *trigger));
        }
        assert_eq!(
            default_channels(NotificationTrigger::Favorited),
            vec![Channel::Email, Channel::Push]
        );
        assert!(default_channels(NotificationTrigger::MessageRead).is_empty());
    }

    #[test]
    fn test_instant_and_hourly() {
        let now = utc(2024, 1, 15, 10, 20);
        assert_eq!(next_delivery_time(Frequency::Instant, None, None, now, Tz::UTC), None);
        assert_eq!(
            next_delivery_time(Frequency::Hourly, None, None, now, Tz::UTC),
            Some(utc(2024, 1, 15, 11, 0))
        );
    }

    #[test]
    fn test_daily_rolls_to_tomorrow() {
        let now = utc(2024, 1, 15, 10, 0);
        assert_eq!(
            next_delivery_time(Frequency::Daily, Some("18:30"), None, now, Tz::UTC),
            Some(utc(2024, 1, 15, 18, 30))
        );
        assert_eq!(
            next_delivery_time(Frequency::Daily, None, None, now, Tz::UTC),
            Some(utc(2024, 1, 16, 9, 0))
        );
    }

    #[test]
    fn test_weekly_in_user_timezone() {
        // Monday 2024-01-15 10:00 UTC; Friday 08:00 in Rome is 07:00 UTC.
        let now = utc(2024, 1, 15, 10, 0);
        assert_eq!(
            next_delivery_time(
                Frequency::Weekly,
                Some("08:00"),
                Some("friday"),
                now,
                Tz::Europe__Rome
            ),
            Some(utc(2024, 1, 19, 7, 0))
        );
        // Same weekday, time already passed: next week.
        assert_eq!(
            next_delivery_time(Frequency::Weekly, Some("09:00"), Some("mon"), now, Tz::UTC),
            Some(utc(2024, 1, 22, 9, 0))
        );
    }

    #[test]
    fn test_quiet_hours_wrapping_window() {
        let quiet = QuietHours::default();
        let trigger = NotificationTrigger::Favorited;

        assert_eq!(
            quiet.deferral(utc(2024, 1, 15, 23, 0), trigger),
            Some(utc(2024, 1, 16, 8, 0))
        );
        assert_eq!(
            quiet.deferral(utc(2024, 1, 15, 3, 0), trigger),
            Some(utc(2024, 1, 15, 8, 0))
        );
        assert_eq!(quiet.deferral(utc(2024, 1, 15, 12, 0), trigger), None);
    }

    #[test]
    fn test_quiet_hours_exceptions_and_disabled() {
        let quiet = QuietHours::default();
        let night = utc(2024, 1, 15, 23, 0);
        assert_eq!(quiet.deferral(night, NotificationTrigger::SuspiciousLogin), None);

        let off = QuietHours {
            enabled: false,
            ..QuietHours::default()
        };
        assert_eq!(off.deferral(night, NotificationTrigger::Favorited), None);
    }

    #[test]
    fn test_quiet_hours_daytime_window() {
        let quiet = QuietHours {
            start: "12:00".to_string(),
            end: "14:00".to_string(),
            ..QuietHours::default()
        };
        assert_eq!(
            quiet.deferral(utc(2024, 1, 15, 13, 0), NotificationTrigger::NewMatch),
            Some(utc(2024, 1, 15, 14, 0))
        );
        assert_eq!(quiet.deferral(utc(2024, 1, 15, 14, 0), NotificationTrigger::NewMatch), None);
    }

    #[test]
    fn test_preference_validation() {
        let mut pref = default_preference(NotificationTrigger::NewMatch);
        pref.time = Some("25:00".to_string());
        assert!(pref.validate().is_err());
        pref.time = Some("07:15".to_string());
        pref.day_of_week = Some("someday".to_string());
        assert!(pref.validate().is_err());
        pref.day_of_week = Some("Sunday".to_string());
        assert!(pref.validate().is_ok());
    }

    #[test]
    fn test_default_settings() {
        let settings = NotificationSettings::defaults_for("alice", "Europe/Rome");
        assert_eq!(settings.rate_limits[&Channel::Sms].max, 5);
        assert_eq!(settings.rate_limits[&Channel::Email].max, 20);
        assert!(!settings.rate_limits.contains_key(&Channel::Push));
        assert_eq!(settings.quiet_hours.timezone, "Europe/Rome");
        assert_eq!(settings.tz(), Tz::Europe__Rome);
    }
}

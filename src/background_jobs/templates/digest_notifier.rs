//! Weekly and monthly activity digests.
//!
//! Each run counts the profile views, favorites and messages every user
//! received over the period and enqueues one digest per opted-in user. The
//! dedup key names the calendar period, so a user gets at most one digest
//! per ISO week or month however often the job runs.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{JobError, JobResult, JobTemplate};
use crate::background_jobs::parameters::{ParameterSchema, ParameterSpec};
use crate::notifications::{
    EnqueueOutcome, EnqueueRequest, NotificationService, NotificationTrigger, Priority,
};
use chrono::{DateTime, Datelike, Duration, Utc};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};

pub const MAX_RECIPIENTS_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestPeriod {
    Weekly,
    Monthly,
}

impl DigestPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestPeriod::Weekly => "weekly",
            DigestPeriod::Monthly => "monthly",
        }
    }

    fn trigger(&self) -> NotificationTrigger {
        match self {
            DigestPeriod::Weekly => NotificationTrigger::WeeklyDigest,
            DigestPeriod::Monthly => NotificationTrigger::MonthlyDigest,
        }
    }

    fn length(&self) -> Duration {
        match self {
            DigestPeriod::Weekly => Duration::days(7),
            DigestPeriod::Monthly => Duration::days(30),
        }
    }

    /// Calendar label of the period containing `at`, e.g. `2024-W02` or
    /// `2024-01`.
    pub fn key(&self, at: DateTime<Utc>) -> String {
        match self {
            DigestPeriod::Weekly => {
                let week = at.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            DigestPeriod::Monthly => at.format("%Y-%m").to_string(),
        }
    }
}

pub struct DigestNotifierTemplate {
    period: DigestPeriod,
    dedup_window_secs: u64,
}

impl DigestNotifierTemplate {
    pub fn new(period: DigestPeriod, dedup_window_secs: u64) -> Self {
        Self {
            period,
            dedup_window_secs,
        }
    }

    pub fn template_type_for(period: DigestPeriod) -> &'static str {
        match period {
            DigestPeriod::Weekly => "weekly_digest_notifier",
            DigestPeriod::Monthly => "monthly_digest_notifier",
        }
    }

    fn dedup_key(&self, username: &str, period_key: &str) -> String {
        format!("{}_digest:{}:{}", self.period.as_str(), username, period_key)
    }
}

impl JobTemplate for DigestNotifierTemplate {
    fn template_type(&self) -> &'static str {
        Self::template_type_for(self.period)
    }

    fn name(&self) -> &'static str {
        match self.period {
            DigestPeriod::Weekly => "Weekly Digest Notifier",
            DigestPeriod::Monthly => "Monthly Digest Notifier",
        }
    }

    fn description(&self) -> &'static str {
        match self.period {
            DigestPeriod::Weekly => "Enqueue a weekly activity summary for every opted-in user",
            DigestPeriod::Monthly => "Enqueue a monthly activity summary for every opted-in user",
        }
    }

    fn category(&self) -> &'static str {
        "notifications"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new(vec![
            ParameterSpec::integer(
                "maxRecipients",
                0,
                MAX_RECIPIENTS_LIMIT,
                "Digests to enqueue per run (0 = unlimited)",
            )
            .with_default(0),
            ParameterSpec::boolean("dryRun", "Count recipients without enqueueing")
                .with_default(false),
        ])
    }

    fn execute(
        &self,
        ctx: &JobContext,
        params: &Map<String, JsonValue>,
    ) -> Result<JobResult, JobError> {
        let max_recipients = params
            .get("maxRecipients")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0) as usize;
        let dry_run = params
            .get("dryRun")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);

        let trigger = self.period.trigger();
        let until = Utc::now();
        let since = until - self.period.length();
        let period_key = self.period.key(until);
        info!(
            "Building {} digests for {} ({} to {})",
            self.period.as_str(),
            period_key,
            since.date_naive(),
            until.date_naive()
        );

        let activity = ctx.notification_store.activity_counts(since, until)?;
        let usernames = ctx.notification_store.list_usernames()?;
        let service = NotificationService::new(ctx.notification_store.clone(), self.dedup_window_secs);

        let mut enqueued = 0u64;
        let mut skipped = 0u64;
        let mut errors = Vec::new();
        for username in &usernames {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            if max_recipients > 0 && enqueued as usize >= max_recipients {
                info!("Reached maxRecipients ({}), stopping", max_recipients);
                break;
            }

            let channels = ctx
                .notification_store
                .get_preference(username, trigger)?
                .map(|pref| pref.channels)
                .unwrap_or_default();
            let dedup_key = self.dedup_key(username, &period_key);
            if channels.is_empty()
                || ctx
                    .notification_store
                    .dedup_key_used(username, trigger, &dedup_key)?
            {
                skipped += 1;
                continue;
            }
            if dry_run {
                enqueued += 1;
                continue;
            }

            let stats = activity.get(username).copied().unwrap_or_default();
            let mut request = EnqueueRequest::new(username.as_str(), trigger, &channels)
                .with_priority(Priority::Low)
                .with_dedup_key(dedup_key);
            request.template_data = json!({
                "period": self.period.as_str(),
                "periodKey": period_key,
                "stats": stats,
                "dateRange": {
                    "start": since.format("%Y-%m-%d").to_string(),
                    "end": until.format("%Y-%m-%d").to_string(),
                },
            });

            match service.enqueue(&request) {
                Ok(EnqueueOutcome::Enqueued { .. }) => enqueued += 1,
                Ok(EnqueueOutcome::Rejected { reason }) => {
                    debug!("Digest for {} not enqueued: {}", username, reason.as_str());
                    skipped += 1;
                }
                Err(e) => {
                    warn!("Failed to enqueue digest for {}: {:#}", username, e);
                    errors.push(format!("{}: {}", username, e));
                }
            }
        }

        info!(
            "{} digest run finished: {} enqueued, {} skipped, {} errors",
            self.period.as_str(),
            enqueued,
            skipped,
            errors.len()
        );
        let error_count = errors.len();
        Ok(JobResult::from_counts(
            format!("enqueued {} {} digests", enqueued, self.period.as_str()),
            usernames.len() as u64,
            enqueued,
            errors,
        )
        .with_details(json!({
            "period": self.period.as_str(),
            "periodKey": period_key,
            "enqueued": enqueued,
            "skipped": skipped,
            "errors": error_count,
            "dryRun": dry_run,
        })))
    }
}

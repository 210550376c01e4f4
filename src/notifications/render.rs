//! Turns queue entry template data into a channel payload.
//!
//! Templates support `{var}` and `{a.b}` placeholders and non-nested
//! `{% if var OP number %}...{% endif %}` blocks. Unknown placeholders
//! render empty.

use super::models::{Channel, NotificationTrigger};
use super::store::MessageTemplate;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value as JsonValue;

pub const SMS_MAX_LENGTH: usize = 160;
pub const PREVIEW_LENGTH: usize = 100;

lazy_static! {
    static ref CONDITIONAL: Regex = Regex::new(
        r"(?s)\{%\s*if\s+([A-Za-z_][A-Za-z0-9_.]*)\s*(>=|<=|==|!=|>|<)\s*(-?[0-9]+(?:\.[0-9]+)?)\s*%\}(.*?)\{%\s*endif\s*%\}"
    )
    .unwrap();
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

impl RenderedMessage {
    pub fn preview(&self) -> String {
        truncate_chars(&self.body, PREVIEW_LENGTH)
    }
}

fn lookup<'a>(data: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(data, |value, key| value.get(key))
}

fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn value_to_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn condition_holds(data: &JsonValue, path: &str, op: &str, operand: &str) -> bool {
    let (Some(left), Ok(right)) = (lookup(data, path).and_then(value_to_f64), operand.parse::<f64>())
    else {
        return false;
    };
    match op {
        ">=" => left >= right,
        "<=" => left <= right,
        ">" => left > right,
        "<" => left < right,
        "==" => left == right,
        "!=" => left != right,
        _ => false,
    }
}

pub fn render(template: &str, data: &JsonValue) -> String {
    let with_conditionals = CONDITIONAL.replace_all(template, |caps: &Captures| {
        if condition_holds(data, &caps[1], &caps[2], &caps[3]) {
            caps[4].to_string()
        } else {
            String::new()
        }
    });
    PLACEHOLDER
        .replace_all(&with_conditionals, |caps: &Captures| {
            lookup(data, &caps[1]).map(value_to_string).unwrap_or_default()
        })
        .into_owned()
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn default_subject(trigger: NotificationTrigger) -> &'static str {
    use NotificationTrigger::*;
    match trigger {
        NewMatch => "You have a new match: {actorName}",
        MutualFavorite => "It's mutual! You and {actorName} favorited each other",
        Favorited => "{actorName} added you to favorites",
        ShortlistAdded => "{actorName} shortlisted you",
        MatchMilestone => "You reached {milestone} matches",
        ProfileView => "{actorName} viewed your profile",
        ProfileVisibilitySpike => "Your profile is getting noticed",
        SearchAppearance => "You appeared in {count} searches",
        NewMessage => "New message from {actorName}",
        MessageRead => "{actorName} read your message",
        ConversationCold => "Your conversation with {actorName} has gone quiet",
        PiiRequest => "{actorName} requested access to your contact details",
        PiiGranted => "{actorName} shared their contact details",
        PiiDenied => "{actorName} declined your request",
        PiiExpiring => "Your access to {actorName}'s details is expiring",
        SuspiciousLogin => "Suspicious login to your account",
        AccountStatus => "Your account status changed",
        UnreadMessages => "You have {count} unread messages",
        NewUsersMatching => "New profiles match your saved search",
        ProfileIncomplete => "Complete your profile",
        UploadPhotos => "Add photos to your profile",
        WeeklyDigest => "Your weekly summary",
        MonthlyDigest => "Your monthly summary",
        AdminNotice => "A message from the team",
    }
}

fn default_body(trigger: NotificationTrigger, channel: Channel) -> String {
    use NotificationTrigger::*;
    let detail = match trigger {
        NewMessage => "{actorName}: {message}",
        Favorited | MutualFavorite | ShortlistAdded | ProfileView | NewMatch => {
            "{actorName}{% if actorAge > 0 %}, {actorAge}{% endif %} from {actorLocation}"
        }
        SuspiciousLogin => "A login from {location} at {time} was flagged. If this wasn't you, reset your password.",
        AccountStatus => "Status: {status}. {reason}",
        AdminNotice => "{message}",
        UnreadMessages => "You have {count} unread messages waiting.",
        WeeklyDigest | MonthlyDigest => {
            "From {dateRange.start} to {dateRange.end}: {stats.profileViews} profile views, \
             {stats.favorites} favorites, {stats.messages} messages."
        }
        _ => "",
    };
    match channel {
        Channel::Email => {
            if detail.is_empty() {
                format!("{}. Open the app to see more.", default_subject(trigger))
            } else {
                format!("{}\n\n{}\n\nOpen the app to see more.", default_subject(trigger), detail)
            }
        }
        Channel::Sms | Channel::Push => {
            if detail.is_empty() {
                default_subject(trigger).to_string()
            } else {
                detail.to_string()
            }
        }
    }
}

/// Renders an entry with the stored template when one is active, else the
/// built-in default for the (trigger, channel) pair.
pub fn render_message(
    template: Option<&MessageTemplate>,
    trigger: NotificationTrigger,
    channel: Channel,
    data: &JsonValue,
) -> RenderedMessage {
    let (subject, body) = match template {
        Some(t) => (render(&t.subject, data), render(&t.body, data)),
        None => (
            render(default_subject(trigger), data),
            render(&default_body(trigger, channel), data),
        ),
    };
    let body = match channel {
        Channel::Sms => truncate_chars(body.trim(), SMS_MAX_LENGTH),
        _ => body,
    };
    RenderedMessage { subject, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholders() {
        let data = json!({"actorName": "Bob", "match": {"firstName": "Ann", "score": 87}});
        assert_eq!(render("Hi {actorName}", &data), "Hi Bob");
        assert_eq!(
            render("{match.firstName} scored {match.score}", &data),
            "Ann scored 87"
        );
        assert_eq!(render("[{missing}] [{match.nope}]", &data), "[] []");
        // Not placeholders
        assert_eq!(render("{ spaced } {}", &data), "{ spaced } {}");
    }

    #[test]
    fn test_conditionals() {
        let data = json!({"count": 3, "score": "72.5"});
        assert_eq!(render("{% if count > 2 %}many{% endif %}", &data), "many");
        assert_eq!(render("{% if count >= 4 %}many{% endif %}", &data), "");
        assert_eq!(render("{% if count == 3 %}three{% endif %}", &data), "three");
        assert_eq!(render("{% if count != 3 %}x{% endif %}", &data), "");
        assert_eq!(render("{% if score < 80 %}ok {score}{% endif %}", &data), "ok 72.5");
        assert_eq!(render("{% if missing > 0 %}x{% endif %}!", &data), "!");
        assert_eq!(
            render("a{% if count > 0 %}\nline\n{% endif %}b", &data),
            "a\nline\nb"
        );
    }

    #[test]
    fn test_stored_template_wins() {
        let template = MessageTemplate {
            trigger: NotificationTrigger::Favorited,
            channel: Channel::Email,
            subject: "Custom {actorName}".to_string(),
            body: "Body".to_string(),
            active: true,
        };
        let data = json!({"actorName": "Bob"});
        let msg = render_message(
            Some(&template),
            NotificationTrigger::Favorited,
            Channel::Email,
            &data,
        );
        assert_eq!(msg.subject, "Custom Bob");
        assert_eq!(msg.body, "Body");

        let fallback = render_message(None, NotificationTrigger::Favorited, Channel::Email, &data);
        assert_eq!(fallback.subject, "Bob added you to favorites");
    }

    #[test]
    fn test_sms_is_truncated() {
        let data = json!({"actorName": "Bob", "message": "x".repeat(300)});
        let msg = render_message(None, NotificationTrigger::NewMessage, Channel::Sms, &data);
        assert_eq!(msg.body.chars().count(), SMS_MAX_LENGTH);
        assert!(msg.body.ends_with("..."));
        assert_eq!(msg.preview().chars().count(), PREVIEW_LENGTH);
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use super::models::Channel;

/// Public profile and contact data for a user. Contact fields may be
/// encrypted at rest and must go through a `PiiDecryptor` before use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

impl UserProfile {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn display(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.first_name.as_deref())
            .unwrap_or(&self.username)
    }

    /// Fields of this user that may be shown to other users, keyed as the
    /// actor of an event.
    pub fn actor_fields(&self) -> JsonValue {
        json!({
            "actor": self.username,
            "actorName": self.display(),
            "actorLocation": self.location,
            "actorAge": self.age,
        })
    }

    /// Raw (possibly encrypted) contact address for a channel.
    pub fn contact_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
            Channel::Push => self.push_token.as_deref(),
        }
        .filter(|s| !s.is_empty())
    }
}

/// Lookup of user profile and contact data.
pub trait UserDirectory: Send + Sync {
    fn get_profile(&self, username: &str) -> Result<Option<UserProfile>>;
    fn upsert_profile(&self, profile: &UserProfile) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_fields_fall_back_to_username() {
        let mut profile = UserProfile::new("bob");
        assert_eq!(profile.actor_fields()["actorName"], "bob");
        profile.first_name = Some("Bob".to_string());
        profile.age = Some(31);
        let fields = profile.actor_fields();
        assert_eq!(fields["actorName"], "Bob");
        assert_eq!(fields["actorAge"], 31);
        assert!(fields["actorLocation"].is_null());
    }

    #[test]
    fn test_contact_for_channel() {
        let profile = UserProfile {
            email: Some("bob@example.com".to_string()),
            phone: Some(String::new()),
            ..UserProfile::new("bob")
        };
        assert_eq!(profile.contact_for(Channel::Email), Some("bob@example.com"));
        assert_eq!(profile.contact_for(Channel::Sms), None);
        assert_eq!(profile.contact_for(Channel::Push), None);
    }
}

//! Per-user notification preferences

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::notification::{ChannelKind, NotificationCategory};
use super::ParseEnumError;

/// Weekday code used by the quiet-hours day set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum QuietDay {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl QuietDay {
    pub const ALL: [QuietDay; 7] = [
        QuietDay::Mon,
        QuietDay::Tue,
        QuietDay::Wed,
        QuietDay::Thu,
        QuietDay::Fri,
        QuietDay::Sat,
        QuietDay::Sun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mon => "mon",
            Self::Tue => "tue",
            Self::Wed => "wed",
            Self::Thu => "thu",
            Self::Fri => "fri",
            Self::Sat => "sat",
            Self::Sun => "sun",
        }
    }
}

impl From<Weekday> for QuietDay {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

impl fmt::Display for QuietDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuietDay {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mon" => Ok(Self::Mon),
            "tue" => Ok(Self::Tue),
            "wed" => Ok(Self::Wed),
            "thu" => Ok(Self::Thu),
            "fri" => Ok(Self::Fri),
            "sat" => Ok(Self::Sat),
            "sun" => Ok(Self::Sun),
            _ => Err(ParseEnumError::new("weekday", s)),
        }
    }
}

/// Parse a 24-hour `HH:MM` string into minutes after midnight.
///
/// Exactly two digits for each part; hour 0-23, minute 0-59.
pub fn parse_hhmm(value: &str) -> Option<u32> {
    let bytes = value.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    let digit = |b: u8| b.is_ascii_digit().then(|| u32::from(b - b'0'));
    let hour = digit(bytes[0])? * 10 + digit(bytes[1])?;
    let minute = digit(bytes[3])? * 10 + digit(bytes[4])?;
    (hour < 24 && minute < 60).then_some(hour * 60 + minute)
}

/// Channel switches used both globally and inside the category/type overrides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelToggles {
    pub email: bool,
    pub sms: bool,
    pub push: bool,
    pub in_app: bool,
}

impl ChannelToggles {
    /// `None` for channels that are not user-toggleable.
    pub fn get(&self, channel: ChannelKind) -> Option<bool> {
        match channel {
            ChannelKind::Email => Some(self.email),
            ChannelKind::Sms => Some(self.sms),
            ChannelKind::Push => Some(self.push),
            ChannelKind::InApp => Some(self.in_app),
            ChannelKind::Webhook => None,
        }
    }

    pub fn merge(&mut self, update: &ChannelTogglesUpdate) {
        if let Some(email) = update.email {
            self.email = email;
        }
        if let Some(sms) = update.sms {
            self.sms = sms;
        }
        if let Some(push) = update.push {
            self.push = push;
        }
        if let Some(in_app) = update.in_app {
            self.in_app = in_app;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelTogglesUpdate {
    #[serde(default)]
    pub email: Option<bool>,
    #[serde(default)]
    pub sms: Option<bool>,
    #[serde(default)]
    pub push: Option<bool>,
    #[serde(default)]
    pub in_app: Option<bool>,
}

/// One record per user, created lazily from role defaults on first access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserNotificationPreferences {
    pub user_id: Uuid,
    pub is_enabled: bool,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub push_enabled: bool,
    pub in_app_enabled: bool,
    pub quiet_hours_enabled: bool,
    pub quiet_hours_start: String,
    pub quiet_hours_end: String,
    pub quiet_hours_days: Vec<QuietDay>,
    /// `category -> notification type -> channel switches`
    pub category_preferences: BTreeMap<String, BTreeMap<String, ChannelToggles>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserNotificationPreferences {
    /// Defaults for a freshly created record, keyed by the user's role name.
    pub fn defaults_for_role(user_id: Uuid, role: &str, now: DateTime<Utc>) -> Self {
        let role = role.to_ascii_uppercase();
        let is_guardian = matches!(role.as_str(), "PARENT" | "GUARDIAN");
        let is_student = role == "STUDENT";

        Self {
            user_id,
            is_enabled: true,
            email_enabled: true,
            sms_enabled: is_guardian,
            push_enabled: true,
            in_app_enabled: true,
            quiet_hours_enabled: is_student,
            quiet_hours_start: if is_student { "21:00" } else { "22:00" }.to_string(),
            quiet_hours_end: "07:00".to_string(),
            quiet_hours_days: QuietDay::ALL.to_vec(),
            category_preferences: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn toggles(&self) -> ChannelToggles {
        ChannelToggles {
            email: self.email_enabled,
            sms: self.sms_enabled,
            push: self.push_enabled,
            in_app: self.in_app_enabled,
        }
    }

    /// Global per-channel switch; channels without a switch are always allowed.
    pub fn channel_enabled(&self, channel: ChannelKind) -> bool {
        self.toggles().get(channel).unwrap_or(true)
    }

    /// Explicit override for `(category, type, channel)`, if one is stored.
    pub fn category_override(
        &self,
        category: NotificationCategory,
        notification_type: &str,
        channel: ChannelKind,
    ) -> Option<bool> {
        self.category_preferences
            .get(category.as_str())
            .and_then(|types| types.get(notification_type))
            .and_then(|toggles| toggles.get(channel))
    }

    /// Partial merge: only fields present in `update` change.
    pub fn apply_update(&mut self, update: &UpdatePreferencesRequest, now: DateTime<Utc>) {
        if let Some(value) = update.is_enabled {
            self.is_enabled = value;
        }
        if let Some(value) = update.email_enabled {
            self.email_enabled = value;
        }
        if let Some(value) = update.sms_enabled {
            self.sms_enabled = value;
        }
        if let Some(value) = update.push_enabled {
            self.push_enabled = value;
        }
        if let Some(value) = update.in_app_enabled {
            self.in_app_enabled = value;
        }
        if let Some(value) = update.quiet_hours_enabled {
            self.quiet_hours_enabled = value;
        }
        if let Some(ref value) = update.quiet_hours_start {
            self.quiet_hours_start = value.clone();
        }
        if let Some(ref value) = update.quiet_hours_end {
            self.quiet_hours_end = value.clone();
        }
        if let Some(ref days) = update.quiet_hours_days {
            let mut days = days.clone();
            days.sort();
            days.dedup();
            self.quiet_hours_days = days;
        }
        if let Some(ref categories) = update.category_preferences {
            let base = self.toggles();
            for (category, types) in categories {
                let stored = self.category_preferences.entry(category.clone()).or_default();
                for (notification_type, toggles) in types {
                    stored
                        .entry(notification_type.clone())
                        .or_insert(base)
                        .merge(toggles);
                }
            }
        }
        self.updated_at = now;
    }
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdatePreferencesRequest {
    #[serde(default)]
    pub is_enabled: Option<bool>,
    #[serde(default)]
    pub email_enabled: Option<bool>,
    #[serde(default)]
    pub sms_enabled: Option<bool>,
    #[serde(default)]
    pub push_enabled: Option<bool>,
    #[serde(default)]
    pub in_app_enabled: Option<bool>,
    #[serde(default)]
    pub quiet_hours_enabled: Option<bool>,
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    #[serde(default)]
    pub quiet_hours_days: Option<Vec<QuietDay>>,
    #[serde(default)]
    pub category_preferences: Option<BTreeMap<String, BTreeMap<String, ChannelTogglesUpdate>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("07:30"), Some(450));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("7:30"), None);
        assert_eq!(parse_hhmm("07-30"), None);
        assert_eq!(parse_hhmm("ab:cd"), None);
    }

    #[test]
    fn test_role_defaults() {
        let now = Utc::now();
        let parent = UserNotificationPreferences::defaults_for_role(Uuid::new_v4(), "parent", now);
        assert!(parent.sms_enabled);
        assert!(!parent.quiet_hours_enabled);

        let student = UserNotificationPreferences::defaults_for_role(Uuid::new_v4(), "STUDENT", now);
        assert!(!student.sms_enabled);
        assert!(student.quiet_hours_enabled);
        assert_eq!(student.quiet_hours_start, "21:00");
        assert_eq!(student.quiet_hours_days.len(), 7);
    }

    #[test]
    fn test_partial_merge_keeps_untouched_fields() {
        let now = Utc::now();
        let mut prefs = UserNotificationPreferences::defaults_for_role(Uuid::new_v4(), "TEACHER", now);
        prefs.push_enabled = false;
        prefs.quiet_hours_start = "20:15".to_string();

        let update = UpdatePreferencesRequest {
            sms_enabled: Some(true),
            ..Default::default()
        };
        let before = prefs.clone();
        prefs.apply_update(&update, now);

        assert!(prefs.sms_enabled);
        assert_eq!(prefs.push_enabled, before.push_enabled);
        assert_eq!(prefs.quiet_hours_start, before.quiet_hours_start);
        assert_eq!(prefs.email_enabled, before.email_enabled);
    }

    #[test]
    fn test_category_overrides_merge_key_wise() {
        let now = Utc::now();
        let mut prefs = UserNotificationPreferences::defaults_for_role(Uuid::new_v4(), "PARENT", now);

        let mut types = BTreeMap::new();
        types.insert(
            "GRADE_UPDATE".to_string(),
            ChannelTogglesUpdate {
                sms: Some(false),
                ..Default::default()
            },
        );
        let mut categories = BTreeMap::new();
        categories.insert("ACADEMIC".to_string(), types);

        prefs.apply_update(
            &UpdatePreferencesRequest {
                category_preferences: Some(categories),
                ..Default::default()
            },
            now,
        );

        assert_eq!(
            prefs.category_override(NotificationCategory::Academic, "GRADE_UPDATE", ChannelKind::Sms),
            Some(false)
        );
        // Unspecified switches inherit the global toggles at creation time.
        assert_eq!(
            prefs.category_override(NotificationCategory::Academic, "GRADE_UPDATE", ChannelKind::Email),
            Some(true)
        );
        assert_eq!(
            prefs.category_override(NotificationCategory::Academic, "GRADE_UPDATE", ChannelKind::Webhook),
            None
        );
    }

    #[test]
    fn test_webhook_is_never_preference_gated() {
        let now = Utc::now();
        let mut prefs = UserNotificationPreferences::defaults_for_role(Uuid::new_v4(), "ADMIN", now);
        prefs.email_enabled = false;
        prefs.sms_enabled = false;
        prefs.push_enabled = false;
        prefs.in_app_enabled = false;
        assert!(prefs.channel_enabled(ChannelKind::Webhook));
        assert!(!prefs.channel_enabled(ChannelKind::Email));
    }
}

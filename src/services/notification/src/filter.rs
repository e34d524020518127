//! Preference and quiet-hours filtering of resolved recipients

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use edu_core_shared::types::preferences::parse_hhmm;
use edu_core_shared::types::{
    ChannelKind, Notification, QuietDay, UserNotificationPreferences,
};

/// Quiet hours are evaluated on the wall clock of a single configured zone.
#[derive(Debug, Clone, Copy)]
pub struct PreferenceFilter {
    timezone: Tz,
}

impl PreferenceFilter {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// Whether a user stays on the recipient list.
    ///
    /// A missing record is fully opted in.
    pub fn is_eligible(
        &self,
        preferences: Option<&UserNotificationPreferences>,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(prefs) = preferences else {
            return true;
        };

        if !prefs.is_enabled {
            return false;
        }

        let has_enabled_channel = notification
            .channels
            .iter()
            .any(|channel| prefs.channel_enabled(*channel));
        if !has_enabled_channel {
            return false;
        }

        if self.in_quiet_hours(prefs, now) {
            return notification.priority.overrides_quiet_hours();
        }
        true
    }

    /// True when `now` falls inside the user's quiet window on an applicable day.
    /// Unparseable bounds disable the window.
    pub fn in_quiet_hours(&self, prefs: &UserNotificationPreferences, now: DateTime<Utc>) -> bool {
        if !prefs.quiet_hours_enabled {
            return false;
        }

        let local = now.with_timezone(&self.timezone);
        let today = QuietDay::from(local.weekday());
        if !prefs.quiet_hours_days.contains(&today) {
            return false;
        }

        let (Some(start), Some(end)) = (
            parse_hhmm(&prefs.quiet_hours_start),
            parse_hhmm(&prefs.quiet_hours_end),
        ) else {
            return false;
        };

        in_window(local.hour() * 60 + local.minute(), start, end)
    }

    /// Per-channel narrowing applied after eligibility: the global toggle and
    /// any category/type override must both allow the channel.
    pub fn allows_channel(
        preferences: Option<&UserNotificationPreferences>,
        notification: &Notification,
        channel: ChannelKind,
    ) -> bool {
        let Some(prefs) = preferences else {
            return true;
        };
        if !prefs.channel_enabled(channel) {
            return false;
        }
        prefs
            .category_override(notification.category, &notification.notification_type, channel)
            .unwrap_or(true)
    }
}

/// `[start, end]` when `start <= end`, otherwise `[start, 24:00) ∪ [00:00, end]`.
pub fn in_window(current: u32, start: u32, end: u32) -> bool {
    if start <= end {
        current >= start && current <= end
    } else {
        current >= start || current <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use edu_core_shared::types::{
        ChannelToggles, NotificationStatus, SubmitNotificationRequest,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn notification(priority: &str, channels: &[&str]) -> Notification {
        let request: SubmitNotificationRequest = serde_json::from_value(json!({
            "tenant_id": Uuid::new_v4(),
            "title": "Fee reminder",
            "message": "Term fees are due",
            "notification_type": "FEE_REMINDER",
            "category": "FINANCIAL",
            "priority": priority,
            "channels": channels,
            "target_type": "ALL_USERS"
        }))
        .unwrap();
        Notification::from_request(request, NotificationStatus::Sending, Utc::now())
    }

    fn quiet_prefs() -> UserNotificationPreferences {
        let mut prefs =
            UserNotificationPreferences::defaults_for_role(Uuid::new_v4(), "TEACHER", Utc::now());
        prefs.quiet_hours_enabled = true;
        prefs.quiet_hours_start = "22:00".to_string();
        prefs.quiet_hours_end = "07:00".to_string();
        prefs
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        // 2024-03-13 is a Wednesday
        Utc.with_ymd_and_hms(2024, 3, 13, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_window_edges() {
        assert!(in_window(600, 540, 1020));
        assert!(in_window(540, 540, 1020));
        assert!(in_window(1020, 540, 1020));
        assert!(!in_window(1021, 540, 1020));

        assert!(in_window(23 * 60 + 30, 22 * 60, 7 * 60));
        assert!(in_window(6 * 60, 22 * 60, 7 * 60));
        assert!(!in_window(12 * 60, 22 * 60, 7 * 60));
    }

    #[test]
    fn test_midnight_spanning_quiet_hours() {
        let filter = PreferenceFilter::new(chrono_tz::UTC);
        let prefs = quiet_prefs();

        assert!(filter.in_quiet_hours(&prefs, at(23, 30)));
        assert!(filter.in_quiet_hours(&prefs, at(6, 0)));
        assert!(!filter.in_quiet_hours(&prefs, at(12, 0)));
    }

    #[test]
    fn test_quiet_hours_only_apply_on_listed_days() {
        let filter = PreferenceFilter::new(chrono_tz::UTC);
        let mut prefs = quiet_prefs();
        prefs.quiet_hours_days = vec![QuietDay::Sat, QuietDay::Sun];

        assert!(!filter.in_quiet_hours(&prefs, at(23, 30)));
    }

    #[test]
    fn test_quiet_hours_use_configured_timezone() {
        // 20:30 UTC is 23:30 in Nairobi (UTC+3)
        let filter = PreferenceFilter::new(chrono_tz::Africa::Nairobi);
        assert!(filter.in_quiet_hours(&quiet_prefs(), at(20, 30)));
        assert!(!PreferenceFilter::new(chrono_tz::UTC).in_quiet_hours(&quiet_prefs(), at(20, 30)));
    }

    #[test]
    fn test_only_urgent_and_critical_override_quiet_hours() {
        let filter = PreferenceFilter::new(chrono_tz::UTC);
        let prefs = quiet_prefs();
        let night = at(23, 30);

        assert!(!filter.is_eligible(Some(&prefs), &notification("NORMAL", &["EMAIL"]), night));
        assert!(!filter.is_eligible(Some(&prefs), &notification("HIGH", &["EMAIL"]), night));
        assert!(filter.is_eligible(Some(&prefs), &notification("URGENT", &["EMAIL"]), night));
        assert!(filter.is_eligible(Some(&prefs), &notification("CRITICAL", &["EMAIL"]), night));
    }

    #[test]
    fn test_missing_record_is_eligible() {
        let filter = PreferenceFilter::new(chrono_tz::UTC);
        assert!(filter.is_eligible(None, &notification("LOW", &["SMS"]), at(23, 30)));
    }

    #[test]
    fn test_global_switch_and_channel_toggles() {
        let filter = PreferenceFilter::new(chrono_tz::UTC);
        let noon = at(12, 0);

        let mut prefs = quiet_prefs();
        prefs.is_enabled = false;
        assert!(!filter.is_eligible(Some(&prefs), &notification("CRITICAL", &["EMAIL"]), noon));

        // teachers default to SMS off
        let prefs = quiet_prefs();
        assert!(!filter.is_eligible(Some(&prefs), &notification("NORMAL", &["SMS"]), noon));
        assert!(filter.is_eligible(Some(&prefs), &notification("NORMAL", &["SMS", "PUSH"]), noon));

        let mut prefs = quiet_prefs();
        prefs.email_enabled = false;
        prefs.push_enabled = false;
        prefs.in_app_enabled = false;
        assert!(filter.is_eligible(Some(&prefs), &notification("NORMAL", &["WEBHOOK"]), noon));
    }

    #[test]
    fn test_category_override_narrows_channel() {
        let mut prefs = quiet_prefs();
        let mut types = BTreeMap::new();
        types.insert(
            "FEE_REMINDER".to_string(),
            ChannelToggles {
                email: false,
                sms: false,
                push: true,
                in_app: true,
            },
        );
        prefs.category_preferences.insert("FINANCIAL".to_string(), types);

        let n = notification("NORMAL", &["EMAIL", "PUSH"]);
        assert!(!PreferenceFilter::allows_channel(Some(&prefs), &n, ChannelKind::Email));
        assert!(PreferenceFilter::allows_channel(Some(&prefs), &n, ChannelKind::Push));
        assert!(PreferenceFilter::allows_channel(None, &n, ChannelKind::Email));
        assert!(PreferenceFilter::allows_channel(Some(&prefs), &n, ChannelKind::Webhook));
    }
}

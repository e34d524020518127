//! Notification channels module
//!
//! Every transport sits behind [`ChannelAdapter`]. Adapters are registered in a
//! [`ChannelRegistry`] keyed by [`ChannelKind`], together with the set of
//! channels the operator enabled at the system level.
//! - Email channel (SMTP, `email` feature)
//! - SMS channel (HTTP gateway)
//! - Push notification channel (HTTP gateway)
//! - In-app channel (in-process broadcast)
//! - Webhook channel (HTTP POST)

use crate::config::NotificationConfig;
use crate::error::Result;
use crate::templates::RenderedContent;
use async_trait::async_trait;
use edu_core_shared::types::{ChannelKind, Notification, Recipient};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(feature = "email")]
pub mod email;
pub mod in_app;
pub mod push;
pub mod sms;
pub mod webhook;

#[cfg(feature = "email")]
pub use email::EmailChannel;
pub use in_app::{InAppChannel, InAppEvent};
pub use push::PushChannel;
pub use sms::SmsChannel;
pub use webhook::WebhookChannel;

/// What a transport reports back for one accepted delivery
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderReceipt {
    pub message_id: Option<String>,
    /// Raw provider payload, stored on the delivery log
    pub response: Option<serde_json::Value>,
}

/// Trait that all notification channels must implement
///
/// `send` must return an error on failure and must not retry internally;
/// retries belong to the job queue.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Deliver `content` to one recipient at the channel-specific `address`
    async fn send(
        &self,
        address: &str,
        recipient: &Recipient,
        content: &RenderedContent,
        notification: &Notification,
    ) -> Result<ProviderReceipt>;

    /// Check if the channel is healthy and ready to send notifications
    async fn health_check(&self) -> Result<bool>;
}

/// Channel-specific recipient identifier
///
/// EMAIL uses the email address, SMS the best available phone number, PUSH and
/// IN_APP the user id. Anything else uses the email address, falling back to
/// the user id.
pub fn recipient_address(channel: ChannelKind, recipient: &Recipient) -> Option<String> {
    match channel {
        ChannelKind::Email => recipient.email_address().map(str::to_string),
        ChannelKind::Sms => recipient.sms_number().map(str::to_string),
        ChannelKind::Push | ChannelKind::InApp => Some(recipient.id.to_string()),
        ChannelKind::Webhook => Some(
            recipient
                .email_address()
                .map(str::to_string)
                .unwrap_or_else(|| recipient.id.to_string()),
        ),
    }
}

/// Registered adapters plus the system-level enabled set
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
    enabled: BTreeSet<ChannelKind>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter and enable it
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) -> &mut Self {
        let kind = adapter.kind();
        self.adapters.insert(kind, adapter);
        self.enabled.insert(kind);
        self
    }

    /// Register an adapter that stays switched off at the system level
    pub fn register_disabled(&mut self, adapter: Arc<dyn ChannelAdapter>) -> &mut Self {
        let kind = adapter.kind();
        self.adapters.insert(kind, adapter);
        self.enabled.remove(&kind);
        self
    }

    pub fn set_enabled(&mut self, kind: ChannelKind, enabled: bool) {
        if enabled {
            self.enabled.insert(kind);
        } else {
            self.enabled.remove(&kind);
        }
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Whether submissions may name this channel
    pub fn is_registered(&self, kind: ChannelKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    /// System-level switch consulted at dispatch time
    pub fn is_enabled(&self, kind: ChannelKind) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn registered(&self) -> BTreeSet<ChannelKind> {
        self.adapters.keys().copied().collect()
    }

    /// Checks enabled adapters only; disabled ones are never contacted.
    pub async fn health_check_all(&self) -> BTreeMap<ChannelKind, bool> {
        let mut results = BTreeMap::new();
        for (kind, adapter) in self.adapters.iter().filter(|(kind, _)| self.is_enabled(**kind)) {
            let healthy = match adapter.health_check().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(channel = %kind, error = %e, "Channel health check failed");
                    false
                }
            };
            results.insert(*kind, healthy);
        }
        results
    }

    /// Build every bundled adapter; the enabled set mirrors the config flags
    pub fn from_config(config: &NotificationConfig) -> Result<(Self, Arc<InAppChannel>)> {
        let mut registry = Self::new();

        #[cfg(feature = "email")]
        registry.register(Arc::new(EmailChannel::new(&config.email)?));

        registry.register(Arc::new(SmsChannel::new(&config.sms)?));
        registry.register(Arc::new(PushChannel::new(&config.push)?));
        registry.register(Arc::new(WebhookChannel::new(&config.webhook)?));

        let in_app = Arc::new(InAppChannel::new(&config.in_app));
        registry.register(in_app.clone());

        for kind in ChannelKind::ALL {
            registry.set_enabled(kind, config.is_channel_enabled(kind));
        }

        info!(
            registered = ?registry.registered(),
            enabled = ?registry.enabled,
            "Channel registry initialized"
        );
        Ok((registry, in_app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn recipient() -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            role: "PARENT".to_string(),
            display_name: Some("Grace".to_string()),
            email: None,
            phone: None,
            parent_phone: Some("+254700000001".to_string()),
            staff_phone: None,
            is_active: true,
        }
    }

    #[test]
    fn test_recipient_address_per_channel() {
        let user = recipient();
        assert_eq!(recipient_address(ChannelKind::Email, &user), None);
        assert_eq!(
            recipient_address(ChannelKind::Sms, &user).as_deref(),
            Some("+254700000001")
        );
        assert_eq!(
            recipient_address(ChannelKind::Push, &user),
            Some(user.id.to_string())
        );
        assert_eq!(
            recipient_address(ChannelKind::Webhook, &user),
            Some(user.id.to_string())
        );
    }

    #[test]
    fn test_registry_enablement_is_separate_from_registration() {
        let mut registry = ChannelRegistry::new();
        registry.register_disabled(Arc::new(InAppChannel::with_capacity(8)));

        assert!(registry.is_registered(ChannelKind::InApp));
        assert!(!registry.is_enabled(ChannelKind::InApp));
        assert!(!registry.is_registered(ChannelKind::Sms));

        registry.set_enabled(ChannelKind::InApp, true);
        assert!(registry.is_enabled(ChannelKind::InApp));
    }
}

//! Template rendering for notification content
//!
//! The orchestrator renders a notification once before dispatch. Templates are
//! handlebars strings for the title, the message and any number of
//! channel-specific fields (for example an HTML email body or a short SMS text).

use crate::config::TemplateConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use edu_core_shared::types::{ChannelKind, Notification};
use handlebars::Handlebars;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output of a template render, shared by every channel of one dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RenderedContent {
    pub title: String,
    pub message: String,
    /// Channel-specific fields keyed by name, e.g. `html` or `sms`.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl RenderedContent {
    /// Raw title/message of the notification, used when no template is set.
    pub fn raw(notification: &Notification) -> Self {
        Self {
            title: notification.title.clone(),
            message: notification.message.clone(),
            fields: BTreeMap::new(),
        }
    }

    /// Body for a channel: a field named after the channel (`email`, `sms`,
    /// `push`, `in_app`, `webhook`) wins over the shared message.
    pub fn body_for(&self, channel: ChannelKind) -> &str {
        self.fields
            .get(&channel.as_str().to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or(&self.message)
    }
}

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    /// Render the template registered under `template_id` with `context`.
    async fn render(&self, template_id: &str, context: &Value) -> Result<RenderedContent>;
}

/// A template as registered at runtime or loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateDefinition {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Handlebars-backed renderer
#[derive(Clone)]
pub struct HandlebarsRenderer {
    handlebars: Arc<RwLock<Handlebars<'static>>>,
    definitions: Arc<RwLock<BTreeMap<String, TemplateDefinition>>>,
}

impl HandlebarsRenderer {
    pub fn new(config: &TemplateConfig) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(config.strict_mode);
        Self::register_helpers(&mut handlebars);

        let renderer = Self {
            handlebars: Arc::new(RwLock::new(handlebars)),
            definitions: Arc::new(RwLock::new(BTreeMap::new())),
        };

        if let Some(ref directory) = config.template_directory {
            let loaded = renderer.load_directory(Path::new(directory))?;
            info!(directory = %directory, loaded, "Loaded notification templates");
        }

        Ok(renderer)
    }

    /// Register or replace a template; syntax errors are rejected up front.
    pub fn register(&self, definition: TemplateDefinition) -> Result<()> {
        let mut handlebars = self.handlebars.write();
        if let Some(ref title) = definition.title {
            handlebars.register_template_string(&part_name(&definition.id, "title"), title)?;
        }
        if let Some(ref message) = definition.message {
            handlebars.register_template_string(&part_name(&definition.id, "message"), message)?;
        }
        for (field, source) in &definition.fields {
            handlebars.register_template_string(&part_name(&definition.id, field), source)?;
        }
        drop(handlebars);

        debug!(template_id = %definition.id, "Registered template");
        self.definitions
            .write()
            .insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn contains(&self, template_id: &str) -> bool {
        self.definitions.read().contains_key(template_id)
    }

    /// Load every `*.json` file in `directory` as a [`TemplateDefinition`].
    pub fn load_directory(&self, directory: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(directory).map_err(|e| {
            NotificationError::config(format!(
                "Failed to read template directory {}: {}",
                directory.display(),
                e
            ))
        })?;

        let mut loaded = 0;
        for entry in entries {
            let path = entry
                .map_err(|e| NotificationError::config(e.to_string()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                NotificationError::config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            match serde_json::from_str::<TemplateDefinition>(&raw) {
                Ok(definition) => {
                    self.register(definition)?;
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid template file"),
            }
        }
        Ok(loaded)
    }

    fn register_helpers(handlebars: &mut Handlebars) {
        handlebars.register_helper(
            "date",
            Box::new(
                |h: &handlebars::Helper,
                 _: &Handlebars,
                 _: &handlebars::Context,
                 _rc: &mut handlebars::RenderContext,
                 out: &mut dyn handlebars::Output|
                 -> handlebars::HelperResult {
                    let param = h
                        .param(0)
                        .ok_or_else(|| handlebars::RenderError::new("date helper needs a value"))?
                        .value();
                    let format = h
                        .param(1)
                        .and_then(|v| v.value().as_str())
                        .unwrap_or("%Y-%m-%d");

                    match param.as_str() {
                        Some(date_str) => match chrono::DateTime::parse_from_rfc3339(date_str) {
                            Ok(datetime) => out.write(&datetime.format(format).to_string())?,
                            Err(_) => out.write(date_str)?,
                        },
                        None => out.write(&param.to_string())?,
                    }
                    Ok(())
                },
            ),
        );

        handlebars.register_helper(
            "uppercase",
            Box::new(
                |h: &handlebars::Helper,
                 _: &Handlebars,
                 _: &handlebars::Context,
                 _rc: &mut handlebars::RenderContext,
                 out: &mut dyn handlebars::Output|
                 -> handlebars::HelperResult {
                    let value = h
                        .param(0)
                        .and_then(|p| p.value().as_str())
                        .unwrap_or_default();
                    out.write(&value.to_uppercase())?;
                    Ok(())
                },
            ),
        );
    }
}

#[async_trait]
impl TemplateRenderer for HandlebarsRenderer {
    async fn render(&self, template_id: &str, context: &Value) -> Result<RenderedContent> {
        let definition = self
            .definitions
            .read()
            .get(template_id)
            .cloned()
            .ok_or_else(|| NotificationError::template(format!("Unknown template: {}", template_id)))?;

        let handlebars = self.handlebars.read();
        let render_part = |part: &str| -> Result<String> {
            Ok(handlebars.render(&part_name(template_id, part), context)?)
        };

        let title = match definition.title {
            Some(_) => render_part("title")?,
            None => context_str(context, "title"),
        };
        let message = match definition.message {
            Some(_) => render_part("message")?,
            None => context_str(context, "message"),
        };
        let mut fields = BTreeMap::new();
        for field in definition.fields.keys() {
            fields.insert(field.clone(), render_part(field)?);
        }

        Ok(RenderedContent {
            title,
            message,
            fields,
        })
    }
}

fn part_name(template_id: &str, part: &str) -> String {
    format!("{}::{}", template_id, part)
}

fn context_str(context: &Value, key: &str) -> String {
    context
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Render context: the notification's template data plus its own fields.
///
/// Keys supplied in `template_data` take precedence.
pub fn render_context(notification: &Notification) -> Value {
    let mut context = Map::new();
    context.insert("notification_id".to_string(), json!(notification.id));
    context.insert("title".to_string(), json!(notification.title));
    context.insert("message".to_string(), json!(notification.message));
    context.insert("type".to_string(), json!(notification.notification_type));
    context.insert("category".to_string(), json!(notification.category));
    context.insert("priority".to_string(), json!(notification.priority));

    if let Some(Value::Object(data)) = &notification.template_data {
        for (key, value) in data {
            context.insert(key.clone(), value.clone());
        }
    }
    Value::Object(context)
}

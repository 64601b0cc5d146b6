//! Outbound collaborators used by email nodes: the template renderer and the
//! mailer. Both are consumed through narrow async traits so that deployments
//! can plug in their ESP and template store.

use std::collections::HashMap;

use async_trait::async_trait;
use campaign_core::types::Lead;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Failure reported by the mailer or the template renderer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Temporary outage; the node is retried with backoff.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Will never succeed (invalid address, missing template, ...).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// Submits rendered email for delivery and returns the provider message id.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, lead: &Lead, subject: &str, body: &str) -> Result<String, SendError>;
}

/// Renders a stored template with a lead's merge fields.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        template_ref: &str,
        fields: &HashMap<String, String>,
    ) -> Result<RenderedEmail, SendError>;
}

/// Replaces every `{{name}}` placeholder with the matching field. Unknown
/// placeholders render empty.
pub fn substitute(template: &str, fields: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if let Some(value) = fields.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Mailer that only logs submissions. Used for dry runs and local development.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, lead: &Lead, subject: &str, body: &str) -> Result<String, SendError> {
        if lead.email.trim().is_empty() {
            return Err(SendError::Permanent(format!(
                "lead {} has no email address",
                lead.id
            )));
        }

        let message_id = format!("msg-{}", Uuid::new_v4());
        info!(
            lead_id = %lead.id,
            to = %lead.email,
            subject = %subject,
            body_len = body.len(),
            message_id = %message_id,
            "Email submitted (log mailer)"
        );
        metrics::counter!("mailer.submitted").increment(1);
        Ok(message_id)
    }
}

/// In-memory template store rendering `{{field}}` placeholders.
#[derive(Debug, Default)]
pub struct TemplateLibrary {
    templates: DashMap<String, RenderedEmail>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        template_ref: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) {
        self.templates.insert(
            template_ref.into(),
            RenderedEmail {
                subject: subject.into(),
                body: body.into(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Builds a library from a JSON object mapping template refs to
    /// `{ "subject": ..., "body": ... }`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let entries: HashMap<String, RenderedEmail> = serde_json::from_str(json)?;
        Ok(Self {
            templates: entries.into_iter().collect(),
        })
    }
}

#[async_trait]
impl TemplateRenderer for TemplateLibrary {
    async fn render(
        &self,
        template_ref: &str,
        fields: &HashMap<String, String>,
    ) -> Result<RenderedEmail, SendError> {
        let template = self
            .templates
            .get(template_ref)
            .ok_or_else(|| SendError::Permanent(format!("unknown template {}", template_ref)))?;

        debug!(template_ref = %template_ref, "Rendering template");
        Ok(RenderedEmail {
            subject: substitute(&template.subject, fields),
            body: substitute(&template.body, fields),
        })
    }
}

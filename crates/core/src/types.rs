use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recipient that can be enrolled into a campaign flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lead {
    pub id: String,
    pub email: String,
    /// Merge fields available to templates (`first_name`, `company`, ...).
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl Lead {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Kind of externally observed lead action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngagementType {
    Sent,
    Opened,
    Clicked,
    Replied,
    Bounced,
    Unsubscribed,
}

impl EngagementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementType::Sent => "sent",
            EngagementType::Opened => "opened",
            EngagementType::Clicked => "clicked",
            EngagementType::Replied => "replied",
            EngagementType::Bounced => "bounced",
            EngagementType::Unsubscribed => "unsubscribed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BounceKind {
    #[default]
    Hard,
    Soft,
}

/// Provider-supplied context attached to an engagement event.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_kind: Option<BounceKind>,
}

/// A normalized engagement signal for one lead within one campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngagementEvent {
    pub lead_id: String,
    pub campaign_id: Uuid,
    pub event_type: EngagementType,
    pub timestamp: DateTime<Utc>,
    /// Stable key used to discard duplicate deliveries, e.g.
    /// `<provider message id>:<event type>`.
    pub idempotency_key: String,
    #[serde(default)]
    pub payload: EventPayload,
}

impl EngagementEvent {
    pub fn new(
        lead_id: impl Into<String>,
        campaign_id: Uuid,
        event_type: EngagementType,
        timestamp: DateTime<Utc>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            lead_id: lead_id.into(),
            campaign_id,
            event_type,
            timestamp,
            idempotency_key: idempotency_key.into(),
            payload: EventPayload::default(),
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Unsubscribes and hard bounces stop every running flow for the lead.
    pub fn halts_lead(&self) -> bool {
        match self.event_type {
            EngagementType::Unsubscribed => true,
            EngagementType::Bounced => {
                self.payload.bounce_kind.unwrap_or_default() == BounceKind::Hard
            }
            _ => false,
        }
    }
}

/// Activity emitted by the flow engine as cursors move through a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub activity_id: Uuid,
    pub activity: ActivityType,
    pub campaign_id: Uuid,
    pub flow_id: Uuid,
    pub lead_id: String,
    pub node_id: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    LeadEnrolled,
    EmailSent,
    EmailSendFailed,
    DelayScheduled,
    ConditionResolved,
    GoalReached,
    FlowCompleted,
    CursorFailed,
    CursorCanceled,
}

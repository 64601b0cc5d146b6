//! Normalization and deduplication of inbound engagement signals.
//!
//! Tracking endpoints and provider webhooks deliver at-least-once. Every
//! signal is turned into an [`EngagementEvent`] with a stable idempotency key
//! and admitted at most once before any cursor or counter sees it.

use campaign_core::types::{BounceKind, EngagementEvent, EngagementType, EventPayload};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::store::CursorStore;
use crate::types::{CursorKey, CursorState};

/// Kind of raw tracking signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SignalKind {
    PixelHit,
    ClickRedirect { url: String },
    ReplyDetected,
    Bounce {
        #[serde(default)]
        kind: BounceKind,
    },
    Unsubscribe,
}

impl SignalKind {
    pub fn event_type(&self) -> EngagementType {
        match self {
            SignalKind::PixelHit => EngagementType::Opened,
            SignalKind::ClickRedirect { .. } => EngagementType::Clicked,
            SignalKind::ReplyDetected => EngagementType::Replied,
            SignalKind::Bounce { .. } => EngagementType::Bounced,
            SignalKind::Unsubscribe => EngagementType::Unsubscribed,
        }
    }
}

/// A raw signal as received from a tracking endpoint or webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSignal {
    #[serde(flatten)]
    pub kind: SignalKind,
    pub campaign_id: Uuid,
    pub lead_id: String,
    /// Provider message id of the email the signal refers to.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Provider-assigned deduplication key, when the provider sends one.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Occurrence time reported by the provider.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl TrackingSignal {
    pub fn new(kind: SignalKind, campaign_id: Uuid, lead_id: impl Into<String>) -> Self {
        Self {
            kind,
            campaign_id,
            lead_id: lead_id.into(),
            message_id: None,
            idempotency_key: None,
            at: None,
            ip: None,
            user_agent: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    /// Converts the signal into an engagement event.
    ///
    /// Key precedence: the provider key, then `{message_id}:{type}`, then
    /// `{campaign}:{lead}:{type}:{timestamp}`. The event time defaults to
    /// `received_at` when the provider did not report one.
    pub fn normalize(&self, received_at: DateTime<Utc>) -> EngagementEvent {
        let event_type = self.kind.event_type();
        let timestamp = self.at.unwrap_or(received_at);

        let key = match (&self.idempotency_key, &self.message_id) {
            (Some(key), _) if !key.trim().is_empty() => key.clone(),
            (_, Some(message_id)) if !message_id.trim().is_empty() => {
                format!("{}:{}", message_id, event_type.as_str())
            }
            _ => format!(
                "{}:{}:{}:{}",
                self.campaign_id,
                self.lead_id,
                event_type.as_str(),
                timestamp.timestamp_millis()
            ),
        };

        let mut payload = EventPayload {
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            ..Default::default()
        };
        match &self.kind {
            SignalKind::ClickRedirect { url } => payload.url = Some(url.clone()),
            SignalKind::Bounce { kind } => payload.bounce_kind = Some(*kind),
            _ => {}
        }

        EngagementEvent::new(
            self.lead_id.clone(),
            self.campaign_id,
            event_type,
            timestamp,
            key,
        )
        .with_payload(payload)
    }
}

/// First-seen time of a key, and whether its routing has finished.
#[derive(Debug, Clone, Copy)]
struct Admission {
    at: DateTime<Utc>,
    settled: bool,
}

/// First-seen registry of idempotency keys.
///
/// A key is admitted before its event is routed but only persisted once
/// [`settle`](EventIngestor::settle)d, so a snapshot taken mid-route never
/// marks an unrouted event as seen.
#[derive(Debug, Default)]
pub struct EventIngestor {
    seen: DashMap<String, Admission>,
}

impl EventIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a key is offered.
    pub fn admit(&self, event: &EngagementEvent, now: DateTime<Utc>) -> bool {
        match self.seen.entry(event.idempotency_key.clone()) {
            Entry::Occupied(_) => {
                debug!(key = %event.idempotency_key, "Duplicate engagement event dropped");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Admission {
                    at: now,
                    settled: false,
                });
                true
            }
        }
    }

    /// Marks an admitted key as fully routed. Returns its first-seen time.
    pub fn settle(&self, key: &str) -> Option<DateTime<Utc>> {
        let mut admission = self.seen.get_mut(key)?;
        admission.settled = true;
        Some(admission.at)
    }

    /// Cursors of the event's (lead, campaign) currently waiting on a
    /// condition node.
    pub fn waiting_targets(&self, cursors: &CursorStore, event: &EngagementEvent) -> Vec<CursorKey> {
        cursors
            .for_lead(&event.lead_id)
            .into_iter()
            .filter(|key| {
                cursors
                    .get(key)
                    .map(|c| {
                        c.campaign_id == event.campaign_id
                            && c.state == CursorState::WaitingCondition
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Every non-terminal cursor of the lead, across campaigns.
    pub fn running_for_lead(&self, cursors: &CursorStore, lead_id: &str) -> Vec<CursorKey> {
        cursors
            .for_lead(lead_id)
            .into_iter()
            .filter(|key| {
                cursors
                    .get(key)
                    .map(|c| !c.state.is_terminal())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Forgets keys first seen before `cutoff`.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, admission| admission.at >= cutoff);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Settled keys only.
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        self.seen
            .iter()
            .filter(|e| e.value().settled)
            .map(|e| (e.key().clone(), e.value().at))
            .collect()
    }

    pub fn restore(&self, keys: Vec<(String, DateTime<Utc>)>) {
        for (key, at) in keys {
            self.seen.insert(key, Admission { at, settled: true });
        }
    }
}

//! Exactly-once statistics aggregation.
//!
//! Engagement events are applied at most once per idempotency key. Each
//! application updates the campaign totals and the counters of the lead's
//! running cursors in that campaign; terminal cursors are left untouched.

use std::sync::Arc;

use campaign_core::types::{EngagementEvent, EngagementType};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::journal::{Journal, JournalEntry};
use crate::store::CursorStore;
use crate::types::{CampaignStats, CursorKey, CursorState};

/// Persistable aggregator state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub campaigns: Vec<(Uuid, CampaignStats)>,
    pub applied_keys: Vec<(String, DateTime<Utc>)>,
    pub unique: Vec<(Uuid, String, EngagementType)>,
}

pub struct StatsAggregator {
    campaigns: DashMap<Uuid, CampaignStats>,
    /// Idempotency keys already applied, with first application time.
    applied: DashMap<String, DateTime<Utc>>,
    /// (campaign, lead, type) pairs already counted by a unique counter.
    unique: DashSet<(Uuid, String, EngagementType)>,
    cursors: Arc<CursorStore>,
    journal: Option<Arc<Journal>>,
}

impl std::fmt::Debug for StatsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsAggregator")
            .field("campaigns", &self.campaigns.len())
            .field("applied", &self.applied.len())
            .finish()
    }
}

impl StatsAggregator {
    pub fn new(cursors: Arc<CursorStore>) -> Self {
        Self {
            campaigns: DashMap::new(),
            applied: DashMap::new(),
            unique: DashSet::new(),
            cursors,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Option<Arc<Journal>>) -> Self {
        self.journal = journal;
        self
    }

    fn record(
        &self,
        campaign_id: Uuid,
        stats: &CampaignStats,
        applied_key: Option<(String, DateTime<Utc>)>,
        unique: Option<(String, EngagementType)>,
    ) {
        if let Some(journal) = &self.journal {
            journal.record(&JournalEntry::Stats {
                campaign_id,
                stats: stats.clone(),
                applied_key,
                unique,
            });
        }
    }

    /// Applies an event to the campaign totals and to every running cursor
    /// of the lead in that campaign. Returns `None` for an already applied key.
    ///
    /// Keys age out by `received_at`, the same clock the ingestor uses, so a
    /// skewed event timestamp cannot shorten or stretch the dedup window.
    pub fn apply(&self, event: &EngagementEvent, received_at: DateTime<Utc>) -> Option<CampaignStats> {
        self.apply_scoped(event, None, received_at)
    }

    /// Like [`apply`](Self::apply), but cursor-local counters are only
    /// touched on `scope` when given.
    pub fn apply_scoped(
        &self,
        event: &EngagementEvent,
        scope: Option<&CursorKey>,
        received_at: DateTime<Utc>,
    ) -> Option<CampaignStats> {
        match self.applied.entry(event.idempotency_key.clone()) {
            Entry::Occupied(_) => {
                debug!(key = %event.idempotency_key, "Statistics already applied for key");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(received_at);
            }
        }

        let first_of_kind = self.unique.insert((
            event.campaign_id,
            event.lead_id.clone(),
            event.event_type,
        ));

        let updated = {
            let mut stats = self.campaigns.entry(event.campaign_id).or_default();
            match event.event_type {
                EngagementType::Sent => stats.sent += 1,
                EngagementType::Opened => {
                    stats.opens += 1;
                    if first_of_kind {
                        stats.unique_opens += 1;
                    }
                }
                EngagementType::Clicked => {
                    stats.clicks += 1;
                    if first_of_kind {
                        stats.unique_clicks += 1;
                    }
                }
                EngagementType::Replied => stats.replies += 1,
                EngagementType::Bounced => stats.bounces += 1,
                EngagementType::Unsubscribed => stats.unsubscribes += 1,
            }
            self.record(
                event.campaign_id,
                &stats,
                Some((event.idempotency_key.clone(), received_at)),
                first_of_kind.then(|| (event.lead_id.clone(), event.event_type)),
            );
            stats.clone()
        };

        let keys = match scope {
            Some(key) => vec![key.clone()],
            None => self.cursors.for_lead(&event.lead_id),
        };
        for key in keys {
            self.cursors.update(&key, |cursor| {
                if cursor.campaign_id != event.campaign_id || cursor.state.is_terminal() {
                    return;
                }
                let counters = &mut cursor.counters;
                match event.event_type {
                    EngagementType::Sent => counters.emails_sent += 1,
                    EngagementType::Opened => counters.opens += 1,
                    EngagementType::Clicked => counters.clicks += 1,
                    EngagementType::Replied => counters.replies += 1,
                    _ => {}
                }
            });
        }

        Some(updated)
    }

    pub fn record_enrolled(&self, campaign_id: Uuid) {
        let mut stats = self.campaigns.entry(campaign_id).or_default();
        stats.enrolled += 1;
        self.record(campaign_id, &stats, None, None);
    }

    /// Counts a cursor reaching a terminal state.
    pub fn record_outcome(&self, campaign_id: Uuid, state: CursorState) {
        let mut stats = self.campaigns.entry(campaign_id).or_default();
        match state {
            CursorState::GoalReached => stats.goal_reached += 1,
            CursorState::Completed => stats.completed += 1,
            CursorState::Failed => stats.failed += 1,
            CursorState::Canceled => stats.canceled += 1,
            _ => return,
        }
        self.record(campaign_id, &stats, None, None);
    }

    pub fn stats(&self, campaign_id: &Uuid) -> CampaignStats {
        self.campaigns
            .get(campaign_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Forgets applied keys first seen before `cutoff`.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.applied.len();
        self.applied.retain(|_, seen| *seen >= cutoff);
        before - self.applied.len()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            campaigns: self
                .campaigns
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            applied_keys: self
                .applied
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            unique: self.unique.iter().map(|k| k.key().clone()).collect(),
        }
    }

    /// Re-applies one journaled change.
    pub fn replay(
        &self,
        campaign_id: Uuid,
        stats: CampaignStats,
        applied_key: Option<(String, DateTime<Utc>)>,
        unique: Option<(String, EngagementType)>,
    ) {
        self.campaigns.insert(campaign_id, stats);
        if let Some((key, at)) = applied_key {
            self.applied.insert(key, at);
        }
        if let Some((lead_id, event_type)) = unique {
            self.unique.insert((campaign_id, lead_id, event_type));
        }
    }

    pub fn restore(&self, snapshot: StatsSnapshot) {
        for (campaign, stats) in snapshot.campaigns {
            self.campaigns.insert(campaign, stats);
        }
        for (key, at) in snapshot.applied_keys {
            self.applied.insert(key, at);
        }
        for entry in snapshot.unique {
            self.unique.insert(entry);
        }
    }
}

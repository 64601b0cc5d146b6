//! In-memory stores for flow versions and recipient cursors.
//!
//! Flow versions are immutable once stored. Cursors are keyed by
//! `(flow version, lead)` and every mutation goes through
//! [`CursorStore::update`], which keeps the due-timer index in step with the
//! persisted `next_run_at` value. With a journal attached, each insert and
//! update is recorded before the cursor's entry lock is released.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use campaign_core::{CampaignError, CampaignResult, ValidationError};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::{Entry, VacantEntry};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::graph::FlowGraph;
use crate::journal::{Journal, JournalEntry};
use crate::types::{CursorKey, CursorState, FlowDefinition, FlowDocument, RecipientCursor};

// ---------------------------------------------------------------------------
// FlowStore
// ---------------------------------------------------------------------------

/// Versioned flow definitions per campaign.
#[derive(Debug, Default)]
pub struct FlowStore {
    versions: DashMap<Uuid, Arc<FlowGraph>>,
    /// Campaign -> flow ids, oldest first. The last one is active.
    by_campaign: DashMap<Uuid, Vec<Uuid>>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `document` and stores it as the campaign's next version.
    /// Nothing is stored when validation fails.
    pub fn activate(
        &self,
        campaign_id: Uuid,
        document: FlowDocument,
        now: DateTime<Utc>,
    ) -> Result<Arc<FlowGraph>, ValidationError> {
        // The entry guard serializes concurrent activations of one campaign.
        let mut history = self.by_campaign.entry(campaign_id).or_default();
        let version = history
            .last()
            .and_then(|id| self.versions.get(id).map(|g| g.version()))
            .unwrap_or(0)
            + 1;

        let definition = FlowDefinition {
            id: Uuid::new_v4(),
            campaign_id,
            version,
            nodes: document.nodes,
            edges: document.edges,
            activated_at: now,
        };
        let graph = Arc::new(FlowGraph::compile(definition)?);

        self.versions.insert(graph.id(), graph.clone());
        history.push(graph.id());
        Ok(graph)
    }

    /// Re-admits a persisted definition, keeping its id and version.
    pub fn restore(&self, definition: FlowDefinition) -> Result<Arc<FlowGraph>, ValidationError> {
        let campaign_id = definition.campaign_id;
        let graph = Arc::new(FlowGraph::compile(definition)?);
        self.versions.insert(graph.id(), graph.clone());

        let mut history = self.by_campaign.entry(campaign_id).or_default();
        if !history.contains(&graph.id()) {
            history.push(graph.id());
            let versions = &self.versions;
            history.sort_by_key(|id| versions.get(id).map(|g| g.version()).unwrap_or(0));
        }
        Ok(graph)
    }

    pub fn get(&self, flow_id: &Uuid) -> Option<Arc<FlowGraph>> {
        self.versions.get(flow_id).map(|g| g.clone())
    }

    pub fn active_for(&self, campaign_id: &Uuid) -> Option<Arc<FlowGraph>> {
        let history = self.by_campaign.get(campaign_id)?;
        let id = history.last()?;
        self.get(id)
    }

    pub fn versions_for(&self, campaign_id: &Uuid) -> Vec<Arc<FlowGraph>> {
        self.by_campaign
            .get(campaign_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn definitions(&self) -> Vec<FlowDefinition> {
        self.versions
            .iter()
            .map(|g| g.value().definition().clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// CursorStore
// ---------------------------------------------------------------------------

/// Entry of the due-timer index. Ordered by deadline, then cursor id.
type TimerEntry = (DateTime<Utc>, Uuid, CursorKey);

/// Recipient cursors with a lead index and an ordered due-timer index.
#[derive(Debug, Default)]
pub struct CursorStore {
    cursors: DashMap<CursorKey, RecipientCursor>,
    by_lead: DashMap<String, Vec<CursorKey>>,
    timers: Mutex<BTreeSet<TimerEntry>>,
    journal: Option<Arc<Journal>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Option<Arc<Journal>>) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    fn record(&self, cursor: &RecipientCursor) {
        if let Some(journal) = &self.journal {
            journal.record(&JournalEntry::Cursor {
                cursor: cursor.clone(),
            });
        }
    }

    /// Inserts a new cursor. A lead is enrolled at most once per flow version.
    pub fn insert(&self, cursor: RecipientCursor) -> CampaignResult<()> {
        let key = cursor.key();
        match self.cursors.entry(key.clone()) {
            Entry::Occupied(_) => Err(CampaignError::Conflict(format!(
                "lead {} is already enrolled in flow {}",
                key.lead_id, key.flow_id
            ))),
            Entry::Vacant(slot) => {
                self.record(&cursor);
                self.index_new(slot, cursor);
                Ok(())
            }
        }
    }

    fn index_new(&self, slot: VacantEntry<'_, CursorKey, RecipientCursor>, cursor: RecipientCursor) {
        let key = cursor.key();
        if let Some(at) = cursor.next_run_at {
            self.timers.lock().insert((at, cursor.id, key.clone()));
        }
        slot.insert(cursor);
        self.by_lead.entry(key.lead_id.clone()).or_default().push(key);
    }

    /// Adds or replaces a cursor from persisted state. Not journaled.
    pub fn put(&self, cursor: RecipientCursor) {
        match self.cursors.entry(cursor.key()) {
            Entry::Occupied(mut slot) => {
                let key = slot.key().clone();
                {
                    let previous = slot.get();
                    let mut timers = self.timers.lock();
                    if let Some(at) = previous.next_run_at {
                        timers.remove(&(at, previous.id, key.clone()));
                    }
                    if let Some(at) = cursor.next_run_at {
                        timers.insert((at, cursor.id, key));
                    }
                }
                slot.insert(cursor);
            }
            Entry::Vacant(slot) => self.index_new(slot, cursor),
        }
    }

    pub fn get(&self, key: &CursorKey) -> Option<RecipientCursor> {
        self.cursors.get(key).map(|c| c.clone())
    }

    /// Applies `f` to the cursor atomically, re-indexes its timer and
    /// journals the result.
    pub fn update<R>(&self, key: &CursorKey, f: impl FnOnce(&mut RecipientCursor) -> R) -> Option<R> {
        let mut cursor = self.cursors.get_mut(key)?;
        let before = cursor.next_run_at;
        let result = f(&mut *cursor);
        let after = cursor.next_run_at;
        self.record(&cursor);

        if before != after {
            let mut timers = self.timers.lock();
            if let Some(at) = before {
                timers.remove(&(at, cursor.id, key.clone()));
            }
            if let Some(at) = after {
                timers.insert((at, cursor.id, key.clone()));
            }
        }
        Some(result)
    }

    /// Cursors whose `next_run_at` is at or before `now`, earliest first,
    /// ties broken by cursor id. At most `limit` keys are returned.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<CursorKey> {
        self.timers
            .lock()
            .iter()
            .take_while(|(at, _, _)| *at <= now)
            .take(limit)
            .map(|(_, _, key)| key.clone())
            .collect()
    }

    /// Number of timers that are already due at `now`.
    pub fn due_count(&self, now: DateTime<Utc>) -> usize {
        self.timers
            .lock()
            .iter()
            .take_while(|(at, _, _)| *at <= now)
            .count()
    }

    pub fn for_lead(&self, lead_id: &str) -> Vec<CursorKey> {
        self.by_lead
            .get(lead_id)
            .map(|keys| keys.clone())
            .unwrap_or_default()
    }

    pub fn for_campaign(&self, campaign_id: &Uuid) -> Vec<CursorKey> {
        self.cursors
            .iter()
            .filter(|c| c.value().campaign_id == *campaign_id)
            .map(|c| c.key().clone())
            .collect()
    }

    /// Keys of cursors in one of `states`.
    pub fn in_states(&self, states: &[CursorState]) -> Vec<CursorKey> {
        self.cursors
            .iter()
            .filter(|c| states.contains(&c.value().state))
            .map(|c| c.key().clone())
            .collect()
    }

    pub fn state_counts(&self, campaign_id: &Uuid) -> HashMap<CursorState, u64> {
        let mut counts = HashMap::new();
        for c in self.cursors.iter() {
            if c.value().campaign_id == *campaign_id {
                *counts.entry(c.value().state).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn all(&self) -> Vec<RecipientCursor> {
        self.cursors.iter().map(|c| c.value().clone()).collect()
    }

    /// Loads persisted cursors, rebuilding the lead and timer indexes from
    /// their stored wall-clock deadlines.
    pub fn restore(&self, cursors: Vec<RecipientCursor>) -> usize {
        let restored = cursors.len();
        for cursor in cursors {
            self.put(cursor);
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CursorCounters, EmailConfig, GoalConfig, Node, NodeKind, Edge};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn cursor(flow_id: Uuid, lead: &str, state: CursorState, next: Option<DateTime<Utc>>) -> RecipientCursor {
        RecipientCursor {
            id: Uuid::new_v4(),
            flow_id,
            campaign_id: Uuid::nil(),
            lead_id: lead.to_string(),
            current_node_id: "n".to_string(),
            state,
            next_run_at: next,
            counters: CursorCounters::default(),
            retry_count: 0,
            condition: None,
            enrolled_at: t0(),
            updated_at: t0(),
            goal_reached_at: None,
            failure_reason: None,
            history: Vec::new(),
        }
    }

    fn document() -> FlowDocument {
        FlowDocument {
            nodes: vec![
                Node::new("send", NodeKind::Email(EmailConfig::default())),
                Node::new("done", NodeKind::Goal(GoalConfig::default())),
            ],
            edges: vec![Edge::new("e1", "send", "done")],
        }
    }

    #[test]
    fn test_activation_assigns_versions() {
        let store = FlowStore::new();
        let campaign = Uuid::new_v4();

        let v1 = store.activate(campaign, document(), t0()).unwrap();
        let v2 = store.activate(campaign, document(), t0()).unwrap();
        assert_eq!(v1.version(), 1);
        assert_eq!(v2.version(), 2);
        assert_ne!(v1.id(), v2.id());
        assert_eq!(store.active_for(&campaign).unwrap().id(), v2.id());
        // older versions stay resolvable
        assert!(store.get(&v1.id()).is_some());
        assert_eq!(store.versions_for(&campaign).len(), 2);
    }

    #[test]
    fn test_invalid_activation_stores_nothing() {
        let store = FlowStore::new();
        let campaign = Uuid::new_v4();
        let mut doc = document();
        doc.edges.clear();

        assert!(store.activate(campaign, doc, t0()).is_err());
        assert!(store.active_for(&campaign).is_none());
        assert!(store.definitions().is_empty());
    }

    #[test]
    fn test_insert_conflict() {
        let store = CursorStore::new();
        let flow = Uuid::new_v4();
        store.insert(cursor(flow, "a", CursorState::Active, None)).unwrap();
        let dup = store.insert(cursor(flow, "a", CursorState::Active, None));
        assert!(matches!(dup, Err(CampaignError::Conflict(_))));
        assert_eq!(store.for_lead("a").len(), 1);
    }

    #[test]
    fn test_due_ordering_and_limit() {
        let store = CursorStore::new();
        let flow = Uuid::new_v4();
        let early = t0();
        let late = t0() + Duration::hours(1);

        store.insert(cursor(flow, "late", CursorState::WaitingDelay, Some(late))).unwrap();
        let mut tie_a = cursor(flow, "tie-a", CursorState::WaitingDelay, Some(early));
        let mut tie_b = cursor(flow, "tie-b", CursorState::WaitingDelay, Some(early));
        tie_a.id = Uuid::from_u128(2);
        tie_b.id = Uuid::from_u128(1);
        store.insert(tie_a).unwrap();
        store.insert(tie_b).unwrap();
        store.insert(cursor(flow, "future", CursorState::WaitingDelay, Some(t0() + Duration::days(1)))).unwrap();

        let due = store.due(late, 10);
        let leads: Vec<&str> = due.iter().map(|k| k.lead_id.as_str()).collect();
        assert_eq!(leads, vec!["tie-b", "tie-a", "late"]);

        assert_eq!(store.due(late, 2).len(), 2);
        assert_eq!(store.due_count(early - Duration::seconds(1)), 0);
    }

    #[test]
    fn test_update_reindexes_timer() {
        let store = CursorStore::new();
        let flow = Uuid::new_v4();
        let key = CursorKey::new(flow, "a");
        store.insert(cursor(flow, "a", CursorState::WaitingDelay, Some(t0()))).unwrap();
        assert_eq!(store.due(t0(), 10), vec![key.clone()]);

        store.update(&key, |c| {
            c.state = CursorState::Active;
            c.next_run_at = None;
        });
        assert!(store.due(t0() + Duration::days(30), 10).is_empty());

        store.update(&key, |c| {
            c.state = CursorState::WaitingDelay;
            c.next_run_at = Some(t0() + Duration::hours(2));
        });
        assert!(store.due(t0() + Duration::hours(1), 10).is_empty());
        assert_eq!(store.due(t0() + Duration::hours(2), 10), vec![key]);
    }

    #[test]
    fn test_journal_records_inserts_and_updates() {
        let snapshot = std::env::temp_dir().join(format!("cursors-{}.json", Uuid::new_v4()));
        let journal = Arc::new(Journal::open(&snapshot, false).unwrap());
        let store = CursorStore::with_journal(Some(journal.clone()));
        let flow = Uuid::new_v4();
        let key = CursorKey::new(flow, "a");
        store.insert(cursor(flow, "a", CursorState::WaitingDelay, Some(t0()))).unwrap();
        store.update(&key, |c| {
            c.state = CursorState::Completed;
            c.next_run_at = None;
        });

        let entries = Journal::replay(&snapshot).unwrap();
        assert_eq!(entries.len(), 2);
        match entries.last() {
            Some(JournalEntry::Cursor { cursor }) => assert_eq!(cursor.state, CursorState::Completed),
            other => panic!("unexpected entry {:?}", other),
        }

        // replayed state is not journaled again
        let replica = CursorStore::with_journal(Some(journal.clone()));
        replica.restore(store.all());
        assert_eq!(Journal::replay(&snapshot).unwrap().len(), 2);
        let _ = std::fs::remove_file(journal.path());
    }

    #[test]
    fn test_put_replaces_and_reindexes() {
        let store = CursorStore::new();
        let flow = Uuid::new_v4();
        let waiting = cursor(flow, "a", CursorState::WaitingDelay, Some(t0()));
        let mut advanced = waiting.clone();
        store.put(waiting);
        assert_eq!(store.due(t0(), 10).len(), 1);

        advanced.state = CursorState::Completed;
        advanced.next_run_at = None;
        store.put(advanced);
        assert!(store.due(t0() + Duration::days(1), 10).is_empty());
        assert_eq!(store.for_lead("a").len(), 1);
        assert_eq!(store.get(&CursorKey::new(flow, "a")).unwrap().state, CursorState::Completed);
    }

    #[test]
    fn test_restore_rebuilds_indexes() {
        let original = CursorStore::new();
        let flow = Uuid::new_v4();
        original.insert(cursor(flow, "a", CursorState::WaitingDelay, Some(t0()))).unwrap();
        original.insert(cursor(flow, "b", CursorState::GoalReached, None)).unwrap();

        let json = serde_json::to_string(&original.all()).unwrap();
        let restored = CursorStore::new();
        let count = restored.restore(serde_json::from_str(&json).unwrap());

        assert_eq!(count, 2);
        assert_eq!(restored.due(t0(), 10), vec![CursorKey::new(flow, "a")]);
        assert_eq!(restored.for_lead("b"), vec![CursorKey::new(flow, "b")]);
    }
}

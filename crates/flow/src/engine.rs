use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as SlotMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_core::config::FlowConfig;
use campaign_core::event_bus::{make_activity, noop_sink, EventSink};
use campaign_core::types::{ActivityType, EngagementEvent, Lead};
use campaign_core::{CampaignError, CampaignResult};

use crate::delivery::{Mailer, TemplateRenderer};
use crate::executor::{NodeExecutor, RetryPolicy, StepOutcome, Trigger};
use crate::graph::FlowGraph;
use crate::ingestor::{EventIngestor, TrackingSignal};
use crate::journal::{Journal, JournalEntry};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::store::{CursorStore, FlowStore};
use crate::types::{
    CampaignStatus, CampaignSummary, CursorCounters, CursorKey, CursorState, FlowDefinition,
    FlowDocument, RecipientCursor,
};

/// What happened to one ingested engagement event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub idempotency_key: String,
    /// The key had already been seen; nothing was applied.
    pub duplicate: bool,
    /// Waiting cursors the event was routed to.
    pub routed: usize,
    /// Routed cursors whose condition resolved.
    pub resolved: usize,
    /// Cursors canceled by an unsubscribe or hard bounce.
    pub canceled: usize,
}

/// Everything needed to resume the engine after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub flows: Vec<FlowDefinition>,
    pub cursors: Vec<RecipientCursor>,
    pub leads: Vec<Lead>,
    pub campaigns: Vec<(Uuid, CampaignStatus)>,
    pub stats: StatsSnapshot,
    pub seen_keys: Vec<(String, DateTime<Utc>)>,
}

/// Campaign automation engine: owns flow versions, cursors, and the
/// collaborators that move cursors through their flows.
#[derive(Clone)]
pub struct FlowEngine {
    config: Arc<FlowConfig>,
    flows: Arc<FlowStore>,
    cursors: Arc<CursorStore>,
    leads: Arc<DashMap<String, Lead>>,
    campaigns: Arc<DashMap<Uuid, CampaignStatus>>,
    stats: Arc<StatsAggregator>,
    ingestor: Arc<EventIngestor>,
    executor: Arc<NodeExecutor>,
    slots: Arc<DashMap<CursorKey, Arc<SlotMutex<()>>>>,
    mailer: Arc<dyn Mailer>,
    renderer: Arc<dyn TemplateRenderer>,
    event_sink: Arc<dyn EventSink>,
    journal: Option<Arc<Journal>>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("campaigns", &self.campaigns.len())
            .field("cursors", &self.cursors.len())
            .field("leads", &self.leads.len())
            .finish()
    }
}

impl FlowEngine {
    pub fn new(
        config: FlowConfig,
        mailer: Arc<dyn Mailer>,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self::build(config, mailer, renderer, noop_sink(), None)
    }

    fn build(
        config: FlowConfig,
        mailer: Arc<dyn Mailer>,
        renderer: Arc<dyn TemplateRenderer>,
        event_sink: Arc<dyn EventSink>,
        journal: Option<Arc<Journal>>,
    ) -> Self {
        let cursors = Arc::new(CursorStore::with_journal(journal.clone()));
        let stats = Arc::new(StatsAggregator::new(cursors.clone()).with_journal(journal.clone()));
        let leads = Arc::new(DashMap::new());
        let executor = Arc::new(NodeExecutor::new(
            cursors.clone(),
            stats.clone(),
            leads.clone(),
            mailer.clone(),
            renderer.clone(),
            RetryPolicy::from_config(&config),
            event_sink.clone(),
        ));

        Self {
            config: Arc::new(config),
            flows: Arc::new(FlowStore::new()),
            cursors,
            leads,
            campaigns: Arc::new(DashMap::new()),
            stats,
            ingestor: Arc::new(EventIngestor::new()),
            executor,
            slots: Arc::new(DashMap::new()),
            mailer,
            renderer,
            event_sink,
            journal,
        }
    }

    /// Records every state change write-through in `journal`. Attach it
    /// before loading or creating any state: the stores start over empty.
    pub fn with_journal(self, journal: Arc<Journal>) -> Self {
        Self::build(
            (*self.config).clone(),
            self.mailer,
            self.renderer,
            self.event_sink,
            Some(journal),
        )
    }

    /// Attach an event sink for the activity log.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = Arc::new(NodeExecutor::new(
            self.cursors.clone(),
            self.stats.clone(),
            self.leads.clone(),
            self.mailer.clone(),
            self.renderer.clone(),
            RetryPolicy::from_config(&self.config),
            sink.clone(),
        ));
        self.event_sink = sink;
        self
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    fn record(&self, entry: JournalEntry) {
        if let Some(journal) = &self.journal {
            journal.record(&entry);
        }
    }

    // -----------------------------------------------------------------------
    // Flow versions
    // -----------------------------------------------------------------------

    /// Validates `document` and makes it the campaign's active flow version.
    /// Cursors already running stay on the version they were enrolled into.
    pub fn activate_flow(
        &self,
        campaign_id: Uuid,
        document: FlowDocument,
        now: DateTime<Utc>,
    ) -> CampaignResult<Arc<FlowGraph>> {
        if self.status(&campaign_id) == CampaignStatus::Canceled {
            return Err(CampaignError::CampaignHalted(format!(
                "campaign {} is canceled",
                campaign_id
            )));
        }

        let graph = self.flows.activate(campaign_id, document, now).map_err(|e| {
            warn!(campaign_id = %campaign_id, error = %e, "Flow activation rejected");
            CampaignError::InvalidFlow(e)
        })?;
        let status = *self.campaigns.entry(campaign_id).or_insert(CampaignStatus::Active);
        self.record(JournalEntry::Flow {
            definition: graph.definition().clone(),
        });
        self.record(JournalEntry::Campaign { campaign_id, status });

        info!(
            campaign_id = %campaign_id,
            flow_id = %graph.id(),
            version = graph.version(),
            nodes = graph.definition().nodes.len(),
            "Flow version activated"
        );
        metrics::counter!("flow.versions_activated").increment(1);
        Ok(graph)
    }

    pub fn active_flow(&self, campaign_id: &Uuid) -> Option<Arc<FlowGraph>> {
        self.flows.active_for(campaign_id)
    }

    pub fn flow_versions(&self, campaign_id: &Uuid) -> Vec<Arc<FlowGraph>> {
        self.flows.versions_for(campaign_id)
    }

    // -----------------------------------------------------------------------
    // Enrollment and dispatch
    // -----------------------------------------------------------------------

    /// Enrolls `lead` into the campaign's active flow and runs the entry
    /// node right away.
    pub async fn enroll(
        &self,
        campaign_id: Uuid,
        lead: Lead,
        now: DateTime<Utc>,
    ) -> CampaignResult<RecipientCursor> {
        if self.status(&campaign_id).is_halted() {
            return Err(CampaignError::CampaignHalted(format!(
                "campaign {} is not accepting enrollments",
                campaign_id
            )));
        }
        let graph = self.flows.active_for(&campaign_id).ok_or_else(|| {
            CampaignError::NotFound(format!("campaign {} has no active flow", campaign_id))
        })?;

        let lead_id = lead.id.clone();
        let cursor = RecipientCursor {
            id: Uuid::new_v4(),
            flow_id: graph.id(),
            campaign_id,
            lead_id: lead_id.clone(),
            current_node_id: graph.entry().id.clone(),
            state: CursorState::Pending,
            next_run_at: None,
            counters: CursorCounters::default(),
            retry_count: 0,
            condition: None,
            enrolled_at: now,
            updated_at: now,
            goal_reached_at: None,
            failure_reason: None,
            history: Vec::new(),
        };
        let key = cursor.key();
        // A conflicting enrollment must not overwrite the stored profile.
        self.cursors.insert(cursor)?;
        self.record(JournalEntry::Lead { lead: lead.clone() });
        self.leads.insert(lead_id.clone(), lead);

        info!(
            campaign_id = %campaign_id,
            flow_id = %graph.id(),
            lead_id = %lead_id,
            "Lead enrolled"
        );
        metrics::counter!("flow.cursors_enrolled").increment(1);
        self.stats.record_enrolled(campaign_id);
        self.event_sink.emit(make_activity(
            ActivityType::LeadEnrolled,
            campaign_id,
            graph.id(),
            lead_id,
            Some(graph.entry().id.clone()),
            now,
        ));

        self.dispatch(&key, Trigger::Enter, now).await?;
        self.cursors
            .get(&key)
            .ok_or_else(|| CampaignError::NotFound(format!("cursor {}", key)))
    }

    /// Runs `trigger` for one cursor inside its exclusive execution slot,
    /// then keeps entering nodes until the cursor parks or finishes. The slot
    /// is released between nodes.
    pub async fn dispatch(
        &self,
        key: &CursorKey,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> CampaignResult<StepOutcome> {
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(SlotMutex::new(())))
            .clone();

        let mut trigger = trigger;
        loop {
            let guard = slot.clone().lock_owned().await;

            let cursor = self
                .cursors
                .get(key)
                .ok_or_else(|| CampaignError::NotFound(format!("cursor {}", key)))?;
            if cursor.state.is_terminal() {
                return Ok(StepOutcome::Ignored);
            }
            if self.status(&cursor.campaign_id).is_halted() {
                self.executor.cancel(key, now, "campaign halted")?;
                return Ok(StepOutcome::Finished(CursorState::Canceled));
            }
            let graph = self.flows.get(&key.flow_id).ok_or_else(|| {
                CampaignError::NotFound(format!("flow version {}", key.flow_id))
            })?;

            let outcome = self.executor.execute(&graph, key, trigger, now).await?;
            drop(guard);

            match outcome {
                StepOutcome::Continue => trigger = Trigger::Enter,
                other => return Ok(other),
            }
        }
    }

    /// Fires the timer of a due cursor.
    pub async fn fire_timer(&self, key: &CursorKey, now: DateTime<Utc>) -> CampaignResult<StepOutcome> {
        let outcome = self.dispatch(key, Trigger::Timer, now).await?;
        metrics::counter!("flow.scheduler_dispatched").increment(1);
        Ok(outcome)
    }

    /// Keys of cursors whose deadline has passed, earliest first.
    pub fn due_cursors(&self, now: DateTime<Utc>, limit: usize) -> Vec<CursorKey> {
        self.cursors.due(now, limit)
    }

    // -----------------------------------------------------------------------
    // Engagement
    // -----------------------------------------------------------------------

    pub async fn ingest_signal(
        &self,
        signal: &TrackingSignal,
        now: DateTime<Utc>,
    ) -> CampaignResult<IngestReport> {
        self.ingest(signal.normalize(now), now).await
    }

    /// Deduplicates the event, feeds statistics, then routes it: unsubscribes
    /// and hard bounces cancel the lead's running cursors, everything else
    /// goes to cursors waiting on a condition in the event's campaign.
    ///
    /// The key is persisted as seen only after routing succeeds, so a
    /// redelivery after a crash mid-route is routed again.
    pub async fn ingest(
        &self,
        event: EngagementEvent,
        now: DateTime<Utc>,
    ) -> CampaignResult<IngestReport> {
        let mut report = IngestReport {
            idempotency_key: event.idempotency_key.clone(),
            ..Default::default()
        };

        if !self.ingestor.admit(&event, now) {
            metrics::counter!("flow.events_duplicate").increment(1);
            report.duplicate = true;
            return Ok(report);
        }
        metrics::counter!("flow.events_ingested", "type" => event.event_type.as_str()).increment(1);

        self.route(&event, now, &mut report).await?;
        if let Some(at) = self.ingestor.settle(&event.idempotency_key) {
            self.record(JournalEntry::SeenKey {
                key: event.idempotency_key.clone(),
                at,
            });
        }
        Ok(report)
    }

    async fn route(
        &self,
        event: &EngagementEvent,
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) -> CampaignResult<()> {
        self.stats.apply(event, now);

        if event.halts_lead() {
            for key in self.ingestor.running_for_lead(&self.cursors, &event.lead_id) {
                let reason = format!("lead {}", event.event_type.as_str());
                if self.executor.cancel(&key, now, &reason)? {
                    report.canceled += 1;
                }
            }
            info!(
                lead_id = %event.lead_id,
                event_type = event.event_type.as_str(),
                canceled = report.canceled,
                "Lead halted"
            );
            return Ok(());
        }

        if self.status(&event.campaign_id).is_halted() {
            debug!(campaign_id = %event.campaign_id, "Event not routed, campaign halted");
            return Ok(());
        }

        for key in self.ingestor.waiting_targets(&self.cursors, event) {
            report.routed += 1;
            match self.dispatch(&key, Trigger::Event(event.clone()), now).await? {
                StepOutcome::Parked | StepOutcome::Ignored => {}
                _ => report.resolved += 1,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Campaign control
    // -----------------------------------------------------------------------

    pub fn status(&self, campaign_id: &Uuid) -> CampaignStatus {
        self.campaigns
            .get(campaign_id)
            .map(|s| *s)
            .unwrap_or(CampaignStatus::Active)
    }

    /// Stops dispatch for the campaign and cancels its running cursors.
    /// Returns the number of cursors canceled.
    pub fn pause_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<usize> {
        self.ensure_known(&campaign_id)?;
        {
            let mut status = self.campaigns.entry(campaign_id).or_insert(CampaignStatus::Active);
            if *status == CampaignStatus::Canceled {
                return Err(CampaignError::Conflict(format!(
                    "campaign {} is canceled",
                    campaign_id
                )));
            }
            *status = CampaignStatus::Paused;
            self.record(JournalEntry::Campaign {
                campaign_id,
                status: CampaignStatus::Paused,
            });
        }
        info!(campaign_id = %campaign_id, "Campaign paused");
        self.cancel_running(&campaign_id, now, "campaign paused")
    }

    /// Permanently halts the campaign and cancels its running cursors.
    pub fn cancel_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignResult<usize> {
        self.ensure_known(&campaign_id)?;
        self.campaigns.insert(campaign_id, CampaignStatus::Canceled);
        self.record(JournalEntry::Campaign {
            campaign_id,
            status: CampaignStatus::Canceled,
        });
        info!(campaign_id = %campaign_id, "Campaign canceled");
        self.cancel_running(&campaign_id, now, "campaign canceled")
    }

    /// Re-opens a paused campaign for enrollment.
    pub fn resume_campaign(&self, campaign_id: Uuid) -> CampaignResult<()> {
        self.ensure_known(&campaign_id)?;
        let mut status = self.campaigns.entry(campaign_id).or_insert(CampaignStatus::Active);
        match *status {
            CampaignStatus::Paused => {
                *status = CampaignStatus::Active;
                self.record(JournalEntry::Campaign {
                    campaign_id,
                    status: CampaignStatus::Active,
                });
                info!(campaign_id = %campaign_id, "Campaign resumed");
                Ok(())
            }
            CampaignStatus::Active => Ok(()),
            CampaignStatus::Canceled => Err(CampaignError::Conflict(format!(
                "campaign {} is canceled",
                campaign_id
            ))),
        }
    }

    fn cancel_running(&self, campaign_id: &Uuid, now: DateTime<Utc>, reason: &str) -> CampaignResult<usize> {
        let mut canceled = 0;
        for key in self.cursors.for_campaign(campaign_id) {
            if self.executor.cancel(&key, now, reason)? {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    fn ensure_known(&self, campaign_id: &Uuid) -> CampaignResult<()> {
        if self.campaigns.contains_key(campaign_id) {
            Ok(())
        } else {
            Err(CampaignError::NotFound(format!("campaign {}", campaign_id)))
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn cursor(&self, key: &CursorKey) -> Option<RecipientCursor> {
        self.cursors.get(key)
    }

    /// Cursors of a lead within one campaign, across flow versions.
    pub fn cursors_for_lead(&self, campaign_id: &Uuid, lead_id: &str) -> Vec<RecipientCursor> {
        self.cursors
            .for_lead(lead_id)
            .iter()
            .filter_map(|key| self.cursors.get(key))
            .filter(|c| c.campaign_id == *campaign_id)
            .collect()
    }

    pub fn lead(&self, lead_id: &str) -> Option<Lead> {
        self.leads.get(lead_id).map(|l| l.clone())
    }

    pub fn campaign_summary(&self, campaign_id: &Uuid) -> CampaignResult<CampaignSummary> {
        self.ensure_known(campaign_id)?;
        let active = self.flows.active_for(campaign_id);
        let cursor_states = self
            .cursors
            .state_counts(campaign_id)
            .into_iter()
            .map(|(state, count)| (state_label(state).to_string(), count))
            .collect();

        Ok(CampaignSummary {
            campaign_id: *campaign_id,
            status: self.status(campaign_id),
            active_flow_id: active.as_ref().map(|g| g.id()),
            active_version: active.as_ref().map(|g| g.version()),
            stats: self.stats.stats(campaign_id),
            cursor_states,
        })
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn due_count(&self, now: DateTime<Utc>) -> usize {
        self.cursors.due_count(now)
    }

    // -----------------------------------------------------------------------
    // Maintenance and persistence
    // -----------------------------------------------------------------------

    /// Forgets idempotency keys older than the retention window and drops
    /// execution slots of finished cursors.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(self.config.idempotency_ttl_hours as i64);
        let pruned = self.ingestor.prune(cutoff) + self.stats.prune(cutoff);

        let cursors = &self.cursors;
        self.slots.retain(|key, slot| {
            Arc::strong_count(slot) > 1
                || cursors.get(key).map(|c| !c.state.is_terminal()).unwrap_or(false)
        });

        if pruned > 0 {
            debug!(pruned, "Pruned expired idempotency keys");
        }
        pruned
    }

    /// Re-drives cursors left `pending` or `active` by an interrupted
    /// process. Parked cursors need nothing: their deadlines are persisted
    /// and the scheduler picks them up.
    pub async fn recover(&self, now: DateTime<Utc>) -> CampaignResult<usize> {
        let stranded = self
            .cursors
            .in_states(&[CursorState::Pending, CursorState::Active]);
        let count = stranded.len();
        for key in stranded {
            if let Err(e) = self.dispatch(&key, Trigger::Enter, now).await {
                warn!(cursor = %key, error = %e, "Recovery dispatch failed");
            }
        }
        info!(
            recovered = count,
            due = self.cursors.due_count(now),
            "Recovery complete"
        );
        Ok(count)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> EngineSnapshot {
        EngineSnapshot {
            taken_at: Some(now),
            flows: self.flows.definitions(),
            cursors: self.cursors.all(),
            leads: self.leads.iter().map(|l| l.value().clone()).collect(),
            campaigns: self.campaigns.iter().map(|e| (*e.key(), *e.value())).collect(),
            stats: self.stats.snapshot(),
            seen_keys: self.ingestor.snapshot(),
        }
    }

    /// Loads a snapshot into the engine. Returns the number of cursors
    /// restored; cursors whose flow version cannot be restored are skipped.
    pub fn restore(&self, snapshot: EngineSnapshot) -> usize {
        for definition in snapshot.flows {
            let flow_id = definition.id;
            if let Err(e) = self.flows.restore(definition) {
                warn!(flow_id = %flow_id, error = %e, "Skipping invalid persisted flow");
            }
        }
        for (campaign_id, status) in snapshot.campaigns {
            self.campaigns.insert(campaign_id, status);
        }
        for lead in snapshot.leads {
            self.leads.insert(lead.id.clone(), lead);
        }
        self.stats.restore(snapshot.stats);
        self.ingestor.restore(snapshot.seen_keys);

        let flows = &self.flows;
        let cursors: Vec<RecipientCursor> = snapshot
            .cursors
            .into_iter()
            .filter(|c| flows.get(&c.flow_id).is_some())
            .collect();
        let restored = self.cursors.restore(cursors);
        info!(restored, "Engine state restored");
        restored
    }

    /// Re-applies journaled changes in order, on top of whatever state is
    /// already loaded.
    pub fn apply_journal(&self, entries: Vec<JournalEntry>) {
        for entry in entries {
            match entry {
                JournalEntry::Flow { definition } => {
                    let flow_id = definition.id;
                    if let Err(e) = self.flows.restore(definition) {
                        warn!(flow_id = %flow_id, error = %e, "Skipping invalid journaled flow");
                    }
                }
                JournalEntry::Campaign {
                    campaign_id,
                    status,
                } => {
                    self.campaigns.insert(campaign_id, status);
                }
                JournalEntry::Lead { lead } => {
                    self.leads.insert(lead.id.clone(), lead);
                }
                JournalEntry::Cursor { cursor } => {
                    if self.flows.get(&cursor.flow_id).is_some() {
                        self.cursors.put(cursor);
                    }
                }
                JournalEntry::Stats {
                    campaign_id,
                    stats,
                    applied_key,
                    unique,
                } => self.stats.replay(campaign_id, stats, applied_key, unique),
                JournalEntry::SeenKey { key, at } => self.ingestor.restore(vec![(key, at)]),
            }
        }
    }

    /// Writes a JSON snapshot atomically (temp file, then rename). When the
    /// engine journals next to `path`, the journal is compacted into it.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>, now: DateTime<Utc>) -> CampaignResult<()> {
        let path = path.as_ref();
        let journal = self
            .journal
            .as_ref()
            .filter(|j| j.path() == Journal::path_for(path).as_path());
        if let Some(journal) = journal {
            journal.rotate()?;
        }

        let bytes = serde_json::to_vec(&self.snapshot(now))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        if let Some(journal) = journal {
            journal.discard_rotated()?;
        }
        debug!(path = %path.display(), bytes = bytes.len(), "Snapshot written");
        Ok(())
    }

    /// Restores from a JSON snapshot and replays the journal beside it.
    /// Returns the number of cursors loaded, or `None` when neither exists.
    pub async fn load_snapshot(&self, path: impl AsRef<Path>) -> CampaignResult<Option<usize>> {
        let path = path.as_ref();
        let snapshot: Option<EngineSnapshot> = match tokio::fs::read(path).await {
            Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let entries = Journal::replay(path)?;
        if snapshot.is_none() && entries.is_empty() {
            return Ok(None);
        }

        if let Some(snapshot) = snapshot {
            self.restore(snapshot);
        }
        let replayed = entries.len();
        self.apply_journal(entries);
        if replayed > 0 {
            info!(replayed, cursors = self.cursors.len(), "Journal replayed");
        }
        Ok(Some(self.cursors.len()))
    }
}

fn state_label(state: CursorState) -> &'static str {
    match state {
        CursorState::Pending => "pending",
        CursorState::Active => "active",
        CursorState::WaitingDelay => "waiting_delay",
        CursorState::WaitingCondition => "waiting_condition",
        CursorState::Completed => "completed",
        CursorState::GoalReached => "goal_reached",
        CursorState::Failed => "failed",
        CursorState::Canceled => "canceled",
    }
}

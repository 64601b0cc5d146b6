//! Node executors.
//!
//! Enrollment, timers and engagement events all enter through
//! [`NodeExecutor::execute`], which dispatches on `(node kind, trigger)`.
//! Every state change is checked against [`CursorStateMachine`] inside the
//! cursor store's atomic update, so a cursor canceled while a step was in
//! flight is never moved again.

use std::sync::Arc;

use campaign_core::config::FlowConfig;
use campaign_core::event_bus::{make_activity, EventSink};
use campaign_core::types::{ActivityType, EngagementEvent, EngagementType, Lead};
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::delivery::{substitute, Mailer, RenderedEmail, SendError, TemplateRenderer};
use crate::evaluator::{ConditionEvaluator, ConditionOutcome};
use crate::graph::FlowGraph;
use crate::state_machine::CursorStateMachine;
use crate::stats::StatsAggregator;
use crate::store::CursorStore;
use crate::types::{
    Branch, ConditionConfig, ConditionWait, CursorKey, CursorState, DelayConfig, EmailConfig,
    Node, NodeKind, RecipientCursor, SignalObservation, StepExecution,
};

/// What woke a cursor up.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// The cursor arrived at its current node (enrollment or advance).
    Enter,
    /// The cursor's `next_run_at` deadline passed.
    Timer,
    /// An engagement event for the cursor's lead and campaign.
    Event(EngagementEvent),
}

impl Trigger {
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::Enter => "enter",
            Trigger::Timer => "timer",
            Trigger::Event(_) => "event",
        }
    }
}

/// Result of one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Moved to another node that should run right away.
    Continue,
    /// Parked on a delay, a retry backoff or a condition window.
    Parked,
    /// Reached a terminal state.
    Finished(CursorState),
    /// The trigger did not apply to the cursor's current position.
    Ignored,
}

/// Capped exponential backoff for email send retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FlowConfig) -> Self {
        Self {
            max_retries: config.max_send_retries,
            base: Duration::seconds(config.retry_base_secs as i64),
            max: Duration::seconds(config.retry_max_secs as i64),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let factor = 1i32 << exponent;
        let delay = self.base.checked_mul(factor).unwrap_or(self.max);
        delay.min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&FlowConfig::default())
    }
}

/// Executes flow nodes for recipient cursors.
pub struct NodeExecutor {
    cursors: Arc<CursorStore>,
    stats: Arc<StatsAggregator>,
    leads: Arc<DashMap<String, Lead>>,
    mailer: Arc<dyn Mailer>,
    renderer: Arc<dyn TemplateRenderer>,
    evaluator: ConditionEvaluator,
    state_machine: CursorStateMachine,
    retry: RetryPolicy,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor")
            .field("retry", &self.retry)
            .finish()
    }
}

impl NodeExecutor {
    pub fn new(
        cursors: Arc<CursorStore>,
        stats: Arc<StatsAggregator>,
        leads: Arc<DashMap<String, Lead>>,
        mailer: Arc<dyn Mailer>,
        renderer: Arc<dyn TemplateRenderer>,
        retry: RetryPolicy,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cursors,
            stats,
            leads,
            mailer,
            renderer,
            evaluator: ConditionEvaluator::new(),
            state_machine: CursorStateMachine::new(),
            retry,
            event_sink,
        }
    }

    /// Runs the cursor's current node for `trigger`.
    ///
    /// A transition rejected because the cursor moved underneath (for
    /// example a cancellation) is reported as [`StepOutcome::Ignored`].
    pub async fn execute(
        &self,
        graph: &FlowGraph,
        key: &CursorKey,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> CampaignResult<StepOutcome> {
        let cursor = self
            .cursors
            .get(key)
            .ok_or_else(|| CampaignError::NotFound(format!("cursor {}", key)))?;
        if cursor.state.is_terminal() {
            return Ok(StepOutcome::Ignored);
        }

        let node = match graph.node(&cursor.current_node_id) {
            Some(node) => node.clone(),
            None => {
                let reason = format!("node {} not in flow version", cursor.current_node_id);
                return self.fail(key, now, &reason);
            }
        };

        debug!(
            cursor = %key,
            node_id = %node.id,
            node_type = node.kind.label(),
            trigger = trigger.label(),
            state = ?cursor.state,
            "Executing node"
        );

        let result = match (&node.kind, &trigger) {
            (NodeKind::Email(config), Trigger::Enter) if is_entering(cursor.state) => {
                self.run_email(graph, &cursor, &node, config, now).await
            }
            (NodeKind::Email(config), Trigger::Timer) if is_due(&cursor, CursorState::WaitingDelay, now) => {
                self.run_email(graph, &cursor, &node, config, now).await
            }
            (NodeKind::Delay(config), Trigger::Enter) if is_entering(cursor.state) => {
                self.schedule_delay(&cursor, &node, config, now)
            }
            (NodeKind::Delay(_), Trigger::Timer) if is_due(&cursor, CursorState::WaitingDelay, now) => {
                self.advance(graph, &cursor, &node, Branch::Next, now, "delay_elapsed")
            }
            (NodeKind::Condition(config), Trigger::Enter) if is_entering(cursor.state) => {
                self.enter_condition(graph, &cursor, &node, config, now)
            }
            (NodeKind::Condition(config), Trigger::Timer)
                if cursor.state == CursorState::WaitingCondition =>
            {
                self.resolve_condition(graph, &cursor, &node, config, now, &trigger)
            }
            (NodeKind::Condition(config), Trigger::Event(event))
                if cursor.state == CursorState::WaitingCondition =>
            {
                self.observe(graph, &cursor, &node, config, event, now)
            }
            (NodeKind::Goal(_), Trigger::Enter) if is_entering(cursor.state) => {
                self.reach_goal(&cursor, &node, now)
            }
            _ => Ok(StepOutcome::Ignored),
        };

        match result {
            Err(CampaignError::Conflict(reason)) => {
                debug!(cursor = %key, %reason, "Cursor moved during execution");
                Ok(StepOutcome::Ignored)
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Email
    // -----------------------------------------------------------------------

    async fn run_email(
        &self,
        graph: &FlowGraph,
        cursor: &RecipientCursor,
        node: &Node,
        config: &EmailConfig,
        now: DateTime<Utc>,
    ) -> CampaignResult<StepOutcome> {
        let key = cursor.key();
        let lead = match self.leads.get(&cursor.lead_id).map(|l| l.clone()) {
            Some(lead) => lead,
            None => return self.fail(&key, now, &format!("unknown lead {}", cursor.lead_id)),
        };

        let sent = match self.render(config, &lead).await {
            Ok(email) => self.mailer.send(&lead, &email.subject, &email.body).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(message_id) => {
                info!(
                    campaign_id = %cursor.campaign_id,
                    lead_id = %cursor.lead_id,
                    node_id = %node.id,
                    message_id = %message_id,
                    "Email sent"
                );
                metrics::counter!("flow.emails_sent").increment(1);

                let sent_event = EngagementEvent::new(
                    cursor.lead_id.clone(),
                    cursor.campaign_id,
                    EngagementType::Sent,
                    now,
                    format!("{}:{}", message_id, EngagementType::Sent.as_str()),
                );
                self.stats.apply_scoped(&sent_event, Some(&key), now);

                let mut record = make_activity(
                    ActivityType::EmailSent,
                    cursor.campaign_id,
                    cursor.flow_id,
                    cursor.lead_id.clone(),
                    Some(node.id.clone()),
                    now,
                );
                record.detail = json!({ "message_id": message_id });
                self.event_sink.emit(record);

                self.advance(graph, cursor, node, Branch::Next, now, "sent")
            }
            Err(SendError::Transient(reason)) => {
                metrics::counter!("flow.send_failures").increment(1);
                let attempt = cursor.retry_count + 1;
                if attempt > self.retry.max_retries {
                    return self.fail(
                        &key,
                        now,
                        &format!("send retries exhausted after {} attempts: {}", attempt, reason),
                    );
                }

                let retry_at = now + self.retry.backoff(attempt);
                warn!(
                    cursor = %key,
                    node_id = %node.id,
                    attempt,
                    retry_at = %retry_at,
                    %reason,
                    "Email send failed, retry scheduled"
                );
                self.transition(&key, node, CursorState::WaitingDelay, now, "send_retry", |c| {
                    c.retry_count = attempt;
                    c.next_run_at = Some(retry_at);
                })?;

                let mut record = make_activity(
                    ActivityType::EmailSendFailed,
                    cursor.campaign_id,
                    cursor.flow_id,
                    cursor.lead_id.clone(),
                    Some(node.id.clone()),
                    now,
                );
                record.detail = json!({ "attempt": attempt, "retry_at": retry_at, "reason": reason });
                self.event_sink.emit(record);
                Ok(StepOutcome::Parked)
            }
            Err(SendError::Permanent(reason)) => {
                metrics::counter!("flow.send_failures").increment(1);
                self.fail(&key, now, &reason)
            }
        }
    }

    async fn render(&self, config: &EmailConfig, lead: &Lead) -> Result<RenderedEmail, SendError> {
        match &config.template_ref {
            Some(template_ref) => self.renderer.render(template_ref, &lead.fields).await,
            None => Ok(RenderedEmail {
                subject: substitute(&config.subject, &lead.fields),
                body: substitute(&config.body, &lead.fields),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Delay
    // -----------------------------------------------------------------------

    fn schedule_delay(
        &self,
        cursor: &RecipientCursor,
        node: &Node,
        config: &DelayConfig,
        now: DateTime<Utc>,
    ) -> CampaignResult<StepOutcome> {
        let fire_at = now + config.duration().to_duration();
        self.transition(&cursor.key(), node, CursorState::WaitingDelay, now, "delay_scheduled", |c| {
            c.next_run_at = Some(fire_at);
        })?;

        let mut record = make_activity(
            ActivityType::DelayScheduled,
            cursor.campaign_id,
            cursor.flow_id,
            cursor.lead_id.clone(),
            Some(node.id.clone()),
            now,
        );
        record.detail = json!({ "fire_at": fire_at });
        self.event_sink.emit(record);
        Ok(StepOutcome::Parked)
    }

    // -----------------------------------------------------------------------
    // Condition
    // -----------------------------------------------------------------------

    fn enter_condition(
        &self,
        graph: &FlowGraph,
        cursor: &RecipientCursor,
        node: &Node,
        config: &ConditionConfig,
        now: DateTime<Utc>,
    ) -> CampaignResult<StepOutcome> {
        let deadline = now + config.wait.to_duration();
        let parked = self.transition(
            &cursor.key(),
            node,
            CursorState::WaitingCondition,
            now,
            "condition_entered",
            |c| {
                c.next_run_at = Some(deadline);
                c.condition = Some(ConditionWait {
                    node_id: node.id.clone(),
                    window_start: now,
                    deadline,
                    observed: Vec::new(),
                });
            },
        )?;

        // A zero-length window is already expired.
        self.resolve_condition(graph, &parked, node, config, now, &Trigger::Enter)
    }

    fn observe(
        &self,
        graph: &FlowGraph,
        cursor: &RecipientCursor,
        node: &Node,
        config: &ConditionConfig,
        event: &EngagementEvent,
        now: DateTime<Utc>,
    ) -> CampaignResult<StepOutcome> {
        if event.campaign_id != cursor.campaign_id || !config.watch.watches(event.event_type) {
            return Ok(StepOutcome::Ignored);
        }

        // The reported time is only trusted inside [window_start, now]; a
        // skewed clock must neither expire the window nor fall outside it.
        let updated = self
            .cursors
            .update(&cursor.key(), |c| {
                let parked_here = c.state == CursorState::WaitingCondition
                    && c.condition.as_ref().map(|w| w.node_id == node.id).unwrap_or(false);
                if !parked_here {
                    return None;
                }
                if let Some(wait) = c.condition.as_mut() {
                    let at = event.timestamp.min(now).max(wait.window_start);
                    wait.observed.push(SignalObservation {
                        signal: event.event_type,
                        at,
                    });
                }
                Some(c.clone())
            })
            .flatten();

        match updated {
            Some(parked) => {
                let trigger = Trigger::Event(event.clone());
                self.resolve_condition(graph, &parked, node, config, now, &trigger)
            }
            None => Ok(StepOutcome::Ignored),
        }
    }

    fn resolve_condition(
        &self,
        graph: &FlowGraph,
        cursor: &RecipientCursor,
        node: &Node,
        config: &ConditionConfig,
        at: DateTime<Utc>,
        trigger: &Trigger,
    ) -> CampaignResult<StepOutcome> {
        let wait = match &cursor.condition {
            Some(wait) if wait.node_id == node.id => wait,
            _ => return Ok(StepOutcome::Ignored),
        };

        let outcome = self
            .evaluator
            .evaluate_wait(&config.watch, config.match_mode, wait, at);
        if matches!(trigger, Trigger::Event(_)) && outcome == ConditionOutcome::on_timeout(config.match_mode) {
            // Only the deadline timer (or a zero-length window) takes the
            // timeout branch.
            return Ok(StepOutcome::Parked);
        }
        let branch = match outcome.branch() {
            Some(branch) => branch,
            None => return Ok(StepOutcome::Parked),
        };
        let via = trigger.label();

        let mut record = make_activity(
            ActivityType::ConditionResolved,
            cursor.campaign_id,
            cursor.flow_id,
            cursor.lead_id.clone(),
            Some(node.id.clone()),
            at,
        );
        record.detail = json!({ "branch": branch, "via": via });

        let step = self.advance(
            graph,
            cursor,
            node,
            branch,
            at,
            if outcome == ConditionOutcome::Yes { "yes" } else { "no" },
        )?;
        if step != StepOutcome::Ignored {
            info!(
                cursor = %cursor.key(),
                node_id = %node.id,
                branch = ?branch,
                via,
                "Condition resolved"
            );
            self.event_sink.emit(record);
        }
        Ok(step)
    }

    // -----------------------------------------------------------------------
    // Goal
    // -----------------------------------------------------------------------

    fn reach_goal(
        &self,
        cursor: &RecipientCursor,
        node: &Node,
        now: DateTime<Utc>,
    ) -> CampaignResult<StepOutcome> {
        self.transition(&cursor.key(), node, CursorState::GoalReached, now, "goal_reached", |c| {
            c.goal_reached_at = Some(now);
        })?;
        self.finished(cursor, Some(&node.id), CursorState::GoalReached, now, json!(null));
        info!(cursor = %cursor.key(), node_id = %node.id, "Goal reached");
        Ok(StepOutcome::Finished(CursorState::GoalReached))
    }

    // -----------------------------------------------------------------------
    // Shared transitions
    // -----------------------------------------------------------------------

    /// Moves the cursor along `branch`, or completes it when the node has no
    /// such edge.
    fn advance(
        &self,
        graph: &FlowGraph,
        cursor: &RecipientCursor,
        node: &Node,
        branch: Branch,
        now: DateTime<Utc>,
        outcome: &str,
    ) -> CampaignResult<StepOutcome> {
        let key = cursor.key();
        match graph.next(&node.id, branch) {
            Some(next) => {
                let next_id = next.id.clone();
                self.transition(&key, node, CursorState::Active, now, outcome, |c| {
                    c.current_node_id = next_id;
                    c.next_run_at = None;
                    c.retry_count = 0;
                    c.condition = None;
                })?;
                Ok(StepOutcome::Continue)
            }
            None => {
                self.transition(&key, node, CursorState::Completed, now, outcome, |c| {
                    c.next_run_at = None;
                    c.condition = None;
                })?;
                self.finished(cursor, Some(&node.id), CursorState::Completed, now, json!(null));
                debug!(cursor = %key, node_id = %node.id, "Flow completed");
                Ok(StepOutcome::Finished(CursorState::Completed))
            }
        }
    }

    fn fail(&self, key: &CursorKey, now: DateTime<Utc>, reason: &str) -> CampaignResult<StepOutcome> {
        let failed = self
            .cursors
            .update(key, |c| {
                self.state_machine.check(c.state, CursorState::Failed)?;
                c.history.push(StepExecution {
                    node_id: c.current_node_id.clone(),
                    node_type: "cursor".to_string(),
                    outcome: "failed".to_string(),
                    at: now,
                });
                c.state = CursorState::Failed;
                c.updated_at = now;
                c.next_run_at = None;
                c.condition = None;
                c.failure_reason = Some(reason.to_string());
                Ok::<_, CampaignError>(c.clone())
            })
            .ok_or_else(|| CampaignError::NotFound(format!("cursor {}", key)))??;

        warn!(cursor = %key, node_id = %failed.current_node_id, %reason, "Cursor failed");
        metrics::counter!("flow.cursors_failed").increment(1);
        let node_id = failed.current_node_id.clone();
        self.finished(&failed, Some(&node_id), CursorState::Failed, now, json!({ "reason": reason }));
        Ok(StepOutcome::Finished(CursorState::Failed))
    }

    /// Cancels a non-terminal cursor. Returns `false` when it had already
    /// finished.
    pub fn cancel(&self, key: &CursorKey, now: DateTime<Utc>, reason: &str) -> CampaignResult<bool> {
        let canceled = self
            .cursors
            .update(key, |c| {
                if c.state.is_terminal() {
                    return None;
                }
                c.history.push(StepExecution {
                    node_id: c.current_node_id.clone(),
                    node_type: "cursor".to_string(),
                    outcome: format!("canceled: {}", reason),
                    at: now,
                });
                c.state = CursorState::Canceled;
                c.updated_at = now;
                c.next_run_at = None;
                c.condition = None;
                Some(c.clone())
            })
            .ok_or_else(|| CampaignError::NotFound(format!("cursor {}", key)))?;

        match canceled {
            Some(cursor) => {
                debug!(cursor = %key, %reason, "Cursor canceled");
                metrics::counter!("flow.cursors_canceled").increment(1);
                let node_id = cursor.current_node_id.clone();
                self.finished(&cursor, Some(&node_id), CursorState::Canceled, now, json!({ "reason": reason }));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Applies a state change for `node`, rejecting it when the cursor is no
    /// longer on that node or the state machine forbids it.
    fn transition<F>(
        &self,
        key: &CursorKey,
        node: &Node,
        to: CursorState,
        now: DateTime<Utc>,
        outcome: &str,
        apply: F,
    ) -> CampaignResult<RecipientCursor>
    where
        F: FnOnce(&mut RecipientCursor),
    {
        self.cursors
            .update(key, |c| {
                if c.current_node_id != node.id {
                    return Err(CampaignError::Conflict(format!(
                        "cursor {} left node {}",
                        key, node.id
                    )));
                }
                self.state_machine.check(c.state, to)?;
                c.history.push(StepExecution {
                    node_id: node.id.clone(),
                    node_type: node.kind.label().to_string(),
                    outcome: outcome.to_string(),
                    at: now,
                });
                c.state = to;
                c.updated_at = now;
                apply(c);
                Ok(c.clone())
            })
            .ok_or_else(|| CampaignError::NotFound(format!("cursor {}", key)))?
    }

    fn finished(
        &self,
        cursor: &RecipientCursor,
        node_id: Option<&String>,
        state: CursorState,
        now: DateTime<Utc>,
        detail: serde_json::Value,
    ) {
        self.stats.record_outcome(cursor.campaign_id, state);
        let activity = match state {
            CursorState::GoalReached => ActivityType::GoalReached,
            CursorState::Completed => ActivityType::FlowCompleted,
            CursorState::Failed => ActivityType::CursorFailed,
            _ => ActivityType::CursorCanceled,
        };
        let mut record = make_activity(
            activity,
            cursor.campaign_id,
            cursor.flow_id,
            cursor.lead_id.clone(),
            node_id.cloned(),
            now,
        );
        record.detail = detail;
        self.event_sink.emit(record);
    }
}

fn is_entering(state: CursorState) -> bool {
    matches!(state, CursorState::Pending | CursorState::Active)
}

fn is_due(cursor: &RecipientCursor, state: CursorState, now: DateTime<Utc>) -> bool {
    cursor.state == state && cursor.next_run_at.map(|at| at <= now).unwrap_or(false)
}

use std::collections::HashMap;

use campaign_core::types::EngagementType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Flow definitions
// ---------------------------------------------------------------------------

/// Graph document as produced by the flow authoring tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDocument {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// An immutable, versioned flow snapshot bound to one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub version: u32,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub activated_at: DateTime<Utc>,
}

/// A typed step in the automation graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Email(EmailConfig),
    Condition(ConditionConfig),
    Delay(DelayConfig),
    Goal(GoalConfig),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Email(_) => "email",
            NodeKind::Condition(_) => "condition",
            NodeKind::Delay(_) => "delay",
            NodeKind::Goal(_) => "goal",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailConfig {
    /// Template rendered by the template collaborator. When absent the
    /// subject/body below are sent as-is.
    #[serde(default)]
    pub template_ref: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConditionConfig {
    #[serde(default)]
    pub watch: WatchedSignals,
    #[serde(default)]
    pub match_mode: MatchMode,
    pub wait: WaitDuration,
}

/// Engagement signals a condition node listens for. Each one is toggled
/// independently.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedSignals {
    #[serde(default)]
    pub opened: bool,
    #[serde(default)]
    pub clicked: bool,
    #[serde(default)]
    pub replied: bool,
}

impl WatchedSignals {
    pub fn watches(&self, signal: EngagementType) -> bool {
        match signal {
            EngagementType::Opened => self.opened,
            EngagementType::Clicked => self.clicked,
            EngagementType::Replied => self.replied,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// "yes" as soon as any watched signal occurs within the window.
    #[default]
    Any,
    /// "yes" only if no watched signal occurred by the end of the window.
    #[serde(rename = "none")]
    NoneOf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelayConfig {
    pub amount: u32,
    pub unit: TimeUnit,
}

impl DelayConfig {
    pub fn duration(&self) -> WaitDuration {
        WaitDuration {
            amount: self.amount,
            unit: self.unit,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitDuration {
    pub amount: u32,
    pub unit: TimeUnit,
}

impl WaitDuration {
    pub fn hours(amount: u32) -> Self {
        Self {
            amount,
            unit: TimeUnit::Hours,
        }
    }

    pub fn days(amount: u32) -> Self {
        Self {
            amount,
            unit: TimeUnit::Days,
        }
    }

    pub fn to_duration(&self) -> Duration {
        match self.unit {
            TimeUnit::Hours => Duration::hours(i64::from(self.amount)),
            TimeUnit::Days => Duration::days(i64::from(self.amount)),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Hours,
    Days,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoalConfig {
    #[serde(default)]
    pub kind: GoalKind,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    #[default]
    Conversion,
    Reply,
    Custom,
}

/// A labeled transition between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    pub target: String,
    #[serde(default)]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub condition_label: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
            condition_label: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Branch this edge is taken on, read from the source handle and falling
    /// back to the condition label.
    pub fn branch(&self) -> Branch {
        self.source_handle
            .as_deref()
            .or(self.condition_label.as_deref())
            .map(Branch::parse)
            .unwrap_or(Branch::Next)
    }
}

/// Outcome label carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Yes,
    No,
    Next,
}

impl Branch {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "match" | "matched" => Branch::Yes,
            "no" | "false" | "timeout" | "else" => Branch::No,
            _ => Branch::Next,
        }
    }
}

// ---------------------------------------------------------------------------
// Recipient cursors
// ---------------------------------------------------------------------------

/// Identity of a cursor: one lead within one flow version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorKey {
    pub flow_id: Uuid,
    pub lead_id: String,
}

impl CursorKey {
    pub fn new(flow_id: Uuid, lead_id: impl Into<String>) -> Self {
        Self {
            flow_id,
            lead_id: lead_id.into(),
        }
    }
}

impl std::fmt::Display for CursorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.flow_id, self.lead_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    Pending,
    Active,
    WaitingDelay,
    WaitingCondition,
    Completed,
    GoalReached,
    Failed,
    Canceled,
}

impl CursorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CursorState::Completed
                | CursorState::GoalReached
                | CursorState::Failed
                | CursorState::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorCounters {
    pub emails_sent: u32,
    pub opens: u32,
    pub clicks: u32,
    pub replies: u32,
}

/// An engagement signal observed while a condition node was waiting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalObservation {
    pub signal: EngagementType,
    pub at: DateTime<Utc>,
}

/// Evaluation window of the condition node a cursor is parked on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConditionWait {
    pub node_id: String,
    pub window_start: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub observed: Vec<SignalObservation>,
}

/// Persisted execution position of one lead within one flow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientCursor {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: String,
    pub current_node_id: String,
    pub state: CursorState,
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub counters: CursorCounters,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub condition: Option<ConditionWait>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub goal_reached_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub history: Vec<StepExecution>,
}

impl RecipientCursor {
    pub fn key(&self) -> CursorKey {
        CursorKey::new(self.flow_id, self.lead_id.clone())
    }
}

/// Record of one node execution for a cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepExecution {
    pub node_id: String,
    pub node_type: String,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Paused,
    Canceled,
}

impl CampaignStatus {
    /// Paused and canceled campaigns dispatch nothing.
    pub fn is_halted(&self) -> bool {
        !matches!(self, CampaignStatus::Active)
    }
}

/// Denormalized campaign totals maintained by the statistics aggregator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignStats {
    pub sent: u64,
    pub opens: u64,
    pub unique_opens: u64,
    pub clicks: u64,
    pub unique_clicks: u64,
    pub replies: u64,
    pub bounces: u64,
    pub unsubscribes: u64,
    pub enrolled: u64,
    pub goal_reached: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
}

/// Campaign status as reported by the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub active_flow_id: Option<Uuid>,
    pub active_version: Option<u32>,
    pub stats: CampaignStats,
    pub cursor_states: HashMap<String, u64>,
}

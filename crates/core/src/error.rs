use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Flow validation error: {0}")]
    InvalidFlow(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Campaign {0} is paused or canceled")]
    CampaignHalted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Structural defect found while validating a flow definition. Lists every
/// node and edge implicated by the first failing check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub node_ids: Vec<String>,
    pub edge_ids: Vec<String>,
    pub reason: ValidationReason,
}

impl ValidationError {
    pub fn nodes(reason: ValidationReason, node_ids: Vec<String>) -> Self {
        Self {
            node_ids,
            edge_ids: Vec::new(),
            reason,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if !self.node_ids.is_empty() {
            write!(f, " (nodes: {})", self.node_ids.join(", "))?;
        }
        if !self.edge_ids.is_empty() {
            write!(f, " (edges: {})", self.edge_ids.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    #[error("duplicate node or edge identifier")]
    DuplicateId,
    #[error("edge endpoint refers to an unknown node")]
    DanglingEdge,
    #[error("flow must have exactly one entry node")]
    EntryNodeCount,
    #[error("condition node needs exactly one 'yes' and one 'no' outgoing edge")]
    ConditionBranches,
    #[error("email and delay nodes allow at most one outgoing edge")]
    TooManyOutgoing,
    #[error("goal nodes must not have outgoing edges")]
    GoalHasOutgoing,
    #[error("node is unreachable from the entry node")]
    Unreachable,
    #[error("flow contains a cycle outside a condition timeout branch")]
    Cycle,
    #[error("loop through a condition timeout branch needs a non-zero wait window")]
    UnboundedLoop,
}

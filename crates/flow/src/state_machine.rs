use campaign_core::{CampaignError, CampaignResult};
use serde::Serialize;

use crate::types::CursorState;

/// Describes a single valid state transition for a recipient cursor.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: CursorState,
    pub to: CursorState,
    pub trigger: &'static str,
}

/// Guards cursor lifecycle by enforcing a finite set of valid state
/// transitions. Terminal states have no outgoing transitions.
#[derive(Debug, Clone)]
pub struct CursorStateMachine {
    transitions: Vec<StateTransition>,
}

impl CursorStateMachine {
    /// Creates a state machine with all valid transitions pre-configured.
    pub fn new() -> Self {
        use CursorState::*;

        let table: &[(CursorState, CursorState, &'static str)] = &[
            // Pending -> (entry node executes immediately at enrollment)
            (Pending, Active, "entry_advanced"),
            (Pending, WaitingDelay, "delay_scheduled"),
            (Pending, WaitingCondition, "condition_entered"),
            (Pending, GoalReached, "goal_reached"),
            (Pending, Completed, "flow_complete"),
            (Pending, Failed, "send_exhausted"),
            (Pending, Canceled, "canceled"),
            // Active ->
            (Active, Active, "advanced"),
            (Active, WaitingDelay, "delay_scheduled"),
            (Active, WaitingCondition, "condition_entered"),
            (Active, GoalReached, "goal_reached"),
            (Active, Completed, "flow_complete"),
            (Active, Failed, "send_exhausted"),
            (Active, Canceled, "canceled"),
            // WaitingDelay -> (delay fired, or email retry backoff)
            (WaitingDelay, Active, "delay_elapsed"),
            (WaitingDelay, WaitingDelay, "retry_scheduled"),
            (WaitingDelay, Completed, "flow_complete"),
            (WaitingDelay, Failed, "send_exhausted"),
            (WaitingDelay, Canceled, "canceled"),
            // WaitingCondition ->
            (WaitingCondition, Active, "condition_resolved"),
            (WaitingCondition, Failed, "node_missing"),
            (WaitingCondition, Canceled, "canceled"),
        ];

        let transitions = table
            .iter()
            .map(|&(from, to, trigger)| StateTransition { from, to, trigger })
            .collect();

        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: CursorState, to: CursorState) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Validates a transition, returning an error if it is not permitted.
    pub fn check(&self, from: CursorState, to: CursorState) -> CampaignResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(CampaignError::Conflict(format!(
                "invalid cursor transition from {:?} to {:?}",
                from, to
            )))
        }
    }
}

impl Default for CursorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

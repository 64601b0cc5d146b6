use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Branch, ConditionWait, MatchMode, SignalObservation, WatchedSignals};

/// Result of evaluating a condition node at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOutcome {
    Yes,
    No,
    Pending,
}

impl ConditionOutcome {
    /// Edge label to follow, or `None` while the window is still open.
    pub fn branch(&self) -> Option<Branch> {
        match self {
            ConditionOutcome::Yes => Some(Branch::Yes),
            ConditionOutcome::No => Some(Branch::No),
            ConditionOutcome::Pending => None,
        }
    }

    /// Outcome of a window that expires without a watched signal.
    pub fn on_timeout(mode: MatchMode) -> Self {
        match mode {
            MatchMode::Any => ConditionOutcome::No,
            MatchMode::NoneOf => ConditionOutcome::Yes,
        }
    }
}

/// Decides condition branches from the signals observed in a wait window.
///
/// The evaluator is pure: the same observations and evaluation instant always
/// give the same outcome. Both the event path and the timeout path call it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates `mode` over the watched signals observed in
    /// `[window_start, deadline]`, as of `at`.
    ///
    /// - `any`: "yes" as soon as a watched signal is seen, "no" at expiry.
    /// - `none`: "no" as soon as a watched signal is seen, "yes" at expiry.
    pub fn evaluate(
        &self,
        watch: &WatchedSignals,
        mode: MatchMode,
        observed: &[SignalObservation],
        window_start: DateTime<Utc>,
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> ConditionOutcome {
        let occurred = observed.iter().any(|o| {
            watch.watches(o.signal) && o.at >= window_start && o.at <= deadline && o.at <= at
        });
        let expired = at >= deadline;

        match (mode, occurred, expired) {
            (MatchMode::Any, true, _) => ConditionOutcome::Yes,
            (MatchMode::Any, false, true) => ConditionOutcome::No,
            (MatchMode::NoneOf, true, _) => ConditionOutcome::No,
            (MatchMode::NoneOf, false, true) => ConditionOutcome::Yes,
            (_, false, false) => ConditionOutcome::Pending,
        }
    }

    /// Convenience wrapper over a cursor's parked condition window.
    pub fn evaluate_wait(
        &self,
        watch: &WatchedSignals,
        mode: MatchMode,
        wait: &ConditionWait,
        at: DateTime<Utc>,
    ) -> ConditionOutcome {
        self.evaluate(watch, mode, &wait.observed, wait.window_start, wait.deadline, at)
    }
}

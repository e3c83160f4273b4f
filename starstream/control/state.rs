use std::fmt;

use serde::{Deserialize, Serialize};
use starstream_fabric::{IntentError, IntentId};
use thiserror::Error;

/// Orchestrator state of one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    /// Waiting for a plan.
    Pending,
    /// Candidate path found.
    Planned,
    /// Policy admitted the candidate and capacity is committed.
    Approved,
    /// Dispatched to the executor.
    Executing,
    /// Applied; checking telemetry against the intent.
    Verifying,
    /// Allocation serves the intent.
    Converged,
    /// Backing off before the next cycle.
    Retrying,
    /// Gave up. Terminal.
    Failed,
    /// Cancelled by the submitter. Terminal.
    Withdrawn,
    /// Torn down after convergence (teardown, expiry, or replacement). Terminal.
    Released,
    /// Evicted by a higher-priority intent. Terminal.
    Preempted,
}

impl IntentState {
    /// Whether `next` is a legal successor.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use IntentState::{
            Approved, Converged, Executing, Failed, Pending, Planned, Preempted, Released,
            Retrying, Verifying, Withdrawn,
        };
        matches!(
            (self, next),
            (Pending, Planned | Retrying | Failed | Withdrawn)
                | (Planned, Approved | Retrying | Failed | Withdrawn)
                | (Approved, Executing | Retrying | Failed | Withdrawn)
                | (Executing, Verifying | Retrying | Failed | Withdrawn)
                | (Verifying, Converged | Retrying | Failed | Withdrawn)
                | (Retrying, Pending | Failed | Withdrawn)
                | (Converged, Released | Withdrawn | Preempted)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Withdrawn | Self::Released | Self::Preempted
        )
    }

    /// Whether the per-intent loop has stopped driving this intent.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Converged) || self.is_terminal()
    }

    /// Label for logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planned => "planned",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Converged => "converged",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Withdrawn => "withdrawn",
            Self::Released => "released",
            Self::Preempted => "preempted",
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Control-plane errors surfaced to callers.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ControlError {
    /// No intent with this id was submitted.
    #[error("unknown intent {0}")]
    UnknownIntent(IntentId),
    /// The intent failed validation.
    #[error("invalid intent: {0}")]
    InvalidIntent(#[from] IntentError),
    /// The intent already reached a terminal state.
    #[error("intent {intent} is already {state}")]
    AlreadyTerminal {
        /// Intent.
        intent: IntentId,
        /// Terminal state.
        state: IntentState,
    },
    /// A state change the lifecycle does not allow.
    #[error("intent {intent} cannot move from {from} to {to}")]
    IllegalTransition {
        /// Intent.
        intent: IntentId,
        /// Current state.
        from: IntentState,
        /// Requested state.
        to: IntentState,
    },
    /// The resource model refused an operation the plan relied on.
    #[error("integrity violation: {0}")]
    Integrity(String),
    /// Misconfiguration detected while building the control plane.
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            IntentState::Pending,
            IntentState::Planned,
            IntentState::Approved,
            IntentState::Executing,
            IntentState::Verifying,
            IntentState::Converged,
            IntentState::Released,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn retry_loops_back_through_pending() {
        assert!(IntentState::Verifying.can_transition_to(IntentState::Retrying));
        assert!(IntentState::Retrying.can_transition_to(IntentState::Pending));
        assert!(!IntentState::Retrying.can_transition_to(IntentState::Planned));
    }

    #[test]
    fn terminal_states_are_final() {
        for state in [
            IntentState::Failed,
            IntentState::Withdrawn,
            IntentState::Released,
            IntentState::Preempted,
        ] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(IntentState::Pending));
        }
        assert!(IntentState::Converged.is_settled());
        assert!(!IntentState::Converged.is_terminal());
    }
}

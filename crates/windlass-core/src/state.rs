//! Execution states and transition legality
//!
//! Workflow, task and action executions share a single state enumeration.
//! The transition table is the authority on which state changes are legal;
//! the engine refuses anything else with `EngineError::InvalidStateTransition`.

use serde::{Deserialize, Serialize};

/// State of a workflow, task or action execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Created but not yet runnable
    Idle,

    /// Blocked on a join quorum
    Waiting,

    /// Actively executing
    Running,

    /// Temporarily parked by a policy (wait-before, wait-after, retry)
    RunningDelayed,

    /// Suspended; only resume/cancel may move it on
    Paused,

    /// Completed successfully (terminal)
    Success,

    /// Cancelled (terminal)
    Cancelled,

    /// Completed with an error; rerun may re-enter RUNNING
    Error,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::RunningDelayed => "RUNNING_DELAYED",
            Self::Paused => "PAUSED",
            Self::Success => "SUCCESS",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl ExecutionState {
    /// Whether this state is terminal for the execution
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Whether the execution is paused
    pub fn is_paused(self) -> bool {
        matches!(self, Self::Paused)
    }

    /// Whether the execution is paused or already completed
    pub fn is_paused_or_completed(self) -> bool {
        self.is_paused() || self.is_completed()
    }

    /// Whether the execution still makes forward progress on its own
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::RunningDelayed)
    }
}

/// Check whether a state transition is legal
///
/// A transition to the same state is always legal and treated by callers as
/// an idempotent no-op.
pub fn is_valid_transition(from: ExecutionState, to: ExecutionState) -> bool {
    use ExecutionState::*;

    if from == to {
        return true;
    }

    match from {
        Idle => matches!(to, Running | Error | Cancelled),
        Waiting => matches!(to, Running),
        Running => matches!(to, Paused | RunningDelayed | Success | Error | Cancelled),
        RunningDelayed => matches!(to, Running | Error | Cancelled),
        Paused => matches!(to, Running | Error | Cancelled),
        // Rerun re-arms errored executions
        Error => matches!(to, Running),
        Success | Cancelled => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    const ALL: [ExecutionState; 8] = [
        Idle,
        Waiting,
        Running,
        RunningDelayed,
        Paused,
        Success,
        Cancelled,
        Error,
    ];

    #[test]
    fn test_legal_transitions() {
        let legal = [
            (Idle, Running),
            (Idle, Error),
            (Idle, Cancelled),
            (Waiting, Running),
            (Running, Paused),
            (Running, RunningDelayed),
            (Running, Success),
            (Running, Error),
            (Running, Cancelled),
            (RunningDelayed, Running),
            (RunningDelayed, Error),
            (RunningDelayed, Cancelled),
            (Paused, Running),
            (Paused, Error),
            (Paused, Cancelled),
            (Error, Running),
        ];

        for (from, to) in legal {
            assert!(is_valid_transition(from, to), "{from} -> {to} should be legal");
        }

        // Everything not listed (and not a self-transition) is illegal.
        for from in ALL {
            for to in ALL {
                if from == to || legal.contains(&(from, to)) {
                    continue;
                }
                assert!(
                    !is_valid_transition(from, to),
                    "{from} -> {to} should be illegal"
                );
            }
        }
    }

    #[test]
    fn test_self_transition_is_legal() {
        for state in ALL {
            assert!(is_valid_transition(state, state));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(Success.is_completed());
        assert!(Error.is_completed());
        assert!(Cancelled.is_completed());
        assert!(!Running.is_completed());
        assert!(!Paused.is_completed());
        assert!(Paused.is_paused_or_completed());
    }

    #[test]
    fn test_serialization_uses_screaming_snake_case() {
        let json = serde_json::to_string(&RunningDelayed).unwrap();
        assert_eq!(json, "\"RUNNING_DELAYED\"");

        let parsed: ExecutionState = serde_json::from_str("\"SUCCESS\"").unwrap();
        assert_eq!(parsed, Success);
    }
}

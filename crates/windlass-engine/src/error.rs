//! Engine error taxonomy

use windlass_core::{ExecutionState, ExprError};

use crate::persistence::StoreError;

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Illegal state change attempted - a programming error or a race
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    /// Domain rule violation (unsupported command, missing definition)
    #[error("workflow error: {0}")]
    Workflow(String),

    /// Malformed with-items collections or action input
    #[error("input error: {0}")]
    Input(String),

    /// Operation is not supported by this engine
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Expression evaluation error
    #[error("expression error: {0}")]
    Expression(#[from] ExprError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Check a state transition against the legality table
    pub fn check_transition(from: ExecutionState, to: ExecutionState) -> Result<(), Self> {
        if windlass_core::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(Self::InvalidStateTransition { from, to })
        }
    }
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Truncate a diagnostic message before it lands in `state_info`
///
/// Remote executors can return arbitrarily large error payloads; the stored
/// diagnostic is size-limited.
pub fn truncate_state_info(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }

    let mut end = limit;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn test_check_transition() {
        assert!(EngineError::check_transition(Idle, Running).is_ok());

        let err = EngineError::check_transition(Success, Running).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStateTransition {
                from: Success,
                to: Running
            }
        ));
    }

    #[test]
    fn test_truncate_state_info() {
        assert_eq!(truncate_state_info("short", 10), "short");

        let long = "x".repeat(20);
        let truncated = truncate_state_info(&long, 10);
        assert_eq!(truncated, format!("{}...", "x".repeat(10)));

        // Multi-byte characters never split
        let unicode = "héllo wörld".repeat(5);
        let truncated = truncate_state_info(&unicode, 7);
        assert!(truncated.ends_with("..."));
    }
}

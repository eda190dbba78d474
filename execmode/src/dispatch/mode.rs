//! Execution modes and the per-call state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runtime::PoolKind;

/// Where a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// On an event-loop thread. The handler must not block.
    EventLoop,
    /// On the worker pool. The handler may block.
    Blocking,
}

impl ExecutionMode {
    pub fn pool(self) -> PoolKind {
        match self {
            ExecutionMode::EventLoop => PoolKind::EventLoop,
            ExecutionMode::Blocking => PoolKind::Worker,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::EventLoop => write!(f, "event-loop"),
            ExecutionMode::Blocking => write!(f, "blocking"),
        }
    }
}

/// Lifecycle of one inbound call.
///
/// ```text
/// Received -> ModeSelected(mode) -> Executing -> Completed | Failed
/// ```
///
/// A call that cannot be resolved goes straight from `Received` to
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Received,
    ModeSelected(ExecutionMode),
    Executing,
    Completed,
    Failed,
}

impl CallState {
    pub fn can_advance_to(self, next: CallState) -> bool {
        matches!(
            (self, next),
            (CallState::Received, CallState::ModeSelected(_))
                | (CallState::Received, CallState::Failed)
                | (CallState::ModeSelected(_), CallState::Executing)
                | (CallState::Executing, CallState::Completed)
                | (CallState::Executing, CallState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selects_pool() {
        assert_eq!(ExecutionMode::EventLoop.pool(), PoolKind::EventLoop);
        assert_eq!(ExecutionMode::Blocking.pool(), PoolKind::Worker);
        assert_eq!(
            serde_json::to_string(&ExecutionMode::EventLoop).unwrap(),
            "\"event-loop\""
        );
    }

    #[test]
    fn test_call_state_transitions() {
        let selected = CallState::ModeSelected(ExecutionMode::Blocking);
        assert!(CallState::Received.can_advance_to(selected));
        assert!(selected.can_advance_to(CallState::Executing));
        assert!(CallState::Executing.can_advance_to(CallState::Completed));
        assert!(CallState::Received.can_advance_to(CallState::Failed));

        assert!(!CallState::Received.can_advance_to(CallState::Executing));
        assert!(!CallState::Completed.can_advance_to(CallState::Failed));
        assert!(!selected.can_advance_to(CallState::Completed));
        assert!(CallState::Failed.is_terminal());
        assert!(!CallState::Executing.is_terminal());
    }
}

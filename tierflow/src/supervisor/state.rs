//! Supervision state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Phases of one supervised task, as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisionState {
    /// Launched, not yet observed running.
    #[default]
    Launching,
    /// The platform reported the unit as running.
    Running,
    Succeeded,
    Failed,
    /// The launch path's ceiling was reached and the unit was terminated.
    TimedOut,
}

impl SupervisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launching => "LAUNCHING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Log tailing is only meaningful once the unit has started.
    pub fn has_started(&self) -> bool {
        !matches!(self, Self::Launching)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: SupervisionState) -> bool {
        use SupervisionState::*;

        match (self, target) {
            (from, to) if from == &to => true,

            // A unit may hang in placement until the ceiling.
            (Launching, Running | TimedOut) => true,

            (Running, Succeeded | Failed | TimedOut) => true,

            // Terminal states are absorbing
            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: SupervisionState) -> Result<SupervisionState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for SupervisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

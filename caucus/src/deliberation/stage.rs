//! Deliberation lifecycle stages and the static transition table.

use serde::{Deserialize, Serialize};

/// Stage of a deliberation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Participants submit initial opinions.
    Opinion,
    /// Participants rank the generated candidate statements.
    Ranking,
    /// Participants critique the winning statement.
    Critique,
    /// Awaiting human feedback on the final statement.
    Concluded,
    /// Complete — results are frozen.
    Finalized,
}

impl Stage {
    /// Whether this is the terminal stage.
    pub fn is_terminal(self) -> bool {
        self == Self::Finalized
    }

    /// Valid transitions from this stage.
    ///
    /// `Critique → Ranking` is the loop-back edge, taken only while
    /// critique rounds remain; the caller enforces the round guard.
    pub fn valid_transitions(self) -> &'static [Stage] {
        match self {
            Self::Opinion => &[Self::Ranking],
            Self::Ranking => &[Self::Critique],
            Self::Critique => &[Self::Ranking, Self::Concluded],
            Self::Concluded => &[Self::Finalized],
            Self::Finalized => &[],
        }
    }

    /// Whether any transition out of this stage exists.
    pub fn can_transition(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opinion => write!(f, "opinion"),
            Self::Ranking => write!(f, "ranking"),
            Self::Critique => write!(f, "critique"),
            Self::Concluded => write!(f, "concluded"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

/// Error for invalid stage transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: Stage,
    pub to: Stage,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} -> {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

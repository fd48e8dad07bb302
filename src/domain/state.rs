use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Competition lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionStatus {
    /// Announced on the agent's channel, collecting participation
    Sent,
    /// Participation window elapsed, pending winner selection
    AwaitingWinners,
    /// Winners finalized
    Completed,
    /// Administratively withdrawn
    Archived,
}

impl CompetitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompetitionStatus::Sent => "sent",
            CompetitionStatus::AwaitingWinners => "awaiting_winners",
            CompetitionStatus::Completed => "completed",
            CompetitionStatus::Archived => "archived",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: CompetitionStatus) -> bool {
        use CompetitionStatus::*;

        match (self, target) {
            // Window elapsed (sweeper only)
            (Sent, AwaitingWinners) => true,

            // Quotas satisfied or administrative close
            (AwaitingWinners, Completed) => true,

            // Administrative withdrawal
            (Sent, Archived) => true,
            (AwaitingWinners, Archived) => true,

            // Never backward, terminal states are final
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<CompetitionStatus> {
        use CompetitionStatus::*;

        match self {
            Sent => vec![AwaitingWinners, Archived],
            AwaitingWinners => vec![Completed, Archived],
            Completed | Archived => vec![],
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompetitionStatus::Completed | CompetitionStatus::Archived
        )
    }

    /// Position along the forward-only lifecycle. Terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            CompetitionStatus::Sent => 0,
            CompetitionStatus::AwaitingWinners => 1,
            CompetitionStatus::Completed | CompetitionStatus::Archived => 2,
        }
    }
}

impl fmt::Display for CompetitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for CompetitionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "sent" => Ok(CompetitionStatus::Sent),
            "awaiting_winners" => Ok(CompetitionStatus::AwaitingWinners),
            "completed" => Ok(CompetitionStatus::Completed),
            "archived" => Ok(CompetitionStatus::Archived),
            _ => Err(format!("Unknown competition status: {}", s)),
        }
    }
}

/// State transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CompetitionStatus,
    pub to: CompetitionStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(
        from: CompetitionStatus,
        to: CompetitionStatus,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp,
        }
    }
}

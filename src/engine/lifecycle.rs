//! Competition state machine transitions
//!
//! Each transition takes an immutable snapshot and returns the next snapshot
//! plus the side effects the caller has to apply. Store access and messaging
//! happen elsewhere, so the rules here are testable without a database.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::allocator::QuotaTally;
use crate::domain::{Competition, CompetitionStatus, StateTransition};
use crate::error::{ContestError, Result};

/// Work a caller must perform after accepting a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write the new status with a conditional update on `from`
    PersistStatus {
        competition_id: Uuid,
        from: CompetitionStatus,
        to: CompetitionStatus,
    },
    /// Ask the agent to pick winners (best effort)
    NotifyWinnerSelection {
        agent_id: Uuid,
        competition_id: Uuid,
        correct_answer: Option<String>,
    },
}

/// Accepted transition
#[derive(Debug, Clone)]
pub struct Transition {
    pub competition: Competition,
    pub record: StateTransition,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn new(
        before: &Competition,
        after: Competition,
        reason: &str,
        now: DateTime<Utc>,
        mut extra: Vec<Effect>,
    ) -> Self {
        let mut effects = vec![Effect::PersistStatus {
            competition_id: before.id,
            from: before.status,
            to: after.status,
        }];
        effects.append(&mut extra);

        Self {
            record: StateTransition::new(before.status, after.status, reason, now),
            competition: after,
            effects,
        }
    }
}

fn already(competition: &Competition) -> ContestError {
    ContestError::AlreadyInState {
        id: competition.id,
        status: competition.status,
    }
}

fn closed(competition: &Competition) -> ContestError {
    ContestError::CompetitionClosed {
        id: competition.id,
        status: competition.status,
    }
}

/// `sent → awaiting_winners`, only once the window has elapsed
pub fn expire(competition: &Competition, now: DateTime<Utc>) -> Result<Transition> {
    if competition.status != CompetitionStatus::Sent {
        return Err(already(competition));
    }
    if !competition.is_expired(now) {
        return Err(ContestError::Validation(format!(
            "competition {} runs until {}",
            competition.id, competition.ends_at
        )));
    }

    let next = Competition {
        status: CompetitionStatus::AwaitingWinners,
        processed_at: Some(now),
        ..competition.clone()
    };
    let notify = Effect::NotifyWinnerSelection {
        agent_id: competition.agent_id,
        competition_id: competition.id,
        correct_answer: competition.correct_answer.clone(),
    };

    Ok(Transition::new(
        competition,
        next,
        "participation window elapsed",
        now,
        vec![notify],
    ))
}

/// `awaiting_winners → completed`.
///
/// Without `force` every quota must be filled; `force` closes with whatever
/// winners exist (including none).
pub fn complete(
    competition: &Competition,
    tally: &QuotaTally,
    force: bool,
    now: DateTime<Utc>,
) -> Result<Transition> {
    match competition.status {
        CompetitionStatus::AwaitingWinners => {}
        CompetitionStatus::Completed => return Err(already(competition)),
        CompetitionStatus::Archived => return Err(closed(competition)),
        CompetitionStatus::Sent => {
            return Err(ContestError::NotAwaitingWinners {
                id: competition.id,
                status: competition.status,
            })
        }
    }

    if !force && !tally.is_satisfied() {
        return Err(ContestError::QuotasUnfilled {
            id: competition.id,
            trading: tally.trading_remaining(),
            deposit: tally.deposit_remaining(),
        });
    }

    let reason = if tally.is_satisfied() {
        "winner quotas satisfied"
    } else {
        "closed by operator"
    };
    let next = Competition {
        status: CompetitionStatus::Completed,
        closed_at: Some(now),
        ..competition.clone()
    };

    Ok(Transition::new(competition, next, reason, now, Vec::new()))
}

/// `sent | awaiting_winners → archived`, bypassing quota checks
pub fn archive(competition: &Competition, now: DateTime<Utc>) -> Result<Transition> {
    match competition.status {
        CompetitionStatus::Sent | CompetitionStatus::AwaitingWinners => {}
        CompetitionStatus::Archived => return Err(already(competition)),
        CompetitionStatus::Completed => return Err(closed(competition)),
    }

    let next = Competition {
        status: CompetitionStatus::Archived,
        closed_at: Some(now),
        ..competition.clone()
    };

    Ok(Transition::new(
        competition,
        next,
        "archived by operator",
        now,
        Vec::new(),
    ))
}

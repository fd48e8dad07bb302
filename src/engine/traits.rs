//! Boundaries of the engine: persistence and the messaging channel

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ledger::Ledger;
use crate::domain::{Agent, Competition, CompetitionStatus, Winner};
use crate::error::Result;

/// Result of inserting a competition together with its ledger debit
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// Row written and ledger swapped
    Inserted,
    /// `(agent_id, idempotency_key)` already taken; nothing written
    DuplicateKey(Competition),
    /// Ledger changed since it was read; nothing written
    LedgerConflict,
}

/// Result of persisting one winner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// The winner's track is already full in the store
    QuotaFull,
    /// The competition left `awaiting_winners` in the meantime
    NotAwaiting(CompetitionStatus),
}

/// Result of removing a winner
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted(Winner),
    NotFound,
    /// The competition is terminal
    Closed(CompetitionStatus),
}

/// Persisted state: agents, competitions and winners.
///
/// Every method is atomic on its own. Multi-record methods
/// (`insert_competition`, `remove_competition`, `record_winner`,
/// `delete_winner`) must commit all of their writes or none.
#[async_trait]
pub trait ContestStore: Send + Sync {
    async fn insert_agent(&self, agent: &Agent) -> Result<()>;

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>>;

    /// Agents whose cadence is not `none`
    async fn list_renewable_agents(&self) -> Result<Vec<Agent>>;

    /// Compare-and-swap on the ledger. `renewed_at` also stamps
    /// `last_renewal_at`. Returns false if `expected` is stale.
    async fn swap_ledger(
        &self,
        agent_id: Uuid,
        expected: &Ledger,
        next: &Ledger,
        renewed_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn get_competition(&self, id: Uuid) -> Result<Option<Competition>>;

    async fn find_competition_by_key(
        &self,
        agent_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Competition>>;

    /// Insert the row and swap the agent's ledger in one unit
    async fn insert_competition(
        &self,
        competition: &Competition,
        expected: &Ledger,
        next: &Ledger,
    ) -> Result<InsertOutcome>;

    /// Delete an un-announced competition and swap the ledger back in one
    /// unit. Returns false on a stale ledger.
    async fn remove_competition(
        &self,
        competition: &Competition,
        expected: &Ledger,
        next: &Ledger,
    ) -> Result<bool>;

    /// `sent` competitions whose window ended at or before `now`
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Competition>>;

    /// Write `next.status`, `processed_at` and `closed_at` only if the stored
    /// status is still `from`
    async fn transition_status(
        &self,
        from: CompetitionStatus,
        next: &Competition,
    ) -> Result<bool>;

    async fn list_winners(&self, competition_id: Uuid) -> Result<Vec<Winner>>;

    async fn get_winner(&self, id: Uuid) -> Result<Option<Winner>>;

    /// Insert a winner after re-checking status and the track's quota under
    /// the competition lock. `complete` carries the completed snapshot when
    /// this winner fills the last slot.
    async fn record_winner(
        &self,
        winner: &Winner,
        complete: Option<&Competition>,
    ) -> Result<RecordOutcome>;

    /// Delete a winner unless its competition is terminal
    async fn delete_winner(&self, id: Uuid) -> Result<DeleteOutcome>;

    async fn set_winner_email(&self, id: Uuid, email: &str) -> Result<bool>;
}

/// Message identifier assigned by the channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Outbound notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub text: String,
    /// Post as a reply to an earlier message
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// Photo URL; the text becomes its caption
    #[serde(default)]
    pub attachment: Option<String>,
}

impl Announcement {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, url: impl Into<String>) -> Self {
        self.attachment = Some(url.into());
        self
    }

    pub fn replying_to(mut self, message: MessageId) -> Self {
        self.reply_to = Some(message);
        self
    }
}

/// Live channel metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub title: String,
}

/// External messaging channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, destination: &str, announcement: &Announcement) -> Result<MessageId>;

    async fn channel_info(&self, destination: &str) -> Result<ChannelInfo>;
}

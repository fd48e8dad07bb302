//! In-memory store
//!
//! Used by tests and dry runs. A single `RwLock` over all tables gives every
//! trait method the same all-or-nothing behaviour as a Postgres transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{Agent, Competition, CompetitionStatus, PrizeTrack, Winner};
use crate::engine::ledger::Ledger;
use crate::engine::traits::{ContestStore, DeleteOutcome, InsertOutcome, RecordOutcome};
use crate::error::{ContestError, Result};

#[derive(Default)]
struct Tables {
    agents: HashMap<Uuid, Agent>,
    competitions: HashMap<Uuid, Competition>,
    /// Insertion order doubles as selection order
    winners: Vec<Winner>,
}

impl Tables {
    fn swap_ledger(
        &mut self,
        agent_id: Uuid,
        expected: &Ledger,
        next: &Ledger,
        renewed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(ContestError::AgentNotFound(agent_id))?;
        if agent.ledger != *expected {
            return Ok(false);
        }
        agent.ledger = *next;
        if renewed_at.is_some() {
            agent.last_renewal_at = renewed_at;
        }
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a competition row directly, bypassing the ledger
    pub async fn put_competition(&self, competition: Competition) {
        self.tables
            .write()
            .await
            .competitions
            .insert(competition.id, competition);
    }

    /// Write a winner row directly, bypassing status and quota checks
    pub async fn put_winner(&self, winner: Winner) {
        self.tables.write().await.winners.push(winner);
    }

    pub async fn competitions_of(&self, agent_id: Uuid) -> Vec<Competition> {
        let tables = self.tables.read().await;
        let mut found: Vec<Competition> = tables
            .competitions
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        found
    }
}

#[async_trait]
impl ContestStore for MemoryStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.agents.contains_key(&agent.id) {
            return Err(ContestError::Conflict(format!("agent {} already exists", agent.id)));
        }
        tables.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        Ok(self.tables.read().await.agents.get(&id).cloned())
    }

    async fn list_renewable_agents(&self) -> Result<Vec<Agent>> {
        let tables = self.tables.read().await;
        let mut agents: Vec<Agent> = tables
            .agents
            .values()
            .filter(|a| a.renewal_cadence.is_enabled())
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn swap_ledger(
        &self,
        agent_id: Uuid,
        expected: &Ledger,
        next: &Ledger,
        renewed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.tables
            .write()
            .await
            .swap_ledger(agent_id, expected, next, renewed_at)
    }

    async fn get_competition(&self, id: Uuid) -> Result<Option<Competition>> {
        Ok(self.tables.read().await.competitions.get(&id).cloned())
    }

    async fn find_competition_by_key(
        &self,
        agent_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Competition>> {
        Ok(self
            .tables
            .read()
            .await
            .competitions
            .values()
            .find(|c| c.agent_id == agent_id && c.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn insert_competition(
        &self,
        competition: &Competition,
        expected: &Ledger,
        next: &Ledger,
    ) -> Result<InsertOutcome> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables.competitions.values().find(|c| {
            c.agent_id == competition.agent_id && c.idempotency_key == competition.idempotency_key
        }) {
            return Ok(InsertOutcome::DuplicateKey(existing.clone()));
        }
        if !tables.swap_ledger(competition.agent_id, expected, next, None)? {
            return Ok(InsertOutcome::LedgerConflict);
        }

        tables.competitions.insert(competition.id, competition.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn remove_competition(
        &self,
        competition: &Competition,
        expected: &Ledger,
        next: &Ledger,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;

        let removable = tables
            .competitions
            .get(&competition.id)
            .map(|c| c.status == CompetitionStatus::Sent)
            .unwrap_or(false);
        if !removable || !tables.swap_ledger(competition.agent_id, expected, next, None)? {
            return Ok(false);
        }

        tables.competitions.remove(&competition.id);
        tables.winners.retain(|w| w.competition_id != competition.id);
        Ok(true)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Competition>> {
        let tables = self.tables.read().await;
        let mut expired: Vec<Competition> = tables
            .competitions
            .values()
            .filter(|c| c.status == CompetitionStatus::Sent && c.ends_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|c| c.ends_at);
        Ok(expired)
    }

    async fn transition_status(&self, from: CompetitionStatus, next: &Competition) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(stored) = tables.competitions.get_mut(&next.id) else {
            return Err(ContestError::CompetitionNotFound(next.id));
        };
        if stored.status != from {
            return Ok(false);
        }

        stored.status = next.status;
        stored.processed_at = next.processed_at;
        stored.closed_at = next.closed_at;
        Ok(true)
    }

    async fn list_winners(&self, competition_id: Uuid) -> Result<Vec<Winner>> {
        Ok(self
            .tables
            .read()
            .await
            .winners
            .iter()
            .filter(|w| w.competition_id == competition_id)
            .cloned()
            .collect())
    }

    async fn get_winner(&self, id: Uuid) -> Result<Option<Winner>> {
        Ok(self
            .tables
            .read()
            .await
            .winners
            .iter()
            .find(|w| w.id == id)
            .cloned())
    }

    async fn record_winner(
        &self,
        winner: &Winner,
        complete: Option<&Competition>,
    ) -> Result<RecordOutcome> {
        let mut tables = self.tables.write().await;

        let competition = tables
            .competitions
            .get(&winner.competition_id)
            .ok_or(ContestError::CompetitionNotFound(winner.competition_id))?;
        if competition.status != CompetitionStatus::AwaitingWinners {
            return Ok(RecordOutcome::NotAwaiting(competition.status));
        }

        let quota = match winner.prize_track {
            PrizeTrack::Trading => competition.trading_winner_quota,
            PrizeTrack::Deposit => competition.deposit_winner_quota,
        };
        let taken = tables
            .winners
            .iter()
            .filter(|w| w.competition_id == winner.competition_id && w.prize_track == winner.prize_track)
            .count();
        if taken >= quota as usize {
            return Ok(RecordOutcome::QuotaFull);
        }

        tables.winners.push(winner.clone());
        if let Some(done) = complete {
            if let Some(stored) = tables.competitions.get_mut(&done.id) {
                stored.status = done.status;
                stored.closed_at = done.closed_at;
            }
        }
        Ok(RecordOutcome::Recorded)
    }

    async fn delete_winner(&self, id: Uuid) -> Result<DeleteOutcome> {
        let mut tables = self.tables.write().await;

        let Some(index) = tables.winners.iter().position(|w| w.id == id) else {
            return Ok(DeleteOutcome::NotFound);
        };
        let competition_id = tables.winners[index].competition_id;
        let status = tables
            .competitions
            .get(&competition_id)
            .map(|c| c.status)
            .ok_or(ContestError::CompetitionNotFound(competition_id))?;
        if status.is_terminal() {
            return Ok(DeleteOutcome::Closed(status));
        }

        Ok(DeleteOutcome::Deleted(tables.winners.remove(index)))
    }

    async fn set_winner_email(&self, id: Uuid, email: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.winners.iter_mut().find(|w| w.id == id) {
            Some(winner) => {
                winner.email = Some(email.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CompetitionParams, CompetitionWindow};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 12, 0, 0).unwrap()
    }

    fn competition(agent_id: Uuid, key: &str) -> Competition {
        let params = CompetitionParams {
            name: "Quiz".to_string(),
            question: "?".to_string(),
            correct_answer: None,
            announcement: "Join".to_string(),
            cost: dec!(20),
            deposit_units: 2,
            trading_winner_quota: 1,
            deposit_winner_quota: 1,
            prize_per_trading_winner: dec!(10),
            deposit_bonus_percentage: dec!(25),
            window: CompetitionWindow::EndsAt(t0() + Duration::days(1)),
        };
        Competition::from_params(agent_id, &params, key, t0() + Duration::days(1), t0())
    }

    #[tokio::test]
    async fn test_insert_competition_swaps_ledger_atomically() {
        let store = MemoryStore::new();
        let agent = Agent::new("Alpha", Ledger::funded(dec!(100), 5), t0());
        store.insert_agent(&agent).await.unwrap();

        let c = competition(agent.id, "k1");
        let next = agent.ledger.debit(c.charge()).unwrap();
        assert_eq!(
            store.insert_competition(&c, &agent.ledger, &next).await.unwrap(),
            InsertOutcome::Inserted
        );

        // Stale expected ledger: nothing written
        let other = competition(agent.id, "k2");
        assert_eq!(
            store.insert_competition(&other, &agent.ledger, &next).await.unwrap(),
            InsertOutcome::LedgerConflict
        );
        assert!(store.get_competition(other.id).await.unwrap().is_none());

        // Same key: existing row comes back
        let replay = competition(agent.id, "k1");
        match store.insert_competition(&replay, &next, &next).await.unwrap() {
            InsertOutcome::DuplicateKey(existing) => assert_eq!(existing.id, c.id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.get_agent(agent.id).await.unwrap().unwrap().ledger, next);
    }

    #[tokio::test]
    async fn test_record_winner_enforces_quota_and_status() {
        let store = MemoryStore::new();
        let agent_id = Uuid::new_v4();
        let mut c = competition(agent_id, "k");
        c.status = CompetitionStatus::AwaitingWinners;
        store.put_competition(c.clone()).await;

        let winner = |name: &str, track| Winner {
            id: Uuid::new_v4(),
            competition_id: c.id,
            agent_id,
            name: name.to_string(),
            account_ref: None,
            prize_track: track,
            prize_value: dec!(10),
            selected_at: t0(),
            email: None,
        };

        assert_eq!(
            store.record_winner(&winner("a", PrizeTrack::Trading), None).await.unwrap(),
            RecordOutcome::Recorded
        );
        assert_eq!(
            store.record_winner(&winner("b", PrizeTrack::Trading), None).await.unwrap(),
            RecordOutcome::QuotaFull
        );

        let done = Competition {
            status: CompetitionStatus::Completed,
            closed_at: Some(t0()),
            ..c.clone()
        };
        assert_eq!(
            store
                .record_winner(&winner("c", PrizeTrack::Deposit), Some(&done))
                .await
                .unwrap(),
            RecordOutcome::Recorded
        );
        assert_eq!(
            store.record_winner(&winner("d", PrizeTrack::Deposit), None).await.unwrap(),
            RecordOutcome::NotAwaiting(CompetitionStatus::Completed)
        );

        let winners = store.list_winners(c.id).await.unwrap();
        assert_eq!(winners.len(), 2);
        assert!(matches!(
            store.delete_winner(winners[0].id).await.unwrap(),
            DeleteOutcome::Closed(CompetitionStatus::Completed)
        ));
    }

    #[tokio::test]
    async fn test_transition_status_is_conditional() {
        let store = MemoryStore::new();
        let c = competition(Uuid::new_v4(), "k");
        store.put_competition(c.clone()).await;

        let next = Competition {
            status: CompetitionStatus::AwaitingWinners,
            processed_at: Some(t0()),
            ..c.clone()
        };
        assert!(store.transition_status(CompetitionStatus::Sent, &next).await.unwrap());
        assert!(!store.transition_status(CompetitionStatus::Sent, &next).await.unwrap());
    }
}

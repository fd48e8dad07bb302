//! Expiry sweeper
//!
//! Moves `sent` competitions whose window has elapsed to `awaiting_winners`
//! and asks the owning agent to pick winners. The store update is conditional
//! on the `sent` status, so overlapping sweeps advance a record once and only
//! the winning sweep sends the notice. Every advanced competition gets its own
//! notice, even when two notices read the same.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::lifecycle::{self, Effect};
use super::traits::{Announcement, Announcer, ContestStore};
use crate::coordination::{Clock, ScheduledTask};
use crate::domain::{Competition, CompetitionStatus};
use crate::error::{ContestError, Result};

/// Per-tick summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub advanced: usize,
    pub notified: usize,
    pub notify_failed: usize,
    /// Lost races and records already past `sent`
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Notice sent to the agent once a competition stops accepting entries
pub fn winner_selection_notice(correct_answer: Option<&str>) -> String {
    let answer = correct_answer
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or("not specified");
    format!(
        "Dear partners,\n\n\
         The participation period of your latest competition has ended.\n\
         🔹 Correct answer: {}\n\n\
         Please send us the link to the competition post in your channel so \
         the winners can be selected and verified before you announce them.\n\n\
         Best regards,\n\
         Competitions team",
        answer
    )
}

pub struct ExpirySweeper {
    store: Arc<dyn ContestStore>,
    announcer: Arc<dyn Announcer>,
    clock: Arc<dyn Clock>,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn ContestStore>,
        announcer: Arc<dyn Announcer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            announcer,
            clock,
        }
    }

    /// Run one sweep
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired = self.store.list_expired(now).await?;

        let mut report = SweepReport {
            examined: expired.len(),
            ..Default::default()
        };
        if expired.is_empty() {
            return Ok(report);
        }
        info!("Found {} expired competitions to process", expired.len());

        for competition in expired {
            if let Err(e) = self.process(&competition, &mut report).await {
                warn!("Failed to advance competition {}: {}", competition.id, e);
                report.errors.push(format!("{}: {}", competition.id, e));
            }
        }

        info!(
            "Sweep done: advanced={} notified={} notify_failed={} skipped={} errors={}",
            report.advanced,
            report.notified,
            report.notify_failed,
            report.skipped,
            report.errors.len()
        );
        Ok(report)
    }

    async fn process(&self, competition: &Competition, report: &mut SweepReport) -> Result<()> {
        let transition = match lifecycle::expire(competition, self.clock.now()) {
            Ok(t) => t,
            Err(ContestError::AlreadyInState { .. }) => {
                report.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !self
            .store
            .transition_status(CompetitionStatus::Sent, &transition.competition)
            .await?
        {
            debug!("Competition {} advanced by another sweep", competition.id);
            report.skipped += 1;
            return Ok(());
        }
        report.advanced += 1;
        info!(
            "Competition {} {} -> {}: {}",
            competition.id, transition.record.from, transition.record.to, transition.record.reason
        );

        for effect in &transition.effects {
            if let Effect::NotifyWinnerSelection {
                agent_id,
                competition_id,
                correct_answer,
            } = effect
            {
                self.notify(*agent_id, *competition_id, correct_answer.as_deref(), report)
                    .await;
            }
        }
        Ok(())
    }

    /// Best effort; failures never undo the transition
    async fn notify(
        &self,
        agent_id: Uuid,
        competition_id: Uuid,
        correct_answer: Option<&str>,
        report: &mut SweepReport,
    ) {
        let destination = match self.store.get_agent(agent_id).await {
            Ok(Some(agent)) => agent.destination,
            Ok(None) => None,
            Err(e) => {
                warn!("Could not load agent {} for notice: {}", agent_id, e);
                report.notify_failed += 1;
                return;
            }
        };
        let Some(destination) = destination else {
            debug!("Agent {} has no destination, skipping notice", agent_id);
            return;
        };

        let notice = Announcement::text(winner_selection_notice(correct_answer));
        match self.announcer.announce(&destination, &notice).await {
            Ok(_) => {
                info!("Sent winner selection request for competition {}", competition_id);
                report.notified += 1;
            }
            Err(e) => {
                warn!(
                    "Failed to send winner selection request for competition {}: {}",
                    competition_id, e
                );
                report.notify_failed += 1;
            }
        }
    }
}

#[async_trait]
impl ScheduledTask for ExpirySweeper {
    fn name(&self) -> &str {
        "expiry-sweep"
    }

    async fn run(&self) -> Result<()> {
        self.sweep().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::coordination::ManualClock;
    use crate::domain::{Agent, CompetitionParams, CompetitionWindow};
    use crate::engine::ledger::Ledger;
    use crate::engine::traits::{MessageId, MockAnnouncer};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 8, 0, 0).unwrap()
    }

    fn params(ends_at: DateTime<Utc>, answer: Option<&str>) -> CompetitionParams {
        CompetitionParams {
            name: "Spring quiz".to_string(),
            question: "Which index rallied?".to_string(),
            correct_answer: answer.map(str::to_string),
            announcement: "Go!".to_string(),
            cost: dec!(10),
            deposit_units: 0,
            trading_winner_quota: 1,
            deposit_winner_quota: 0,
            prize_per_trading_winner: dec!(15),
            deposit_bonus_percentage: dec!(0),
            window: CompetitionWindow::EndsAt(ends_at),
        }
    }

    async fn seed(
        store: &MemoryStore,
        agent: &Agent,
        key: &str,
        ends_at: DateTime<Utc>,
        answer: Option<&str>,
    ) -> Competition {
        let c = Competition::from_params(agent.id, &params(ends_at, answer), key, ends_at, t0());
        store.put_competition(c.clone()).await;
        c
    }

    #[test]
    fn test_notice_mentions_answer() {
        assert!(winner_selection_notice(Some("Gold")).contains("Correct answer: Gold"));
        assert!(winner_selection_notice(None).contains("Correct answer: not specified"));
        assert!(winner_selection_notice(Some("  ")).contains("not specified"));
    }

    #[tokio::test]
    async fn test_sweep_advances_only_expired() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let agent = Agent::new("Delta", Ledger::funded(dec!(100), 0), t0())
            .with_destination("-1001", None);
        store.insert_agent(&agent).await.unwrap();

        let past = seed(&store, &agent, "a", t0() - Duration::minutes(1), Some("42")).await;
        let future = seed(&store, &agent, "b", t0() + Duration::hours(1), None).await;

        let mut announcer = MockAnnouncer::new();
        announcer
            .expect_announce()
            .withf(|dest, msg| dest.to_string() == "-1001" && msg.text.contains("Correct answer: 42"))
            .times(1)
            .returning(|_, _| Ok(MessageId(1)));

        let sweeper = ExpirySweeper::new(store.clone(), Arc::new(announcer), clock.clone());

        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.advanced, 1);
        assert_eq!(report.notified, 1);

        let past = store.get_competition(past.id).await.unwrap().unwrap();
        assert_eq!(past.status, CompetitionStatus::AwaitingWinners);
        assert_eq!(past.processed_at, Some(t0()));
        let future = store.get_competition(future.id).await.unwrap().unwrap();
        assert_eq!(future.status, CompetitionStatus::Sent);
        assert_eq!(future.processed_at, None);
    }

    #[tokio::test]
    async fn test_notify_failure_keeps_transition() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let agent = Agent::new("Echo", Ledger::funded(dec!(100), 0), t0())
            .with_destination("-2002", None);
        store.insert_agent(&agent).await.unwrap();
        let c = seed(&store, &agent, "k", t0(), None).await;

        let mut announcer = MockAnnouncer::new();
        announcer
            .expect_announce()
            .returning(|_, _| Err(ContestError::AnnounceFailed("chat not found".to_string())));

        let sweeper = ExpirySweeper::new(store.clone(), Arc::new(announcer), clock);

        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(report.notify_failed, 1);
        assert_eq!(
            store.get_competition(c.id).await.unwrap().unwrap().status,
            CompetitionStatus::AwaitingWinners
        );
    }

    #[tokio::test]
    async fn test_agent_without_destination_is_advanced_silently() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let agent = Agent::new("Quiet", Ledger::funded(dec!(100), 0), t0());
        store.insert_agent(&agent).await.unwrap();
        seed(&store, &agent, "k", t0() - Duration::days(1), None).await;

        let mut announcer = MockAnnouncer::new();
        announcer.expect_announce().never();

        let sweeper = ExpirySweeper::new(store.clone(), Arc::new(announcer), clock);

        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(report.notified, 0);
        assert_eq!(report.notify_failed, 0);
    }

    #[tokio::test]
    async fn test_identical_notices_are_each_sent() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let agent = Agent::new("Golf", Ledger::funded(dec!(100), 0), t0())
            .with_destination("-4004", None);
        store.insert_agent(&agent).await.unwrap();

        seed(&store, &agent, "first", t0() - Duration::minutes(5), None).await;
        seed(&store, &agent, "second", t0() - Duration::minutes(3), None).await;

        let mut announcer = MockAnnouncer::new();
        announcer
            .expect_announce()
            .withf(|dest, msg| dest.to_string() == "-4004" && msg.text.contains("not specified"))
            .times(2)
            .returning(|_, _| Ok(MessageId(9)));

        let sweeper = ExpirySweeper::new(store.clone(), Arc::new(announcer), clock);

        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.advanced, 2);
        assert_eq!(report.notified, 2);
        assert_eq!(report.notify_failed, 0);
    }

    #[tokio::test]
    async fn test_repeated_sweeps_advance_once() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let agent = Agent::new("Foxtrot", Ledger::funded(dec!(100), 0), t0())
            .with_destination("-3003", None);
        store.insert_agent(&agent).await.unwrap();

        let expired = seed(&store, &agent, "old", t0() - Duration::hours(2), None).await;
        let pending = seed(&store, &agent, "new", t0() + Duration::days(30), None).await;

        let mut announcer = MockAnnouncer::new();
        announcer
            .expect_announce()
            .times(1)
            .returning(|_, _| Ok(MessageId(5)));

        let sweeper = ExpirySweeper::new(store.clone(), Arc::new(announcer), clock.clone());

        let mut advanced = 0;
        for _ in 0..1000 {
            advanced += sweeper.sweep().await.unwrap().advanced;
            clock.advance(Duration::seconds(1));
        }
        assert_eq!(advanced, 1);

        let expired = store.get_competition(expired.id).await.unwrap().unwrap();
        assert_eq!(expired.status, CompetitionStatus::AwaitingWinners);
        assert_eq!(expired.processed_at, Some(t0()));
        let pending = store.get_competition(pending.id).await.unwrap().unwrap();
        assert_eq!(pending.status, CompetitionStatus::Sent);
    }
}

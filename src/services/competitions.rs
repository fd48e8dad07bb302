//! Operator-facing competition operations
//!
//! Wires the ledger, idempotency guard, state machine and allocator to a
//! store and an announcer:
//! - creation with idempotent replay, ledger debit and announcement rollback
//! - single and batch winner picks serialized per competition
//! - close, archive, undo and contact enrichment
//! - on-demand sweep and renewal runs

use chrono::Duration;
use chrono_tz::Tz;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::coordination::Clock;
use crate::domain::{Competition, CompetitionParams, CompetitionStatus, Winner};
use crate::engine::allocator::{AllocationRound, CandidatePool, PickOptions, QuotaTally};
use crate::engine::calendar;
use crate::engine::idempotency::{self, AnnouncementDedup, Delivery, IdempotencyResult};
use crate::engine::lifecycle;
use crate::engine::renewal::{RenewalJob, RenewalReport};
use crate::engine::sweeper::{ExpirySweeper, SweepReport};
use crate::engine::traits::{
    Announcement, Announcer, ContestStore, DeleteOutcome, InsertOutcome, RecordOutcome,
};
use crate::error::{ContestError, Result};

/// Random source for winner draws
pub trait DrawRng: RngCore + CryptoRng + Send {}

impl<T: RngCore + CryptoRng + Send> DrawRng for T {}

/// Engine knobs resolved from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub timezone: Tz,
    pub announce_dedup_ttl: Duration,
    pub exclude_previous_winners: bool,
    pub max_ledger_retries: u32,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            timezone: config.timezone().map_err(ContestError::Validation)?,
            announce_dedup_ttl: Duration::seconds(config.announce_dedup_ttl_secs as i64),
            exclude_previous_winners: config.exclude_previous_winners,
            max_ledger_retries: config.max_ledger_retries.max(1),
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Africa::Cairo,
            announce_dedup_ttl: Duration::seconds(10),
            exclude_previous_winners: true,
            max_ledger_retries: 5,
        }
    }
}

/// Creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub params: CompetitionParams,
    /// Caller token; blank means "derive from the parameters"
    pub idempotency_key: Option<String>,
    /// Photo posted with the announcement
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Competition),
    /// Replay of an earlier request with the same key; nothing was debited
    Duplicate(Competition),
}

impl CreateOutcome {
    pub fn competition(&self) -> &Competition {
        match self {
            CreateOutcome::Created(c) | CreateOutcome::Duplicate(c) => c,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreateOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateReport {
    pub outcome: CreateOutcome,
    /// Non-fatal findings such as a channel title mismatch
    pub warnings: Vec<String>,
    /// `None` for replays
    pub delivery: Option<Delivery>,
}

/// One accepted pick
#[derive(Debug, Clone, PartialEq)]
pub struct Pick {
    pub winner: Winner,
    /// Size of the eligible subset drawn from
    pub eligible: usize,
    /// This pick filled the last slot and completed the competition
    pub completed: bool,
}

/// Why a batch stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStop {
    NoCandidates,
    QuotaExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub winners: Vec<Winner>,
    pub requested: usize,
    pub stopped: Option<BatchStop>,
}

impl BatchOutcome {
    pub fn is_partial(&self) -> bool {
        self.winners.len() < self.requested
    }
}

/// Held while one competition is mutated. The map entry goes away with the
/// last holder, so the lock map only tracks competitions in use.
struct CompetitionLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    competition_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CompetitionLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.competition_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct CompetitionService {
    store: Arc<dyn ContestStore>,
    announcer: Arc<dyn Announcer>,
    dedup: Arc<AnnouncementDedup>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    sweeper: Arc<ExpirySweeper>,
    renewal: Arc<RenewalJob>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    rng: StdMutex<Box<dyn DrawRng>>,
}

impl CompetitionService {
    pub fn new(
        store: Arc<dyn ContestStore>,
        announcer: Arc<dyn Announcer>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let dedup = Arc::new(AnnouncementDedup::new(
            settings.announce_dedup_ttl,
            clock.clone(),
        ));
        let sweeper = Arc::new(ExpirySweeper::new(
            store.clone(),
            announcer.clone(),
            clock.clone(),
        ));
        let renewal = Arc::new(RenewalJob::new(
            store.clone(),
            clock.clone(),
            settings.timezone,
            settings.max_ledger_retries,
        ));

        Self {
            store,
            announcer,
            dedup,
            clock,
            settings,
            sweeper,
            renewal,
            locks: DashMap::new(),
            rng: StdMutex::new(Box::new(OsRng)),
        }
    }

    /// Replace the draw RNG (seeded generators in tests)
    pub fn with_rng(self, rng: impl DrawRng + 'static) -> Self {
        Self {
            rng: StdMutex::new(Box::new(rng)),
            ..self
        }
    }

    pub fn dedup(&self) -> Arc<AnnouncementDedup> {
        self.dedup.clone()
    }

    pub fn sweeper(&self) -> Arc<ExpirySweeper> {
        self.sweeper.clone()
    }

    pub fn renewal_job(&self) -> Arc<RenewalJob> {
        self.renewal.clone()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Serialize mutations of one competition
    async fn lock(&self, competition_id: Uuid) -> CompetitionLock<'_> {
        let mutex = self.locks.entry(competition_id).or_default().clone();
        let guard = mutex.lock_owned().await;
        CompetitionLock {
            locks: &self.locks,
            competition_id,
            guard: Some(guard),
        }
    }

    async fn load_competition(&self, id: Uuid) -> Result<Competition> {
        self.store
            .get_competition(id)
            .await?
            .ok_or(ContestError::CompetitionNotFound(id))
    }

    // ==================== Creation ====================

    /// Create a competition, debit the agent and announce it.
    ///
    /// A repeated key returns the original competition untouched. A failed
    /// announcement removes the competition and credits the ledger back.
    #[instrument(skip(self, request))]
    pub async fn create_competition(&self, agent_id: Uuid, request: CreateRequest) -> Result<CreateReport> {
        let params = request.params;
        params
            .validate()
            .map_err(|errors| ContestError::Validation(errors.join("; ")))?;

        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(ContestError::AgentNotFound(agent_id))?;
        let key = idempotency::generate_key(request.idempotency_key.as_deref(), &params);

        if let IdempotencyResult::Duplicate(existing) =
            idempotency::check_existing(self.store.as_ref(), agent_id, &key).await?
        {
            return Ok(CreateReport {
                outcome: CreateOutcome::Duplicate(existing),
                warnings: Vec::new(),
                delivery: None,
            });
        }

        let destination = agent
            .destination
            .clone()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| {
                ContestError::Validation(format!("agent {} has no announcement destination", agent_id))
            })?;

        let now = self.clock.now();
        let ends_at = calendar::ends_at(params.window, now, self.settings.timezone)?;
        if ends_at <= now {
            return Err(ContestError::Validation(format!(
                "competition would end at {} which is not in the future",
                ends_at
            )));
        }

        let mut warnings = Vec::new();
        match self.announcer.channel_info(&destination).await {
            Ok(info) => {
                if let Some(on_file) = agent.channel_title.as_deref() {
                    if on_file.trim() != info.title.trim() {
                        warn!(
                            "Channel title mismatch for agent {}: on file {:?}, live {:?}",
                            agent_id, on_file, info.title
                        );
                        warnings.push(format!(
                            "channel title on file {:?} differs from live title {:?}",
                            on_file, info.title
                        ));
                    }
                }
            }
            Err(e) => {
                warn!("Could not verify channel of agent {}: {}", agent_id, e);
                warnings.push(format!("channel lookup failed: {}", e));
            }
        }

        let competition = Competition::from_params(agent_id, &params, key, ends_at, now);
        if let Some(existing) = self.insert_with_debit(&competition).await? {
            return Ok(CreateReport {
                outcome: CreateOutcome::Duplicate(existing),
                warnings,
                delivery: None,
            });
        }

        let mut announcement = Announcement::text(params.announcement.clone());
        if let Some(url) = request.image_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            announcement = announcement.with_attachment(url);
        }
        let delivery = match self
            .dedup
            .announce_once(self.announcer.as_ref(), &destination, &announcement)
            .await
        {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(
                    "Announcement of competition {} failed, rolling back: {}",
                    competition.id, e
                );
                if let Err(rollback) = self.remove_with_credit(&competition).await {
                    error!(
                        "Rollback of competition {} failed: {}",
                        competition.id, rollback
                    );
                    return Err(ContestError::Internal(format!(
                        "announcement failed ({}) and rollback failed ({})",
                        e, rollback
                    )));
                }
                return Err(match e {
                    ContestError::AnnounceFailed(_) => e,
                    other => ContestError::AnnounceFailed(other.to_string()),
                });
            }
        };
        if delivery == Delivery::SkippedDuplicate {
            debug!("Identical announcement already sent to {}", destination);
        }

        info!(
            "Competition {} created for agent {}, ends at {}",
            competition.id, agent_id, competition.ends_at
        );
        Ok(CreateReport {
            outcome: CreateOutcome::Created(competition),
            warnings,
            delivery: Some(delivery),
        })
    }

    /// Insert and debit in one store operation. `Some` on a key collision.
    async fn insert_with_debit(&self, competition: &Competition) -> Result<Option<Competition>> {
        for attempt in 1..=self.settings.max_ledger_retries {
            let agent = self
                .store
                .get_agent(competition.agent_id)
                .await?
                .ok_or(ContestError::AgentNotFound(competition.agent_id))?;
            let next = match agent.ledger.debit(competition.charge()) {
                Ok(next) => next,
                Err(e) => {
                    // A concurrent request with the same key may have taken the funds
                    if let Some(existing) = self
                        .store
                        .find_competition_by_key(competition.agent_id, &competition.idempotency_key)
                        .await?
                    {
                        return Ok(Some(existing));
                    }
                    return Err(e.into());
                }
            };

            match self
                .store
                .insert_competition(competition, &agent.ledger, &next)
                .await?
            {
                InsertOutcome::Inserted => return Ok(None),
                InsertOutcome::DuplicateKey(existing) => return Ok(Some(existing)),
                InsertOutcome::LedgerConflict => {
                    debug!(
                        "Ledger of agent {} changed during creation (attempt {})",
                        competition.agent_id, attempt
                    );
                }
            }
        }

        Err(ContestError::Conflict(format!(
            "ledger of agent {} kept changing during creation",
            competition.agent_id
        )))
    }

    async fn remove_with_credit(&self, competition: &Competition) -> Result<()> {
        for _ in 0..self.settings.max_ledger_retries {
            let agent = self
                .store
                .get_agent(competition.agent_id)
                .await?
                .ok_or(ContestError::AgentNotFound(competition.agent_id))?;
            let next = agent.ledger.credit(competition.charge())?;

            if self
                .store
                .remove_competition(competition, &agent.ledger, &next)
                .await?
            {
                return Ok(());
            }
        }

        Err(ContestError::Conflict(format!(
            "could not roll back competition {}",
            competition.id
        )))
    }

    // ==================== Winners ====================

    fn pick_options(&self) -> PickOptions {
        PickOptions {
            exclude_previous_winners: self.settings.exclude_previous_winners,
        }
    }

    /// Draw one winner from `pool`
    #[instrument(skip(self, pool), fields(pool = pool.len()))]
    pub async fn pick_winner(&self, competition_id: Uuid, pool: &CandidatePool) -> Result<Pick> {
        let _lock = self.lock(competition_id).await;
        self.pick_locked(competition_id, pool, self.pick_options()).await
    }

    /// Draw up to `count` winners in sequence, stopping early when the pool
    /// or the quotas run out
    #[instrument(skip(self, pool), fields(pool = pool.len()))]
    pub async fn pick_winners(
        &self,
        competition_id: Uuid,
        pool: &CandidatePool,
        count: usize,
    ) -> Result<BatchOutcome> {
        let _lock = self.lock(competition_id).await;

        let mut outcome = BatchOutcome {
            winners: Vec::with_capacity(count),
            requested: count,
            stopped: None,
        };
        for _ in 0..count {
            match self.pick_locked(competition_id, pool, self.pick_options()).await {
                Ok(pick) => outcome.winners.push(pick.winner),
                Err(ContestError::NoCandidates) => {
                    outcome.stopped = Some(BatchStop::NoCandidates);
                    break;
                }
                Err(ContestError::QuotaExhausted) => {
                    outcome.stopped = Some(BatchStop::QuotaExhausted);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if outcome.is_partial() {
            info!(
                "Batch pick for {} stopped after {}/{} winners: {:?}",
                competition_id,
                outcome.winners.len(),
                count,
                outcome.stopped
            );
        }
        Ok(outcome)
    }

    fn gate_error(competition: &Competition, tally: &QuotaTally) -> ContestError {
        match competition.status {
            CompetitionStatus::Sent => ContestError::NotAwaitingWinners {
                id: competition.id,
                status: competition.status,
            },
            CompetitionStatus::Completed if tally.is_exhausted() => ContestError::QuotaExhausted,
            _ => ContestError::CompetitionClosed {
                id: competition.id,
                status: competition.status,
            },
        }
    }

    async fn pick_locked(
        &self,
        competition_id: Uuid,
        pool: &CandidatePool,
        options: PickOptions,
    ) -> Result<Pick> {
        let competition = self.load_competition(competition_id).await?;
        let winners = self.store.list_winners(competition_id).await?;

        if competition.status != CompetitionStatus::AwaitingWinners {
            let tally = QuotaTally::from_winners(&competition, &winners);
            return Err(Self::gate_error(&competition, &tally));
        }

        let mut round = AllocationRound::new(&competition, &winners, pool, options);
        let draw = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            round.draw(&mut *rng)?
        };

        let now = self.clock.now();
        let winner = Winner {
            id: Uuid::new_v4(),
            competition_id,
            agent_id: competition.agent_id,
            name: draw.candidate.name.clone(),
            account_ref: draw.candidate.account_ref.clone(),
            prize_track: draw.track,
            prize_value: draw.prize_value,
            selected_at: now,
            email: None,
        };
        let completion = if draw.completes {
            Some(lifecycle::complete(&competition, round.tally(), false, now)?)
        } else {
            None
        };

        match self
            .store
            .record_winner(&winner, completion.as_ref().map(|t| &t.competition))
            .await?
        {
            RecordOutcome::Recorded => {}
            RecordOutcome::QuotaFull => return Err(ContestError::QuotaExhausted),
            RecordOutcome::NotAwaiting(status) => {
                let current = Competition {
                    status,
                    ..competition
                };
                let tally = QuotaTally::from_winners(&current, &winners);
                return Err(Self::gate_error(&current, &tally));
            }
        }

        info!(
            "Picked {} winner {} for competition {} from {} eligible",
            winner.prize_track, winner.name, competition_id, draw.eligible
        );
        if let Some(t) = &completion {
            info!(
                "Competition {} {} -> {}: {}",
                competition_id, t.record.from, t.record.to, t.record.reason
            );
        }

        Ok(Pick {
            winner,
            eligible: draw.eligible,
            completed: completion.is_some(),
        })
    }

    /// Remove a winner so the candidate can be drawn again
    #[instrument(skip(self))]
    pub async fn undo_winner(&self, winner_id: Uuid) -> Result<Winner> {
        let winner = self
            .store
            .get_winner(winner_id)
            .await?
            .ok_or(ContestError::WinnerNotFound(winner_id))?;

        let _lock = self.lock(winner.competition_id).await;

        match self.store.delete_winner(winner_id).await? {
            DeleteOutcome::Deleted(removed) => {
                info!(
                    "Undid {} winner {} of competition {}",
                    removed.prize_track, removed.name, removed.competition_id
                );
                Ok(removed)
            }
            DeleteOutcome::NotFound => Err(ContestError::WinnerNotFound(winner_id)),
            DeleteOutcome::Closed(status) => Err(ContestError::CompetitionClosed {
                id: winner.competition_id,
                status,
            }),
        }
    }

    /// Attach a contact email to a winner; allowed in any state
    pub async fn enrich_winner(&self, winner_id: Uuid, email: &str) -> Result<Winner> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ContestError::Validation(format!("invalid email: {:?}", email)));
        }
        if !self.store.set_winner_email(winner_id, email).await? {
            return Err(ContestError::WinnerNotFound(winner_id));
        }
        self.store
            .get_winner(winner_id)
            .await?
            .ok_or(ContestError::WinnerNotFound(winner_id))
    }

    pub async fn winners(&self, competition_id: Uuid) -> Result<Vec<Winner>> {
        self.store.list_winners(competition_id).await
    }

    // ==================== Administrative transitions ====================

    /// Complete an `awaiting_winners` competition. Without `force` every
    /// quota must already be filled.
    #[instrument(skip(self))]
    pub async fn close_competition(&self, competition_id: Uuid, force: bool) -> Result<Competition> {
        let _lock = self.lock(competition_id).await;

        let competition = self.load_competition(competition_id).await?;
        let winners = self.store.list_winners(competition_id).await?;
        let tally = QuotaTally::from_winners(&competition, &winners);

        let transition = lifecycle::complete(&competition, &tally, force, self.clock.now())?;
        self.apply(&competition, transition).await
    }

    /// Archive a `sent` or `awaiting_winners` competition
    #[instrument(skip(self))]
    pub async fn archive_competition(&self, competition_id: Uuid) -> Result<Competition> {
        let _lock = self.lock(competition_id).await;

        let competition = self.load_competition(competition_id).await?;
        let transition = lifecycle::archive(&competition, self.clock.now())?;
        self.apply(&competition, transition).await
    }

    async fn apply(&self, before: &Competition, transition: lifecycle::Transition) -> Result<Competition> {
        if !self
            .store
            .transition_status(before.status, &transition.competition)
            .await?
        {
            let current = self.load_competition(before.id).await?;
            return Err(ContestError::AlreadyInState {
                id: current.id,
                status: current.status,
            });
        }

        info!(
            "Competition {} {} -> {}: {}",
            before.id, transition.record.from, transition.record.to, transition.record.reason
        );
        Ok(transition.competition)
    }

    // ==================== Periodic jobs on demand ====================

    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        self.sweeper.sweep().await
    }

    pub async fn trigger_renewal(&self, agent_id: Option<Uuid>) -> Result<RenewalReport> {
        self.renewal.trigger(agent_id).await
    }
}

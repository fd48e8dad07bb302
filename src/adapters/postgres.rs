use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Agent, Competition, CompetitionStatus, PrizeTrack, RenewalCadence, Winner};
use crate::engine::ledger::Ledger;
use crate::engine::traits::{ContestStore, DeleteOutcome, InsertOutcome, RecordOutcome};
use crate::error::{ContestError, Result};

const AGENT_COLUMNS: &str = r#"
    id, name, destination, channel_title,
    balance_available, balance_consumed, deposit_quota_available, deposit_quota_used,
    renewal_cadence, last_renewal_at, created_at
"#;

const COMPETITION_COLUMNS: &str = r#"
    id, agent_id, name, question, correct_answer, status, cost, deposit_units, ends_at,
    trading_winner_quota, deposit_winner_quota, prize_per_trading_winner,
    deposit_bonus_percentage, idempotency_key, created_at, processed_at, closed_at
"#;

const WINNER_COLUMNS: &str = r#"
    id, competition_id, agent_id, name, account_ref, prize_track, prize_value,
    selected_at, email
"#;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ==================== Row mapping ====================

fn to_i32(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| ContestError::Validation(format!("{} out of range: {}", field, value)))
}

fn to_u32(value: i32, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| ContestError::Internal(format!("negative {} in store: {}", field, value)))
}

fn parse_status(raw: &str) -> Result<CompetitionStatus> {
    CompetitionStatus::try_from(raw).map_err(ContestError::Internal)
}

fn agent_from_row(row: &PgRow) -> Result<Agent> {
    let cadence: String = row.get("renewal_cadence");
    Ok(Agent {
        id: row.get("id"),
        name: row.get("name"),
        destination: row.get("destination"),
        channel_title: row.get("channel_title"),
        ledger: Ledger {
            balance_available: row.get("balance_available"),
            balance_consumed: row.get("balance_consumed"),
            deposit_quota_available: to_u32(row.get("deposit_quota_available"), "deposit_quota_available")?,
            deposit_quota_used: to_u32(row.get("deposit_quota_used"), "deposit_quota_used")?,
        },
        renewal_cadence: RenewalCadence::try_from(cadence.as_str()).map_err(ContestError::Internal)?,
        last_renewal_at: row.get("last_renewal_at"),
        created_at: row.get("created_at"),
    })
}

fn competition_from_row(row: &PgRow) -> Result<Competition> {
    let status: String = row.get("status");
    Ok(Competition {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        name: row.get("name"),
        question: row.get("question"),
        correct_answer: row.get("correct_answer"),
        status: parse_status(&status)?,
        cost: row.get("cost"),
        deposit_units: to_u32(row.get("deposit_units"), "deposit_units")?,
        ends_at: row.get("ends_at"),
        trading_winner_quota: to_u32(row.get("trading_winner_quota"), "trading_winner_quota")?,
        deposit_winner_quota: to_u32(row.get("deposit_winner_quota"), "deposit_winner_quota")?,
        prize_per_trading_winner: row.get("prize_per_trading_winner"),
        deposit_bonus_percentage: row.get("deposit_bonus_percentage"),
        idempotency_key: row.get("idempotency_key"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
        closed_at: row.get("closed_at"),
    })
}

fn winner_from_row(row: &PgRow) -> Result<Winner> {
    let track: String = row.get("prize_track");
    Ok(Winner {
        id: row.get("id"),
        competition_id: row.get("competition_id"),
        agent_id: row.get("agent_id"),
        name: row.get("name"),
        account_ref: row.get("account_ref"),
        prize_track: PrizeTrack::try_from(track.as_str()).map_err(ContestError::Internal)?,
        prize_value: row.get("prize_value"),
        selected_at: row.get("selected_at"),
        email: row.get("email"),
    })
}

/// Ledger CAS shared by creation, rollback and renewal
async fn swap_ledger_in<'e, E>(
    executor: E,
    agent_id: Uuid,
    expected: &Ledger,
    next: &Ledger,
    renewed_at: Option<DateTime<Utc>>,
) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE agents SET
            balance_available = $2,
            balance_consumed = $3,
            deposit_quota_available = $4,
            deposit_quota_used = $5,
            last_renewal_at = COALESCE($6, last_renewal_at)
        WHERE id = $1
          AND balance_available = $7
          AND balance_consumed = $8
          AND deposit_quota_available = $9
          AND deposit_quota_used = $10
        "#,
    )
    .bind(agent_id)
    .bind(next.balance_available)
    .bind(next.balance_consumed)
    .bind(to_i32(next.deposit_quota_available, "deposit_quota_available")?)
    .bind(to_i32(next.deposit_quota_used, "deposit_quota_used")?)
    .bind(renewed_at)
    .bind(expected.balance_available)
    .bind(expected.balance_consumed)
    .bind(to_i32(expected.deposit_quota_available, "deposit_quota_available")?)
    .bind(to_i32(expected.deposit_quota_used, "deposit_quota_used")?)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl ContestStore for PostgresStore {
    // ==================== Agents ====================

    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (
                id, name, destination, channel_title,
                balance_available, balance_consumed, deposit_quota_available, deposit_quota_used,
                renewal_cadence, last_renewal_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.destination)
        .bind(&agent.channel_title)
        .bind(agent.ledger.balance_available)
        .bind(agent.ledger.balance_consumed)
        .bind(to_i32(agent.ledger.deposit_quota_available, "deposit_quota_available")?)
        .bind(to_i32(agent.ledger.deposit_quota_used, "deposit_quota_used")?)
        .bind(agent.renewal_cadence.as_str())
        .bind(agent.last_renewal_at)
        .bind(agent.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Inserted agent {}", agent.id);
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!("SELECT {} FROM agents WHERE id = $1", AGENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(agent_from_row).transpose()
    }

    async fn list_renewable_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agents WHERE renewal_cadence <> 'none' ORDER BY created_at",
            AGENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(agent_from_row).collect()
    }

    #[instrument(skip(self, expected, next))]
    async fn swap_ledger(
        &self,
        agent_id: Uuid,
        expected: &Ledger,
        next: &Ledger,
        renewed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        swap_ledger_in(&self.pool, agent_id, expected, next, renewed_at).await
    }

    // ==================== Competitions ====================

    async fn get_competition(&self, id: Uuid) -> Result<Option<Competition>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM competitions WHERE id = $1",
            COMPETITION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(competition_from_row).transpose()
    }

    async fn find_competition_by_key(
        &self,
        agent_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Competition>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM competitions WHERE agent_id = $1 AND idempotency_key = $2",
            COMPETITION_COLUMNS
        ))
        .bind(agent_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(competition_from_row).transpose()
    }

    #[instrument(skip(self, competition, expected, next), fields(competition_id = %competition.id))]
    async fn insert_competition(
        &self,
        competition: &Competition,
        expected: &Ledger,
        next: &Ledger,
    ) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO competitions (
                id, agent_id, name, question, correct_answer, status, cost, deposit_units,
                ends_at, trading_winner_quota, deposit_winner_quota, prize_per_trading_winner,
                deposit_bonus_percentage, idempotency_key, created_at, processed_at, closed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (agent_id, idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(competition.id)
        .bind(competition.agent_id)
        .bind(&competition.name)
        .bind(&competition.question)
        .bind(&competition.correct_answer)
        .bind(competition.status.as_str())
        .bind(competition.cost)
        .bind(to_i32(competition.deposit_units, "deposit_units")?)
        .bind(competition.ends_at)
        .bind(to_i32(competition.trading_winner_quota, "trading_winner_quota")?)
        .bind(to_i32(competition.deposit_winner_quota, "deposit_winner_quota")?)
        .bind(competition.prize_per_trading_winner)
        .bind(competition.deposit_bonus_percentage)
        .bind(&competition.idempotency_key)
        .bind(competition.created_at)
        .bind(competition.processed_at)
        .bind(competition.closed_at)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            let existing = self
                .find_competition_by_key(competition.agent_id, &competition.idempotency_key)
                .await?
                .ok_or_else(|| {
                    ContestError::Internal(format!(
                        "idempotency key {} conflicted but no row found",
                        competition.idempotency_key
                    ))
                })?;
            warn!(
                "Idempotency key {} already used by competition {}",
                competition.idempotency_key, existing.id
            );
            return Ok(InsertOutcome::DuplicateKey(existing));
        }

        if !swap_ledger_in(&mut *tx, competition.agent_id, expected, next, None).await? {
            tx.rollback().await?;
            debug!("Ledger of agent {} moved, creation retried", competition.agent_id);
            return Ok(InsertOutcome::LedgerConflict);
        }

        tx.commit().await?;
        info!(
            "Created competition {} for agent {} (cost {}, deposit units {})",
            competition.id, competition.agent_id, competition.cost, competition.deposit_units
        );
        Ok(InsertOutcome::Inserted)
    }

    #[instrument(skip(self, competition, expected, next), fields(competition_id = %competition.id))]
    async fn remove_competition(
        &self,
        competition: &Competition,
        expected: &Ledger,
        next: &Ledger,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM competitions WHERE id = $1 AND status = 'sent'")
            .bind(competition.id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        if !swap_ledger_in(&mut *tx, competition.agent_id, expected, next, None).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        info!("Rolled back competition {}", competition.id);
        Ok(true)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Competition>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM competitions WHERE status = 'sent' AND ends_at <= $1 ORDER BY ends_at",
            COMPETITION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(competition_from_row).collect()
    }

    #[instrument(skip(self, next), fields(competition_id = %next.id))]
    async fn transition_status(&self, from: CompetitionStatus, next: &Competition) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE competitions
            SET status = $2, processed_at = $3, closed_at = $4
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(next.id)
        .bind(next.status.as_str())
        .bind(next.processed_at)
        .bind(next.closed_at)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== Winners ====================

    async fn list_winners(&self, competition_id: Uuid) -> Result<Vec<Winner>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM winners WHERE competition_id = $1 ORDER BY selected_at, id",
            WINNER_COLUMNS
        ))
        .bind(competition_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(winner_from_row).collect()
    }

    async fn get_winner(&self, id: Uuid) -> Result<Option<Winner>> {
        let row = sqlx::query(&format!("SELECT {} FROM winners WHERE id = $1", WINNER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(winner_from_row).transpose()
    }

    #[instrument(skip(self, winner, complete), fields(competition_id = %winner.competition_id))]
    async fn record_winner(
        &self,
        winner: &Winner,
        complete: Option<&Competition>,
    ) -> Result<RecordOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT status, trading_winner_quota, deposit_winner_quota
            FROM competitions WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(winner.competition_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ContestError::CompetitionNotFound(winner.competition_id))?;

        let status = parse_status(row.get::<String, _>("status").as_str())?;
        if status != CompetitionStatus::AwaitingWinners {
            tx.rollback().await?;
            return Ok(RecordOutcome::NotAwaiting(status));
        }

        let quota: i32 = match winner.prize_track {
            PrizeTrack::Trading => row.get("trading_winner_quota"),
            PrizeTrack::Deposit => row.get("deposit_winner_quota"),
        };
        let taken: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM winners WHERE competition_id = $1 AND prize_track = $2",
        )
        .bind(winner.competition_id)
        .bind(winner.prize_track.as_str())
        .fetch_one(&mut *tx)
        .await?;
        if taken >= i64::from(quota) {
            tx.rollback().await?;
            return Ok(RecordOutcome::QuotaFull);
        }

        sqlx::query(
            r#"
            INSERT INTO winners (
                id, competition_id, agent_id, name, account_ref, prize_track, prize_value,
                selected_at, email
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(winner.id)
        .bind(winner.competition_id)
        .bind(winner.agent_id)
        .bind(&winner.name)
        .bind(&winner.account_ref)
        .bind(winner.prize_track.as_str())
        .bind(winner.prize_value)
        .bind(winner.selected_at)
        .bind(&winner.email)
        .execute(&mut *tx)
        .await?;

        if let Some(done) = complete {
            sqlx::query(
                r#"
                UPDATE competitions SET status = $2, closed_at = $3
                WHERE id = $1 AND status = 'awaiting_winners'
                "#,
            )
            .bind(done.id)
            .bind(done.status.as_str())
            .bind(done.closed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Recorded {} winner {} for competition {}",
            winner.prize_track, winner.name, winner.competition_id
        );
        Ok(RecordOutcome::Recorded)
    }

    #[instrument(skip(self))]
    async fn delete_winner(&self, id: Uuid) -> Result<DeleteOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query(&format!("SELECT {} FROM winners WHERE id = $1", WINNER_COLUMNS))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(DeleteOutcome::NotFound);
        };
        let winner = winner_from_row(&row)?;

        let status: String =
            sqlx::query_scalar("SELECT status FROM competitions WHERE id = $1 FOR UPDATE")
                .bind(winner.competition_id)
                .fetch_one(&mut *tx)
                .await?;
        let status = parse_status(&status)?;
        if status.is_terminal() {
            tx.rollback().await?;
            return Ok(DeleteOutcome::Closed(status));
        }

        sqlx::query("DELETE FROM winners WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Removed winner {} from competition {}", id, winner.competition_id);
        Ok(DeleteOutcome::Deleted(winner))
    }

    async fn set_winner_email(&self, id: Uuid, email: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE winners SET email = $2 WHERE id = $1")
            .bind(id)
            .bind(email)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

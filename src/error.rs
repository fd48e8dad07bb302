use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::CompetitionStatus;

/// Main error type for the competition engine
#[derive(Error, Debug)]
pub enum ContestError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Ledger errors
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    // Lookup errors
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Competition not found: {0}")]
    CompetitionNotFound(Uuid),

    #[error("Winner not found: {0}")]
    WinnerNotFound(Uuid),

    // State machine errors
    #[error("Competition {id} already {status}")]
    AlreadyInState { id: Uuid, status: CompetitionStatus },

    #[error("Competition {id} is {status} and can no longer be changed")]
    CompetitionClosed { id: Uuid, status: CompetitionStatus },

    #[error("Competition {id} is {status}, winners can only be picked once it awaits winners")]
    NotAwaitingWinners { id: Uuid, status: CompetitionStatus },

    #[error("Competition {id} still has open quotas: trading {trading}, deposit {deposit}")]
    QuotasUnfilled { id: Uuid, trading: u32, deposit: u32 },

    // Allocation errors
    #[error("No eligible candidates left")]
    NoCandidates,

    #[error("All winner quotas are exhausted")]
    QuotaExhausted,

    // Messaging errors
    #[error("Announcement failed: {0}")]
    AnnounceFailed(String),

    // Concurrency errors
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ContestError
pub type Result<T> = std::result::Result<T, ContestError>;

/// Specific error types for ledger arithmetic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("balance {available} is below cost {cost}")]
    InsufficientBalance { available: Decimal, cost: Decimal },

    #[error("deposit quota {available} is below requested {requested} units")]
    InsufficientDepositQuota { available: u32, requested: u32 },

    #[error("credit of {amount} exceeds consumed balance {consumed}")]
    CreditExceedsConsumed { amount: Decimal, consumed: Decimal },

    #[error("credit of {units} units exceeds used deposit quota {used}")]
    CreditExceedsUsedQuota { units: u32, used: u32 },

    #[error("charge amount must not be negative: {0}")]
    NegativeAmount(Decimal),
}

impl From<LedgerError> for ContestError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance { .. }
            | LedgerError::InsufficientDepositQuota { .. } => {
                ContestError::InsufficientFunds(err.to_string())
            }
            LedgerError::NegativeAmount(_) => ContestError::Validation(err.to_string()),
            LedgerError::CreditExceedsConsumed { .. }
            | LedgerError::CreditExceedsUsedQuota { .. } => {
                ContestError::Internal(format!("ledger invariant violated: {err}"))
            }
        }
    }
}

/// Specific error types for winner allocation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no eligible candidates left")]
    NoCandidates,

    #[error("all winner quotas are exhausted")]
    QuotaExhausted,
}

impl From<AllocationError> for ContestError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::NoCandidates => ContestError::NoCandidates,
            AllocationError::QuotaExhausted => ContestError::QuotaExhausted,
        }
    }
}

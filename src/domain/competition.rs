use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::state::CompetitionStatus;
use crate::engine::ledger::Charge;

/// Preset competition lengths offered to agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompetitionDuration {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "2d")]
    TwoDays,
    #[serde(rename = "1w")]
    OneWeek,
}

impl CompetitionDuration {
    pub fn days(&self) -> i64 {
        match self {
            CompetitionDuration::OneDay => 1,
            CompetitionDuration::TwoDays => 2,
            CompetitionDuration::OneWeek => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompetitionDuration::OneDay => "1d",
            CompetitionDuration::TwoDays => "2d",
            CompetitionDuration::OneWeek => "1w",
        }
    }
}

impl fmt::Display for CompetitionDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for CompetitionDuration {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim().to_lowercase().as_str() {
            "1d" | "24h" => Ok(CompetitionDuration::OneDay),
            "2d" | "48h" => Ok(CompetitionDuration::TwoDays),
            "1w" | "7d" => Ok(CompetitionDuration::OneWeek),
            _ => Err(format!("Unknown competition duration: {}", s)),
        }
    }
}

/// When the participation window closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionWindow {
    /// Derived from the creation day in the reference timezone
    Duration(CompetitionDuration),
    /// Caller-supplied absolute end
    EndsAt(DateTime<Utc>),
}

/// Decimal places kept by the store for money columns
pub const MONEY_SCALE: u32 = 4;

/// Parameters of a creation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitionParams {
    pub name: String,
    pub question: String,
    #[serde(default)]
    pub correct_answer: Option<String>,
    /// Text posted to the agent's channel
    pub announcement: String,
    pub cost: Decimal,
    #[serde(default)]
    pub deposit_units: u32,
    pub trading_winner_quota: u32,
    pub deposit_winner_quota: u32,
    pub prize_per_trading_winner: Decimal,
    pub deposit_bonus_percentage: Decimal,
    pub window: CompetitionWindow,
}

impl CompetitionParams {
    pub fn charge(&self) -> Charge {
        Charge::new(self.cost, self.deposit_units)
    }

    /// Validate request values, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.announcement.trim().is_empty() {
            errors.push("announcement must not be empty".to_string());
        }
        if self.cost < Decimal::ZERO {
            errors.push("cost must not be negative".to_string());
        }
        if self.prize_per_trading_winner < Decimal::ZERO {
            errors.push("prize_per_trading_winner must not be negative".to_string());
        }
        if self.deposit_bonus_percentage < Decimal::ZERO
            || self.deposit_bonus_percentage > Decimal::ONE_HUNDRED
        {
            errors.push("deposit_bonus_percentage must be between 0 and 100".to_string());
        }
        for (field, value) in [
            ("cost", self.cost),
            ("prize_per_trading_winner", self.prize_per_trading_winner),
            ("deposit_bonus_percentage", self.deposit_bonus_percentage),
        ] {
            if value.scale() > MONEY_SCALE {
                errors.push(format!(
                    "{} allows at most {} decimal places",
                    field, MONEY_SCALE
                ));
            }
        }
        if self.trading_winner_quota == 0 && self.deposit_winner_quota == 0 {
            errors.push("at least one winner quota must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// One time-boxed contest run by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub question: String,
    pub correct_answer: Option<String>,
    pub status: CompetitionStatus,
    pub cost: Decimal,
    pub deposit_units: u32,
    pub ends_at: DateTime<Utc>,
    pub trading_winner_quota: u32,
    pub deposit_winner_quota: u32,
    pub prize_per_trading_winner: Decimal,
    pub deposit_bonus_percentage: Decimal,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Competition {
    /// Build a fresh `sent` competition from request parameters
    pub fn from_params(
        agent_id: Uuid,
        params: &CompetitionParams,
        idempotency_key: impl Into<String>,
        ends_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            name: params.name.clone(),
            question: params.question.clone(),
            correct_answer: params.correct_answer.clone(),
            status: CompetitionStatus::Sent,
            cost: params.cost,
            deposit_units: params.deposit_units,
            ends_at,
            trading_winner_quota: params.trading_winner_quota,
            deposit_winner_quota: params.deposit_winner_quota,
            prize_per_trading_winner: params.prize_per_trading_winner,
            deposit_bonus_percentage: params.deposit_bonus_percentage,
            idempotency_key: idempotency_key.into(),
            created_at,
            processed_at: None,
            closed_at: None,
        }
    }

    /// What was debited from the agent at creation
    pub fn charge(&self) -> Charge {
        Charge::new(self.cost, self.deposit_units)
    }

    pub fn total_winner_quota(&self) -> u32 {
        self.trading_winner_quota + self.deposit_winner_quota
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at
    }
}

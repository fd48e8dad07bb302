use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::engine::ledger::Ledger;

/// How often an agent's consumed balance rolls back into available balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenewalCadence {
    #[default]
    None,
    Weekly,
    Biweekly,
    Monthly,
}

impl RenewalCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalCadence::None => "none",
            RenewalCadence::Weekly => "weekly",
            RenewalCadence::Biweekly => "biweekly",
            RenewalCadence::Monthly => "monthly",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, RenewalCadence::None)
    }
}

impl fmt::Display for RenewalCadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for RenewalCadence {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(RenewalCadence::None),
            "weekly" => Ok(RenewalCadence::Weekly),
            "biweekly" => Ok(RenewalCadence::Biweekly),
            "monthly" => Ok(RenewalCadence::Monthly),
            _ => Err(format!("Unknown renewal cadence: {}", s)),
        }
    }
}

/// Partner account running competitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    /// Messaging destination (chat id) for announcements
    pub destination: Option<String>,
    /// Channel title on file, compared against the live channel at creation time
    pub channel_title: Option<String>,
    pub ledger: Ledger,
    pub renewal_cadence: RenewalCadence,
    pub last_renewal_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, ledger: Ledger, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            destination: None,
            channel_title: None,
            ledger,
            renewal_cadence: RenewalCadence::None,
            last_renewal_at: None,
            created_at,
        }
    }

    pub fn with_destination(
        mut self,
        destination: impl Into<String>,
        channel_title: Option<String>,
    ) -> Self {
        self.destination = Some(destination.into());
        self.channel_title = channel_title;
        self
    }

    pub fn with_cadence(mut self, cadence: RenewalCadence) -> Self {
        self.renewal_cadence = cadence;
        self
    }

    /// Start of the current renewal cycle
    pub fn renewal_anchor(&self) -> DateTime<Utc> {
        self.last_renewal_at.unwrap_or(self.created_at)
    }

    /// Snapshot with the ledger rolled over and the renewal time stamped
    pub fn renewed(&self, now: DateTime<Utc>) -> Agent {
        Agent {
            ledger: self.ledger.renew(),
            last_renewal_at: Some(now),
            ..self.clone()
        }
    }
}

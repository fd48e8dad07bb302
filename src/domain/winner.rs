use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prize track a winner is classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrizeTrack {
    /// Fixed cash amount, allocated first
    Trading,
    /// Percentage deposit bonus
    Deposit,
}

impl PrizeTrack {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrizeTrack::Trading => "trading",
            PrizeTrack::Deposit => "deposit",
        }
    }
}

impl fmt::Display for PrizeTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PrizeTrack {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "trading" => Ok(PrizeTrack::Trading),
            "deposit" => Ok(PrizeTrack::Deposit),
            _ => Err(format!("Unknown prize track: {}", s)),
        }
    }
}

/// A participant who may be drawn
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub account_ref: Option<String>,
}

impl Candidate {
    pub fn new(name: impl Into<String>, account_ref: Option<String>) -> Self {
        Self {
            name: name.into(),
            account_ref: account_ref.filter(|a| !a.trim().is_empty()),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Same person: account references decide when both sides have one,
    /// otherwise names do.
    pub fn same_identity(&self, name: &str, account_ref: Option<&str>) -> bool {
        match (self.account_ref.as_deref(), account_ref) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => self.name == name,
        }
    }

    pub fn is_winner(&self, winner: &Winner) -> bool {
        self.same_identity(&winner.name, winner.account_ref.as_deref())
    }
}

/// One recorded selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Winner {
    pub id: Uuid,
    pub competition_id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub account_ref: Option<String>,
    pub prize_track: PrizeTrack,
    pub prize_value: Decimal,
    pub selected_at: DateTime<Utc>,
    /// Contact enrichment added after selection
    pub email: Option<String>,
}

impl Winner {
    pub fn candidate(&self) -> Candidate {
        Candidate::new(self.name.clone(), self.account_ref.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_prefers_account_reference() {
        let c = Candidate::new("Ahmed", Some("1001".to_string()));
        assert!(c.same_identity("Ahmed", Some("1001")));
        assert!(c.same_identity("A. Hassan", Some("1001")));
        // Same name, different accounts: different people
        assert!(!c.same_identity("Ahmed", Some("2002")));
    }

    #[test]
    fn test_identity_falls_back_to_name() {
        let c = Candidate::named("Mona");
        assert!(c.same_identity("Mona", Some("3003")));
        assert!(!c.same_identity("Mina", None));

        let blank = Candidate::new("Sara", Some("   ".to_string()));
        assert_eq!(blank.account_ref, None);
    }
}

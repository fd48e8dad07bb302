//! Agent balance ledger
//!
//! Pure arithmetic over an agent's two counters pairs:
//! - spendable balance (available / consumed)
//! - deposit-bonus quota (available / used)
//!
//! Every operation returns a new `Ledger`; nothing here persists anything.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// What a competition takes from an agent's ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub cost: Decimal,
    pub deposit_units: u32,
}

impl Charge {
    pub fn new(cost: Decimal, deposit_units: u32) -> Self {
        Self {
            cost,
            deposit_units,
        }
    }
}

/// Per-agent ledger counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ledger {
    pub balance_available: Decimal,
    pub balance_consumed: Decimal,
    pub deposit_quota_available: u32,
    pub deposit_quota_used: u32,
}

impl Ledger {
    /// Fresh ledger with nothing consumed yet
    pub fn funded(balance: Decimal, deposit_quota: u32) -> Self {
        Self {
            balance_available: balance,
            balance_consumed: Decimal::ZERO,
            deposit_quota_available: deposit_quota,
            deposit_quota_used: 0,
        }
    }

    /// Conserved balance total (changes only on renewal)
    pub fn balance_total(&self) -> Decimal {
        self.balance_available + self.balance_consumed
    }

    /// Conserved deposit quota total
    pub fn deposit_quota_total(&self) -> u32 {
        self.deposit_quota_available + self.deposit_quota_used
    }

    pub fn can_afford(&self, charge: Charge) -> bool {
        self.debit(charge).is_ok()
    }

    /// Move `cost` and `deposit_units` from available into consumed/used.
    /// Both counters move or neither does.
    pub fn debit(&self, charge: Charge) -> Result<Ledger, LedgerError> {
        if charge.cost < Decimal::ZERO {
            return Err(LedgerError::NegativeAmount(charge.cost));
        }
        if self.balance_available < charge.cost {
            return Err(LedgerError::InsufficientBalance {
                available: self.balance_available,
                cost: charge.cost,
            });
        }
        if self.deposit_quota_available < charge.deposit_units {
            return Err(LedgerError::InsufficientDepositQuota {
                available: self.deposit_quota_available,
                requested: charge.deposit_units,
            });
        }

        Ok(Ledger {
            balance_available: self.balance_available - charge.cost,
            balance_consumed: self.balance_consumed + charge.cost,
            deposit_quota_available: self.deposit_quota_available - charge.deposit_units,
            deposit_quota_used: self.deposit_quota_used + charge.deposit_units,
        })
    }

    /// Inverse of `debit`, used to compensate a rolled-back creation
    pub fn credit(&self, charge: Charge) -> Result<Ledger, LedgerError> {
        if charge.cost < Decimal::ZERO {
            return Err(LedgerError::NegativeAmount(charge.cost));
        }
        if self.balance_consumed < charge.cost {
            return Err(LedgerError::CreditExceedsConsumed {
                amount: charge.cost,
                consumed: self.balance_consumed,
            });
        }
        if self.deposit_quota_used < charge.deposit_units {
            return Err(LedgerError::CreditExceedsUsedQuota {
                units: charge.deposit_units,
                used: self.deposit_quota_used,
            });
        }

        Ok(Ledger {
            balance_available: self.balance_available + charge.cost,
            balance_consumed: self.balance_consumed - charge.cost,
            deposit_quota_available: self.deposit_quota_available + charge.deposit_units,
            deposit_quota_used: self.deposit_quota_used - charge.deposit_units,
        })
    }

    /// Fold consumed/used back into available
    pub fn renew(&self) -> Ledger {
        Ledger {
            balance_available: self.balance_available + self.balance_consumed,
            balance_consumed: Decimal::ZERO,
            deposit_quota_available: self.deposit_quota_available + self.deposit_quota_used,
            deposit_quota_used: 0,
        }
    }
}

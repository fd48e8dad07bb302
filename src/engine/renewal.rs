//! Periodic ledger rollover
//!
//! Agents on a cadence get their consumed balance and used deposit quota
//! folded back into the available amounts once the cycle has elapsed:
//! - weekly: anchor + 6 days
//! - biweekly: anchor + 13 days
//! - monthly: same day next month (clamped to month end) minus one day
//!
//! Dates are compared in the reference timezone, so re-running on the day of
//! a renewal finds nothing due.

use async_trait::async_trait;
use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::calendar::local_date;
use super::traits::ContestStore;
use crate::coordination::{Clock, ScheduledTask};
use crate::domain::{Agent, RenewalCadence};
use crate::error::{ContestError, Result};

/// First local date on which the cycle starting at `anchor` may renew
pub fn next_renewal_date(cadence: RenewalCadence, anchor: DateTime<Utc>, tz: Tz) -> Option<NaiveDate> {
    let start = local_date(anchor, tz);
    match cadence {
        RenewalCadence::None => None,
        RenewalCadence::Weekly => start.checked_add_days(Days::new(6)),
        RenewalCadence::Biweekly => start.checked_add_days(Days::new(13)),
        RenewalCadence::Monthly => start
            .checked_add_months(Months::new(1))
            .and_then(|d| d.checked_sub_days(Days::new(1))),
    }
}

pub fn is_due(agent: &Agent, now: DateTime<Utc>, tz: Tz) -> bool {
    next_renewal_date(agent.renewal_cadence, agent.renewal_anchor(), tz)
        .map(|due| local_date(now, tz) >= due)
        .unwrap_or(false)
}

/// Summary of one renewal pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenewalReport {
    pub examined: usize,
    pub renewed: Vec<Uuid>,
    pub not_due: usize,
    pub errors: Vec<String>,
}

impl RenewalReport {
    pub fn renewed_count(&self) -> usize {
        self.renewed.len()
    }
}

/// Renewal pass over the store
pub struct RenewalJob {
    store: Arc<dyn ContestStore>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    max_retries: u32,
}

impl RenewalJob {
    pub fn new(store: Arc<dyn ContestStore>, clock: Arc<dyn Clock>, tz: Tz, max_retries: u32) -> Self {
        Self {
            store,
            clock,
            tz,
            max_retries: max_retries.max(1),
        }
    }

    /// Renew one agent (if due) or every renewable agent
    #[instrument(skip(self))]
    pub async fn trigger(&self, agent_id: Option<Uuid>) -> Result<RenewalReport> {
        let agents = match agent_id {
            Some(id) => {
                let agent = self
                    .store
                    .get_agent(id)
                    .await?
                    .ok_or(ContestError::AgentNotFound(id))?;
                vec![agent]
            }
            None => self.store.list_renewable_agents().await?,
        };

        let mut report = RenewalReport::default();
        for agent in agents {
            report.examined += 1;
            match self.renew_agent(agent.id).await {
                Ok(true) => report.renewed.push(agent.id),
                Ok(false) => report.not_due += 1,
                Err(e) => {
                    warn!("Renewal failed for agent {}: {}", agent.id, e);
                    report.errors.push(format!("{}: {}", agent.id, e));
                }
            }
        }

        if report.renewed_count() > 0 || !report.errors.is_empty() {
            info!(
                "Renewal pass: examined={} renewed={} not_due={} errors={}",
                report.examined,
                report.renewed_count(),
                report.not_due,
                report.errors.len()
            );
        }
        Ok(report)
    }

    /// Compare-and-swap the rolled-over ledger. Returns false if not due.
    async fn renew_agent(&self, agent_id: Uuid) -> Result<bool> {
        for attempt in 1..=self.max_retries {
            let agent = self
                .store
                .get_agent(agent_id)
                .await?
                .ok_or(ContestError::AgentNotFound(agent_id))?;

            let now = self.clock.now();
            if !is_due(&agent, now, self.tz) {
                debug!("Agent {} not due for renewal", agent_id);
                return Ok(false);
            }

            let renewed = agent.renewed(now);
            if self
                .store
                .swap_ledger(agent_id, &agent.ledger, &renewed.ledger, Some(now))
                .await?
            {
                info!(
                    "Renewed agent {} ({}): balance {} -> {}",
                    agent_id,
                    agent.renewal_cadence,
                    agent.ledger.balance_available,
                    renewed.ledger.balance_available
                );
                return Ok(true);
            }
            debug!("Ledger moved under renewal of {} (attempt {})", agent_id, attempt);
        }

        Err(ContestError::Conflict(format!(
            "ledger of agent {} kept changing during renewal",
            agent_id
        )))
    }
}

#[async_trait]
impl ScheduledTask for RenewalJob {
    fn name(&self) -> &str {
        "agent-renewal"
    }

    async fn run(&self) -> Result<()> {
        self.trigger(None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Africa::Cairo;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_weekly_and_biweekly_intervals() {
        let anchor = noon(2025, 1, 6);
        assert_eq!(
            next_renewal_date(RenewalCadence::Weekly, anchor, Cairo),
            Some(date(2025, 1, 12))
        );
        assert_eq!(
            next_renewal_date(RenewalCadence::Biweekly, anchor, Cairo),
            Some(date(2025, 1, 19))
        );
        assert_eq!(next_renewal_date(RenewalCadence::None, anchor, Cairo), None);
    }

    #[test]
    fn test_monthly_clamps_to_month_end() {
        assert_eq!(
            next_renewal_date(RenewalCadence::Monthly, noon(2025, 1, 15), Cairo),
            Some(date(2025, 2, 14))
        );
        assert_eq!(
            next_renewal_date(RenewalCadence::Monthly, noon(2025, 1, 31), Cairo),
            Some(date(2025, 2, 27))
        );
        assert_eq!(
            next_renewal_date(RenewalCadence::Monthly, noon(2024, 1, 31), Cairo),
            Some(date(2024, 2, 28))
        );
        assert_eq!(
            next_renewal_date(RenewalCadence::Monthly, noon(2025, 12, 20), Cairo),
            Some(date(2026, 1, 19))
        );
    }

    #[test]
    fn test_due_uses_local_dates() {
        let agent = Agent::new(
            "Nile FX",
            crate::engine::ledger::Ledger::default(),
            noon(2025, 1, 6),
        )
        .with_cadence(RenewalCadence::Weekly);

        // 2025-01-11 22:30 UTC is already Jan 12 in Cairo
        let late = Utc.with_ymd_and_hms(2025, 1, 11, 22, 30, 0).unwrap();
        assert!(is_due(&agent, late, Cairo));
        assert!(!is_due(&agent, Utc.with_ymd_and_hms(2025, 1, 11, 21, 0, 0).unwrap(), Cairo));

        let renewed = agent.renewed(late);
        assert!(!is_due(&renewed, late, Cairo));
        assert!(!is_due(&agent.with_cadence(RenewalCadence::None), late, Cairo));
    }
}

//! Local-day arithmetic in the reference timezone

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::domain::CompetitionWindow;
use crate::error::{ContestError, Result};

/// Calendar date of `at` as seen in `tz`
pub fn local_date(at: DateTime<Utc>, tz: Tz) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// First instant of `date` in `tz`.
///
/// Some zones skip midnight on DST days; the first valid local time after
/// it is used then.
pub fn local_day_start(date: NaiveDate, tz: Tz) -> Result<DateTime<Utc>> {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0)
        .ok_or_else(|| ContestError::Internal("invalid midnight".to_string()))?;
    local_instant(date, midnight, tz)
}

/// `date` at wall-clock `time` in `tz`, shifted forward over DST gaps
pub fn local_instant(date: NaiveDate, time: NaiveTime, tz: Tz) -> Result<DateTime<Utc>> {
    let naive = date.and_time(time);
    for offset_minutes in [0i64, 30, 60, 90, 120] {
        let candidate = naive + chrono::Duration::minutes(offset_minutes);
        if let Some(local) = tz.from_local_datetime(&candidate).earliest() {
            return Ok(local.with_timezone(&Utc));
        }
    }
    Err(ContestError::Internal(format!(
        "no valid local time for {} in {}",
        naive, tz
    )))
}

/// End of the participation window.
///
/// Preset durations run until the start of the local day after the last full
/// competition day: `day_start(created) + (days + 1) days`.
pub fn ends_at(window: CompetitionWindow, created_at: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    match window {
        CompetitionWindow::EndsAt(at) => Ok(at),
        CompetitionWindow::Duration(duration) => {
            let days = u64::try_from(duration.days() + 1)
                .map_err(|_| ContestError::Internal("negative duration".to_string()))?;
            let end_date = local_date(created_at, tz)
                .checked_add_days(Days::new(days))
                .ok_or_else(|| ContestError::Validation("end date out of range".to_string()))?;
            local_day_start(end_date, tz)
        }
    }
}

/// Parse an IANA zone name
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| ContestError::Validation(format!("unknown timezone {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CompetitionDuration;
    use chrono_tz::Africa::Cairo;

    #[test]
    fn test_one_day_ends_at_start_of_day_after_next() {
        // 2025-01-15 22:30 Cairo (UTC+2) is 20:30 UTC
        let created = Utc.with_ymd_and_hms(2025, 1, 15, 20, 30, 0).unwrap();
        let end = ends_at(
            CompetitionWindow::Duration(CompetitionDuration::OneDay),
            created,
            Cairo,
        )
        .unwrap();
        // Local midnight of 2025-01-17 is 22:00 UTC on the 16th
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 16, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_local_date_crosses_utc_midnight() {
        // 23:30 UTC is already the next day in Cairo
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 23, 30, 0).unwrap();
        assert_eq!(local_date(at, Cairo), NaiveDate::from_ymd_opt(2025, 1, 16).unwrap());

        let week = ends_at(
            CompetitionWindow::Duration(CompetitionDuration::OneWeek),
            at,
            Cairo,
        )
        .unwrap();
        assert_eq!(local_date(week, Cairo), NaiveDate::from_ymd_opt(2025, 1, 24).unwrap());
    }

    #[test]
    fn test_explicit_end_is_kept() {
        let at = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let created = Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap();
        assert_eq!(ends_at(CompetitionWindow::EndsAt(at), created, Cairo).unwrap(), at);
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("Africa/Cairo").unwrap(), Cairo);
        assert!(parse_timezone("Mars/Olympus").is_err());
    }
}

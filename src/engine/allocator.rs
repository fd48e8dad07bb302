//! Winner allocation
//!
//! Draws winners uniformly at random from the eligible part of a candidate
//! pool and classifies each one into a prize track:
//! - trading bonus first, until its quota is full
//! - deposit bonus afterwards
//!
//! `AllocationRound` keeps the eligible queue and the quota tally together so
//! consecutive draws always observe the previous one.

use rand::{CryptoRng, Rng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::{Candidate, Competition, PrizeTrack, Winner};
use crate::error::AllocationError;

const DASHES: [char; 6] = [
    '-', '\u{2014}', '\u{2013}', '\u{2015}', '\u{2012}', '\u{2212}',
];
const INVISIBLE: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

fn is_dash(c: char) -> bool {
    DASHES.contains(&c)
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Winners per track against the competition's quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaTally {
    pub trading_quota: u32,
    pub deposit_quota: u32,
    pub trading_picked: u32,
    pub deposit_picked: u32,
}

impl QuotaTally {
    pub fn new(trading_quota: u32, deposit_quota: u32) -> Self {
        Self {
            trading_quota,
            deposit_quota,
            trading_picked: 0,
            deposit_picked: 0,
        }
    }

    pub fn from_winners(competition: &Competition, winners: &[Winner]) -> Self {
        let mut tally = Self::new(
            competition.trading_winner_quota,
            competition.deposit_winner_quota,
        );
        for winner in winners {
            tally.record(winner.prize_track);
        }
        tally
    }

    pub fn record(&mut self, track: PrizeTrack) {
        match track {
            PrizeTrack::Trading => self.trading_picked += 1,
            PrizeTrack::Deposit => self.deposit_picked += 1,
        }
    }

    pub fn release(&mut self, track: PrizeTrack) {
        match track {
            PrizeTrack::Trading => self.trading_picked = self.trading_picked.saturating_sub(1),
            PrizeTrack::Deposit => self.deposit_picked = self.deposit_picked.saturating_sub(1),
        }
    }

    pub fn trading_remaining(&self) -> u32 {
        self.trading_quota.saturating_sub(self.trading_picked)
    }

    pub fn deposit_remaining(&self) -> u32 {
        self.deposit_quota.saturating_sub(self.deposit_picked)
    }

    /// Quota-priority rule: trading while it has room, then deposit
    pub fn next_track(&self) -> Option<PrizeTrack> {
        if self.trading_picked < self.trading_quota {
            Some(PrizeTrack::Trading)
        } else if self.deposit_picked < self.deposit_quota {
            Some(PrizeTrack::Deposit)
        } else {
            None
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_track().is_none()
    }

    /// Both tracks filled exactly
    pub fn is_satisfied(&self) -> bool {
        self.trading_picked == self.trading_quota && self.deposit_picked == self.deposit_quota
    }

    pub fn within_quota(&self) -> bool {
        self.trading_picked <= self.trading_quota && self.deposit_picked <= self.deposit_quota
    }
}

/// De-duplicated list of participants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidatePool {
    candidates: Vec<Candidate>,
}

impl CandidatePool {
    /// Build a pool, keeping the first occurrence of each identity
    pub fn new(candidates: impl IntoIterator<Item = Candidate>) -> Self {
        let mut kept: Vec<Candidate> = Vec::new();
        let mut accounts: HashSet<String> = HashSet::new();

        for candidate in candidates {
            let name = candidate.name.trim();
            if name.is_empty() {
                continue;
            }
            let candidate = Candidate::new(name, candidate.account_ref.clone());
            let duplicate = match &candidate.account_ref {
                Some(account) => accounts.contains(account),
                None => kept.iter().any(|k| k.name == candidate.name),
            };
            if duplicate {
                continue;
            }
            if let Some(account) = &candidate.account_ref {
                accounts.insert(account.clone());
            }
            kept.push(candidate);
        }

        Self { candidates: kept }
    }

    /// Parse a pasted participant list, one participant per line.
    ///
    /// Accepts `Name - 12345`, `Name — 12345`, `Name 12345` and plain names,
    /// optionally prefixed with an ordinal such as `1- ` or `2. `.
    pub fn parse(text: &str) -> Self {
        Self::new(text.lines().filter_map(parse_line))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }
}

fn parse_line(raw: &str) -> Option<Candidate> {
    let cleaned: String = raw.chars().filter(|c| !INVISIBLE.contains(c)).collect();
    let line = strip_ordinal(cleaned.trim());
    if line.is_empty() {
        return None;
    }

    let (name, account) = split_account(line);
    Some(Candidate::new(name, account))
}

fn strip_ordinal(line: &str) -> &str {
    let digits_end = line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(line.len());
    if digits_end == 0 || digits_end == line.len() {
        return line;
    }

    let rest = &line[digits_end..];
    let sep_len: usize = rest
        .chars()
        .take_while(|c| *c == '.' || *c == ')' || is_dash(*c) || c.is_whitespace())
        .map(char::len_utf8)
        .sum();
    if sep_len == 0 {
        return line;
    }
    rest[sep_len..].trim_start()
}

fn split_account(line: &str) -> (String, Option<String>) {
    // Name, dash separator, digits
    if let Some(pos) = line.rfind(is_dash) {
        let dash_len = line[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
        let tail = line[pos + dash_len..].trim();
        let head = line[..pos].trim_end_matches(is_dash).trim();
        if all_digits(tail) && !head.is_empty() {
            return (head.to_string(), Some(tail.to_string()));
        }
    }

    // Name, whitespace, digits
    if let Some(pos) = line.rfind(char::is_whitespace) {
        let tail = line[pos..].trim();
        let head = line[..pos].trim();
        if all_digits(tail) && !head.is_empty() {
            return (head.to_string(), Some(tail.to_string()));
        }
    }

    // Dash-separated with noise around the digits
    let parts: Vec<&str> = line.split(is_dash).collect();
    if parts.len() > 1 {
        let last = parts[parts.len() - 1];
        let digits: String = last.chars().filter(|c| c.is_ascii_digit()).collect();
        let name = parts[..parts.len() - 1].join(" ").trim().to_string();
        if !digits.is_empty() && !name.is_empty() {
            return (name, Some(digits));
        }
    }

    (line.to_string(), None)
}

/// Allocation behaviour switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickOptions {
    /// Drop candidates who already won this competition from the draw
    pub exclude_previous_winners: bool,
}

impl Default for PickOptions {
    fn default() -> Self {
        Self {
            exclude_previous_winners: true,
        }
    }
}

/// Result of one accepted draw
#[derive(Debug, Clone, PartialEq)]
pub struct Draw {
    pub candidate: Candidate,
    pub track: PrizeTrack,
    pub prize_value: Decimal,
    /// Size of the eligible subset the draw was made from
    pub eligible: usize,
    /// Both quotas are filled after this draw
    pub completes: bool,
}

/// Sequential draws against one competition
#[derive(Debug, Clone)]
pub struct AllocationRound {
    tally: QuotaTally,
    trading_prize: Decimal,
    deposit_prize: Decimal,
    eligible: Vec<Candidate>,
    options: PickOptions,
}

impl AllocationRound {
    pub fn new(
        competition: &Competition,
        winners: &[Winner],
        pool: &CandidatePool,
        options: PickOptions,
    ) -> Self {
        let eligible = pool
            .candidates()
            .iter()
            .filter(|c| !options.exclude_previous_winners || !winners.iter().any(|w| c.is_winner(w)))
            .cloned()
            .collect();

        Self {
            tally: QuotaTally::from_winners(competition, winners),
            trading_prize: competition.prize_per_trading_winner,
            deposit_prize: competition.deposit_bonus_percentage,
            eligible,
            options,
        }
    }

    pub fn tally(&self) -> &QuotaTally {
        &self.tally
    }

    pub fn eligible(&self) -> &[Candidate] {
        &self.eligible
    }

    /// Draw the next winner.
    ///
    /// Each eligible candidate is chosen with probability `1 / eligible`.
    pub fn draw<R: Rng + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<Draw, AllocationError> {
        if self.eligible.is_empty() {
            return Err(AllocationError::NoCandidates);
        }
        let track = self.tally.next_track().ok_or(AllocationError::QuotaExhausted)?;

        let eligible = self.eligible.len();
        let index = rng.gen_range(0..eligible);
        let candidate = if self.options.exclude_previous_winners {
            self.eligible.remove(index)
        } else {
            self.eligible[index].clone()
        };

        let prize_value = match track {
            PrizeTrack::Trading => self.trading_prize,
            PrizeTrack::Deposit => self.deposit_prize,
        };
        self.tally.record(track);

        Ok(Draw {
            candidate,
            track,
            prize_value,
            eligible,
            completes: self.tally.is_satisfied(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CompetitionParams, CompetitionWindow};
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn competition(trading: u32, deposit: u32) -> Competition {
        let ends = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let params = CompetitionParams {
            name: "Quiz".to_string(),
            question: "?".to_string(),
            correct_answer: None,
            announcement: "Quiz".to_string(),
            cost: dec!(10),
            deposit_units: deposit,
            trading_winner_quota: trading,
            deposit_winner_quota: deposit,
            prize_per_trading_winner: dec!(30),
            deposit_bonus_percentage: dec!(75),
            window: CompetitionWindow::EndsAt(ends),
        };
        Competition::from_params(Uuid::new_v4(), &params, "k", ends, ends)
    }

    fn pool(n: usize) -> CandidatePool {
        CandidatePool::new((0..n).map(|i| Candidate::new(format!("p{i}"), Some(format!("{}", 1000 + i)))))
    }

    fn winner_from(competition: &Competition, draw: &Draw) -> Winner {
        Winner {
            id: Uuid::new_v4(),
            competition_id: competition.id,
            agent_id: competition.agent_id,
            name: draw.candidate.name.clone(),
            account_ref: draw.candidate.account_ref.clone(),
            prize_track: draw.track,
            prize_value: draw.prize_value,
            selected_at: competition.ends_at,
            email: None,
        }
    }

    #[test]
    fn test_trading_priority_then_deposit_then_exhausted() {
        let c = competition(2, 1);
        let mut round = AllocationRound::new(&c, &[], &pool(5), PickOptions::default());
        let mut rng = StdRng::seed_from_u64(7);

        let first = round.draw(&mut rng).unwrap();
        let second = round.draw(&mut rng).unwrap();
        let third = round.draw(&mut rng).unwrap();

        assert_eq!(first.track, PrizeTrack::Trading);
        assert_eq!(first.prize_value, dec!(30));
        assert_eq!(second.track, PrizeTrack::Trading);
        assert!(!second.completes);
        assert_eq!(third.track, PrizeTrack::Deposit);
        assert_eq!(third.prize_value, dec!(75));
        assert!(third.completes);

        assert_eq!(round.draw(&mut rng), Err(AllocationError::QuotaExhausted));
        assert_eq!(round.eligible().len(), 2);
    }

    #[test]
    fn test_nth_winner_track_follows_tally() {
        let c = competition(3, 4);
        let mut round = AllocationRound::new(&c, &[], &pool(20), PickOptions::default());
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..7 {
            let trading_before = round.tally().trading_picked;
            let draw = round.draw(&mut rng).unwrap();
            let expected = if trading_before < 3 {
                PrizeTrack::Trading
            } else {
                PrizeTrack::Deposit
            };
            assert_eq!(draw.track, expected);
            assert!(round.tally().within_quota());
        }
        assert!(round.tally().is_satisfied());
    }

    #[test]
    fn test_no_candidates_checked_before_quota() {
        let c = competition(0, 0);
        let mut round = AllocationRound::new(&c, &[], &CandidatePool::default(), PickOptions::default());
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(round.draw(&mut rng), Err(AllocationError::NoCandidates));
    }

    #[test]
    fn test_previous_winners_are_excluded() {
        let c = competition(3, 0);
        let candidates = pool(3);
        let mut rng = StdRng::seed_from_u64(3);

        let mut round = AllocationRound::new(&c, &[], &candidates, PickOptions::default());
        let draw = round.draw(&mut rng).unwrap();
        let winners = vec![winner_from(&c, &draw)];

        let next = AllocationRound::new(&c, &winners, &candidates, PickOptions::default());
        assert_eq!(next.eligible().len(), 2);
        assert!(!next.eligible().contains(&draw.candidate));
        assert_eq!(next.tally().trading_picked, 1);

        let keep = AllocationRound::new(
            &c,
            &winners,
            &candidates,
            PickOptions {
                exclude_previous_winners: false,
            },
        );
        assert_eq!(keep.eligible().len(), 3);
    }

    #[test]
    fn test_draw_is_uniform() {
        // Chi-square goodness of fit, 9 degrees of freedom.
        // Critical value at p = 0.001 is 27.88.
        let c = competition(u32::MAX, 0);
        let candidates = pool(10);
        let mut round = AllocationRound::new(
            &c,
            &[],
            &candidates,
            PickOptions {
                exclude_previous_winners: false,
            },
        );
        let mut rng = StdRng::seed_from_u64(2024);
        let mut counts = [0u32; 10];

        let picks = 100_000;
        for _ in 0..picks {
            let draw = round.draw(&mut rng).unwrap();
            let idx: usize = draw.candidate.name[1..].parse().unwrap();
            counts[idx] += 1;
        }

        let expected = picks as f64 / 10.0;
        let chi_square: f64 = counts
            .iter()
            .map(|&o| {
                let d = o as f64 - expected;
                d * d / expected
            })
            .sum();
        assert!(chi_square < 27.88, "chi-square {chi_square} counts {counts:?}");
    }

    #[test]
    fn test_pool_deduplicates_by_identity() {
        let p = CandidatePool::new(vec![
            Candidate::new("Ali", Some("1".to_string())),
            Candidate::new("Ali B", Some("1".to_string())),
            Candidate::named("Omar"),
            Candidate::named("Omar"),
            Candidate::new("Omar", Some("2".to_string())),
            Candidate::named("   "),
        ]);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_parse_pasted_list() {
        let text = "1- Ahmed Ali — 556677\n\
                    2. Mona Hassan - 112233\n\
                    \u{200B}Karim 998877\n\
                    \n\
                    Youssef\n\
                    3) Nour –– 445566\n\
                    Salma - #7788\n\
                    Ahmed Ali - 556677\n";
        let pool = CandidatePool::parse(text);
        let got: Vec<(String, Option<String>)> = pool
            .candidates()
            .iter()
            .map(|c| (c.name.clone(), c.account_ref.clone()))
            .collect();

        assert_eq!(
            got,
            vec![
                ("Ahmed Ali".to_string(), Some("556677".to_string())),
                ("Mona Hassan".to_string(), Some("112233".to_string())),
                ("Karim".to_string(), Some("998877".to_string())),
                ("Youssef".to_string(), None),
                ("Nour".to_string(), Some("445566".to_string())),
                ("Salma".to_string(), Some("7788".to_string())),
            ]
        );
    }
}

//! Duplicate suppression
//!
//! Two independent guards:
//! - creation dedup, persisted through the store's unique
//!   `(agent_id, idempotency_key)` constraint
//! - announcement dedup, a process-local TTL cache keyed by a hash of
//!   destination and message text

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::{Announcement, Announcer, ContestStore, MessageId};
use crate::coordination::{Clock, ScheduledTask};
use crate::domain::{Competition, CompetitionParams, CompetitionWindow};
use crate::error::Result;

/// Outcome of the creation dedup lookup
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyResult {
    /// Key unseen, proceed with creation
    New,
    /// Key already used; the original competition
    Duplicate(Competition),
}

/// Resolve the key for a creation request.
///
/// Uses the trimmed caller key when present, otherwise a deterministic hash
/// of the request parameters so a blind retry still collides.
pub fn generate_key(supplied: Option<&str>, params: &CompetitionParams) -> String {
    match supplied.map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => hash_params(params),
    }
}

fn hash_params(params: &CompetitionParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.name.as_bytes());
    hasher.update(params.question.as_bytes());
    hasher.update(params.announcement.as_bytes());
    hasher.update(params.cost.to_string().as_bytes());
    hasher.update(params.deposit_units.to_le_bytes());
    hasher.update(params.trading_winner_quota.to_le_bytes());
    hasher.update(params.deposit_winner_quota.to_le_bytes());
    hasher.update(params.prize_per_trading_winner.to_string().as_bytes());
    hasher.update(params.deposit_bonus_percentage.to_string().as_bytes());
    match params.window {
        CompetitionWindow::Duration(d) => hasher.update(d.as_str().as_bytes()),
        CompetitionWindow::EndsAt(at) => hasher.update(at.to_rfc3339().as_bytes()),
    }
    format!("{:x}", hasher.finalize())
}

/// Look up an existing competition for `(agent_id, key)`
pub async fn check_existing(
    store: &dyn ContestStore,
    agent_id: Uuid,
    key: &str,
) -> Result<IdempotencyResult> {
    match store.find_competition_by_key(agent_id, key).await? {
        Some(existing) => {
            warn!(
                "Duplicate creation for agent {} with idempotency key {} (competition {})",
                agent_id, key, existing.id
            );
            Ok(IdempotencyResult::Duplicate(existing))
        }
        None => Ok(IdempotencyResult::New),
    }
}

/// Reservation held while a message is in flight
#[derive(Debug, PartialEq, Eq)]
pub struct DedupTicket {
    key: String,
}

impl DedupTicket {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// What happened to an announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent(MessageId),
    /// An identical message went to the same destination within the TTL
    SkippedDuplicate,
}

/// In-memory TTL cache suppressing repeated identical announcements
pub struct AnnouncementDedup {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, DateTime<Utc>>,
}

impl AnnouncementDedup {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: DashMap::new(),
        }
    }

    pub fn fingerprint(destination: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(destination.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Claim `(destination, text)`. `None` while a live entry exists.
    pub fn reserve(&self, destination: &str, text: &str) -> Option<DedupTicket> {
        let key = Self::fingerprint(destination, text);
        let now = self.clock.now();

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if now - *entry.get() < self.ttl {
                    return None;
                }
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
            }
        }
        Some(DedupTicket { key })
    }

    /// Drop a reservation after a failed send
    pub fn release(&self, ticket: DedupTicket) {
        self.entries.remove(&ticket.key);
    }

    /// Remove entries older than the TTL, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, reserved_at| now - *reserved_at < self.ttl);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Send through `announcer` unless the same message is still cached
    pub async fn announce_once(
        &self,
        announcer: &dyn Announcer,
        destination: &str,
        announcement: &Announcement,
    ) -> Result<Delivery> {
        let body = match &announcement.attachment {
            Some(url) => format!("{}\n{}", url, announcement.text),
            None => announcement.text.clone(),
        };
        let Some(ticket) = self.reserve(destination, &body) else {
            debug!("Skipping duplicate announcement to {}", destination);
            return Ok(Delivery::SkippedDuplicate);
        };

        match announcer.announce(destination, announcement).await {
            Ok(message_id) => Ok(Delivery::Sent(message_id)),
            Err(e) => {
                self.release(ticket);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ScheduledTask for AnnouncementDedup {
    fn name(&self) -> &str {
        "announce-dedup-purge"
    }

    async fn run(&self) -> Result<()> {
        let purged = self.purge_expired();
        if purged > 0 {
            debug!("Purged {} expired announcement fingerprints", purged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ManualClock;
    use crate::engine::traits::MockAnnouncer;
    use crate::error::ContestError;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn params() -> CompetitionParams {
        CompetitionParams {
            name: "Gold rush".to_string(),
            question: "Where does gold close?".to_string(),
            correct_answer: None,
            announcement: "New competition!".to_string(),
            cost: dec!(20),
            deposit_units: 2,
            trading_winner_quota: 2,
            deposit_winner_quota: 1,
            prize_per_trading_winner: dec!(50),
            deposit_bonus_percentage: dec!(30),
            window: CompetitionWindow::Duration(crate::domain::CompetitionDuration::OneDay),
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_generate_key_prefers_trimmed_caller_key() {
        assert_eq!(generate_key(Some("  req-42 "), &params()), "req-42");
    }

    #[test]
    fn test_generate_key_hashes_when_blank() {
        let a = generate_key(Some("   "), &params());
        let b = generate_key(None, &params());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let mut other = params();
        other.cost = dec!(21);
        assert_ne!(generate_key(None, &other), a);
    }

    #[test]
    fn test_reserve_blocks_within_ttl() {
        let clock = clock();
        let dedup = AnnouncementDedup::new(Duration::seconds(10), clock.clone());

        assert!(dedup.reserve("-100", "hello").is_some());
        assert!(dedup.reserve("-100", "hello").is_none());
        // Different destination or text is a different message
        assert!(dedup.reserve("-200", "hello").is_some());
        assert!(dedup.reserve("-100", "hello!").is_some());

        clock.advance(Duration::seconds(10));
        assert!(dedup.reserve("-100", "hello").is_some());
    }

    #[test]
    fn test_release_and_purge() {
        let clock = clock();
        let dedup = AnnouncementDedup::new(Duration::seconds(5), clock.clone());

        let ticket = dedup.reserve("-1", "a").unwrap();
        dedup.release(ticket);
        assert!(dedup.reserve("-1", "a").is_some());

        dedup.reserve("-1", "b");
        assert_eq!(dedup.len(), 2);
        clock.advance(Duration::seconds(6));
        assert_eq!(dedup.purge_expired(), 2);
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_announce_once_skips_duplicates() {
        let mut announcer = MockAnnouncer::new();
        announcer
            .expect_announce()
            .times(1)
            .returning(|_, _| Ok(MessageId(7)));

        let dedup = AnnouncementDedup::new(Duration::seconds(10), clock());
        let msg = Announcement::text("Pick your winners");

        let first = dedup.announce_once(&announcer, "-100", &msg).await.unwrap();
        let second = dedup.announce_once(&announcer, "-100", &msg).await.unwrap();
        assert_eq!(first, Delivery::Sent(MessageId(7)));
        assert_eq!(second, Delivery::SkippedDuplicate);
    }

    #[tokio::test]
    async fn test_failed_send_releases_reservation() {
        let mut announcer = MockAnnouncer::new();
        let mut calls = 0;
        announcer.expect_announce().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(ContestError::AnnounceFailed("timeout".to_string()))
            } else {
                Ok(MessageId(9))
            }
        });

        let dedup = AnnouncementDedup::new(Duration::seconds(10), clock());
        let msg = Announcement::text("retry me");

        assert!(dedup.announce_once(&announcer, "-1", &msg).await.is_err());
        assert!(dedup.is_empty());
        let retried = dedup.announce_once(&announcer, "-1", &msg).await.unwrap();
        assert_eq!(retried, Delivery::Sent(MessageId(9)));
    }
}

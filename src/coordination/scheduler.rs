//! Periodic task runner
//!
//! Tasks are registered with a cadence and run from `tick()`. `run()` drives
//! ticks from a tokio interval until shutdown. Each due task runs on its own
//! tokio task and never overlaps a previous run of itself. Due times come from the
//! injected clock, so tests step time with a manual clock and call `tick()`.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Utc};
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::clock::Clock;
use crate::engine::calendar::{local_date, local_instant};
use crate::error::{ContestError, Result};

/// Work run by the scheduler
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

/// When a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed interval, first run on the first tick
    Every(chrono::Duration),
    /// Once a day at a local wall-clock time in the reference timezone
    DailyAt(NaiveTime),
}

impl Cadence {
    /// First due time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
        match *self {
            Cadence::Every(interval) => Ok(after + interval),
            Cadence::DailyAt(time) => {
                let today = local_date(after, tz);
                let candidate = local_instant(today, time, tz)?;
                if candidate > after {
                    return Ok(candidate);
                }
                let tomorrow = today
                    .checked_add_days(Days::new(1))
                    .ok_or_else(|| ContestError::Internal("date out of range".to_string()))?;
                local_instant(tomorrow, time, tz)
            }
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Every(d) => write!(f, "every {}s", d.num_seconds()),
            Cadence::DailyAt(t) => write!(f, "daily at {}", t.format("%H:%M")),
        }
    }
}

struct Job {
    cadence: Cadence,
    task: Arc<dyn ScheduledTask>,
    next_due: DateTime<Utc>,
    running: Arc<AtomicBool>,
}

/// A due task claimed for one run
struct Claimed {
    task: Arc<dyn ScheduledTask>,
    running: Arc<AtomicBool>,
}

impl Claimed {
    async fn execute(self) {
        debug!("Running scheduled task {}", self.task.name());
        if let Err(e) = self.task.run().await {
            error!("Scheduled task {} failed: {}", self.task.name(), e);
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    tz: Tz,
    jobs: Mutex<Vec<Job>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, tz: Tz) -> Self {
        Self {
            clock,
            tz,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub async fn register(&self, cadence: Cadence, task: Arc<dyn ScheduledTask>) -> Result<()> {
        let now = self.clock.now();
        let next_due = match cadence {
            Cadence::Every(_) => now,
            Cadence::DailyAt(_) => cadence.next_after(now, self.tz)?,
        };
        info!("Scheduled {} ({}), next run {}", task.name(), cadence, next_due);

        self.jobs.lock().await.push(Job {
            cadence,
            task,
            next_due,
            running: Arc::new(AtomicBool::new(false)),
        });
        Ok(())
    }

    /// Claim every due task that is not still running and reschedule it
    async fn claim_due(&self) -> Vec<Claimed> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().await;
        let mut claimed = Vec::new();

        for job in jobs.iter_mut() {
            if job.next_due > now {
                continue;
            }
            if job.running.swap(true, Ordering::SeqCst) {
                debug!("Task {} still running, skipping this slot", job.task.name());
                continue;
            }

            job.next_due = match job.cadence.next_after(now, self.tz) {
                Ok(next) => next,
                Err(e) => {
                    error!("Cannot reschedule {}: {}", job.task.name(), e);
                    now + chrono::Duration::days(1)
                }
            };
            claimed.push(Claimed {
                task: job.task.clone(),
                running: job.running.clone(),
            });
        }
        claimed
    }

    /// Run every due task concurrently and wait for all of them. Returns
    /// the names that ran, in registration order.
    pub async fn tick(&self) -> Vec<String> {
        let claimed = self.claim_due().await;
        let names = claimed.iter().map(|c| c.task.name().to_string()).collect();

        let mut set = JoinSet::new();
        for c in claimed {
            set.spawn(c.execute());
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Scheduled task panicked: {}", e);
            }
        }
        names
    }

    /// Tick until `shutdown` flips to true. Tasks run in the background, so a
    /// slow task never delays the others; in-flight runs finish before return.
    pub async fn run(&self, resolution: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(resolution);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();
        info!("Scheduler started (resolution {:?})", resolution);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for c in self.claim_due().await {
                        in_flight.spawn(c.execute());
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Scheduled task panicked: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!("Waiting for {} running task(s)", in_flight.len());
        }
        while in_flight.join_next().await.is_some() {}
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ManualClock;
    use chrono::{Duration, TimeZone};
    use chrono_tz::Africa::Cairo;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct Counter {
        name: &'static str,
        runs: AtomicUsize,
        fail: bool,
    }

    impl Counter {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                runs: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl ScheduledTask for Counter {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ContestError::Internal("boom".to_string()));
            }
            Ok(())
        }
    }

    fn five_am() -> NaiveTime {
        NaiveTime::from_hms_opt(5, 0, 0).unwrap()
    }

    #[test]
    fn test_daily_next_after() {
        // 02:00 UTC = 04:00 Cairo, so 05:00 Cairo today is 03:00 UTC
        let before = Utc.with_ymd_and_hms(2025, 1, 10, 2, 0, 0).unwrap();
        let next = Cadence::DailyAt(five_am()).next_after(before, Cairo).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 10, 3, 0, 0).unwrap());

        let at = Cadence::DailyAt(five_am()).next_after(next, Cairo).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2025, 1, 11, 3, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_tick_runs_due_tasks() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 10, 2, 0, 0).unwrap(),
        ));
        let scheduler = Scheduler::new(clock.clone(), Cairo);
        let sweep = Counter::new("sweep", false);
        let renew = Counter::new("renew", true);

        scheduler
            .register(Cadence::Every(Duration::seconds(60)), sweep.clone())
            .await
            .unwrap();
        scheduler
            .register(Cadence::DailyAt(five_am()), renew.clone())
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await, vec!["sweep".to_string()]);
        // Not due again yet
        assert!(scheduler.tick().await.is_empty());

        clock.advance(Duration::seconds(60));
        assert_eq!(scheduler.tick().await, vec!["sweep".to_string()]);

        clock.advance(Duration::hours(1));
        let ran = scheduler.tick().await;
        assert_eq!(ran, vec!["sweep".to_string(), "renew".to_string()]);
        // A failing task is still rescheduled
        assert!(scheduler.tick().await.is_empty());

        assert_eq!(sweep.runs.load(Ordering::SeqCst), 3);
        assert_eq!(renew.runs.load(Ordering::SeqCst), 1);
    }

    struct Blocking {
        runs: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl ScheduledTask for Blocking {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_task_does_not_hold_back_others() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 10, 2, 0, 0).unwrap(),
        ));
        let scheduler = Arc::new(Scheduler::new(clock, Cairo));
        let slow = Arc::new(Blocking {
            runs: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let fast = Counter::new("fast", false);

        // Zero interval: due on every tick while the clock stands still
        scheduler
            .register(Cadence::Every(Duration::zero()), slow.clone())
            .await
            .unwrap();
        scheduler
            .register(Cadence::Every(Duration::zero()), fast.clone())
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run(std::time::Duration::from_millis(2), rx)
                    .await
            })
        };

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while fast.runs.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        // Still blocked on its first run and never started twice
        assert_eq!(slow.runs.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        slow.release.notify_one();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = Arc::new(Scheduler::new(clock, Cairo));
        let (tx, rx) = watch::channel(false);

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run(std::time::Duration::from_millis(5), rx)
                    .await
            })
        };
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Coordination layer for the long-running service
//!
//! - Injectable clock (system / manual)
//! - Periodic task scheduler (sweeps, renewals, cache purges)
//! - Shutdown flag wired to OS signals

pub mod clock;
pub mod scheduler;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{Cadence, ScheduledTask, Scheduler};
pub use shutdown::Shutdown;

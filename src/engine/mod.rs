//! Competition economy core
//!
//! Pure rules (ledger arithmetic, state transitions, allocation) live beside
//! the periodic jobs that apply them through the store and announcer ports.

pub mod allocator;
pub mod calendar;
pub mod idempotency;
pub mod ledger;
pub mod lifecycle;
pub mod renewal;
pub mod sweeper;
pub mod traits;

pub use allocator::{AllocationRound, CandidatePool, Draw, PickOptions, QuotaTally};
pub use idempotency::{AnnouncementDedup, Delivery, IdempotencyResult};
pub use ledger::{Charge, Ledger};
pub use lifecycle::{Effect, Transition};
pub use renewal::{RenewalJob, RenewalReport};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use traits::{
    Announcement, Announcer, ChannelInfo, ContestStore, DeleteOutcome, InsertOutcome, MessageId,
    RecordOutcome,
};

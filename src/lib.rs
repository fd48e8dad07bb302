pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod engine;
pub mod error;
pub mod services;

pub use adapters::{DryRunAnnouncer, MemoryStore, PostgresStore, TelegramAnnouncer};
pub use config::AppConfig;
pub use coordination::{Cadence, Clock, ManualClock, Scheduler, Shutdown, SystemClock};
pub use domain::{
    Agent, Candidate, Competition, CompetitionParams, CompetitionStatus, CompetitionWindow,
    PrizeTrack, RenewalCadence, Winner,
};
pub use engine::{CandidatePool, Ledger};
pub use error::{ContestError, Result};
pub use services::{CompetitionService, CreateRequest, EngineSettings};

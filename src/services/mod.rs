pub mod competitions;

pub use competitions::{
    BatchOutcome, BatchStop, CompetitionService, CreateOutcome, CreateReport, CreateRequest,
    DrawRng, EngineSettings, Pick,
};

pub mod agent;
pub mod competition;
pub mod state;
pub mod winner;

pub use agent::*;
pub use competition::*;
pub use state::*;
pub use winner::*;

pub mod memory;
pub mod postgres;
pub mod telegram;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use telegram::{DryRunAnnouncer, TelegramAnnouncer};

mod base;
mod memory;
mod postgres;

pub use base::MigrationStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

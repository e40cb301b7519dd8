//! In-process storage engine implementing the schema, change feed and lag interfaces.

mod database;
mod feed;

pub use database::MemoryDatabase;

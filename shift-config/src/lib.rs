//! Configuration management for the online schema-migration engine.
//!
//! Provides environment detection, hierarchical configuration loading from YAML files and
//! environment variables, secret handling, and the shared configuration types consumed by the
//! engine crates.

mod environment;
mod load;
mod secret;
pub mod shared;

pub use environment::*;
pub use load::*;
pub use secret::*;

//! Tracing and metrics setup shared by the migration engine binaries and tests.

pub mod metrics;
pub mod tracing;

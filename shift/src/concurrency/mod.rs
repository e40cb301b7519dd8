//! Signals and stream adapters shared by migration workers.

pub mod cancel;
pub mod shutdown;
pub mod stream;

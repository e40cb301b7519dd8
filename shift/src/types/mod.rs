mod cell;
mod event;
mod migration;

pub use cell::*;
pub use event::*;
pub use migration::*;

mod base;
mod connection;
mod copy;
mod cutover;
mod engine;
mod retry;
mod sync;
mod throttle;

pub use base::*;
pub use connection::*;
pub use copy::*;
pub use cutover::*;
pub use engine::*;
pub use retry::*;
pub use sync::*;
pub use throttle::*;

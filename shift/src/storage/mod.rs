mod base;
mod topology;

pub use base::*;
pub use topology::{StaticTopology, Topology};

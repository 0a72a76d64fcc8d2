#![doc = include_str!("../README.md")]

pub mod bus;
mod evaluator;
mod pipeline;
mod propagation;
mod publisher;
mod storage;
mod subscriber;
pub mod telemetry;

pub use crate::evaluator::*;
pub use crate::pipeline::*;
pub use crate::propagation::*;
pub use crate::publisher::*;
pub use crate::storage::*;
pub use crate::subscriber::*;
// Public re-export so downstream crates can access the wire contract via
// `calcbus::wire`
pub use calcbus_wire as wire;

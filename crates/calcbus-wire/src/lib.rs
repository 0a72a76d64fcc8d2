#![doc = include_str!("../README.md")]

mod channel;
mod domain;
mod envelope;
mod error;
mod payload;

pub use crate::channel::*;
pub use crate::domain::*;
pub use crate::envelope::*;
pub use crate::error::*;
pub use crate::payload::*;

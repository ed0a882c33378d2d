#![allow(non_camel_case_types, clippy::upper_case_acronyms)]

pub mod bus;
pub mod cache;
pub mod config;
pub mod interconn;
pub mod mem_event;
pub mod mshr;
pub mod sim;
pub mod stats;
pub mod tag_array;

pub use cache::Cache;
pub use config::Config;
pub use interconn::{Channels, Payload, SourceKind};
pub use mem_event::{Command, MemEvent};
pub use stats::Stats;

/// A memory address.
pub type address = u64;

/// Simulated time, in picoseconds.
pub type Time = u64;

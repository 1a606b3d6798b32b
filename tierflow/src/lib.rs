//! tierflow library crate.
//!
//! Size-tiered dispatch of file-processing work onto remote compute, and
//! supervision of that work to a single structured outcome.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod platform;
pub mod queue;
pub mod scheduler;
pub mod sensor;
pub mod supervisor;

pub use error::{Error, Result};

//! `taskq-core` — configuration and identifiers shared by every taskq crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::TaskqConfig;
pub use error::{Result, TaskqError};
pub use types::TaskId;

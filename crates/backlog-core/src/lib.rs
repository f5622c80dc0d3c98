//! `backlog-core` — configuration and shared error types for the backlog
//! job queue workspace.

pub mod config;
pub mod error;

pub use config::BacklogConfig;
pub use error::{BacklogError, Result};

//! # matchcast Common Library
//!
//! Shared code for the matchcast services including:
//! - Error and Result types
//! - Configuration loading (TOML + environment + CLI overrides)
//! - Topic identifiers
//! - Wire event types (LiveEvent, ClientMessage, ScoreResult)
//! - Database initialization and the record store
//! - Calendar expressions for scheduled maintenance
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod schedule;
pub mod time;
pub mod topic;

pub use error::{Error, Result};
pub use topic::Topic;

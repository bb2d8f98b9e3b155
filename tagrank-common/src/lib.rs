//! # tagrank common library
//!
//! Shared code for the tag prominence and ranking services:
//! - Error type and result alias
//! - Configuration loading (TOML + environment + compiled defaults)
//! - Domain models (tags, assignments, summaries, metrics, rules)
//! - SQLite schema creation and versioned migrations
//! - Engine event bus
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{Error, Result, ValidationError};
pub use models::{Prominence, TagId, TagType, WorkId};

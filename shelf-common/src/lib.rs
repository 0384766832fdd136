//! # Shelf Common Library
//!
//! Shared code for the shelf genre-enrichment services including:
//! - Error type shared by every storage and configuration path
//! - Configuration file and root folder resolution
//! - Event types (EnrichEvent enum) and the broadcast event bus
//! - SQLite pool initialization

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};

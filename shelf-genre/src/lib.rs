//! shelf-genre library interface
//!
//! Book genre enrichment with a distributed fan-out / fan-in workflow:
//! - `services`: source clients (Goodreads, Google Books, Open Library),
//!   genre normalization and the per-book enricher
//! - `workflow`: work distributor, queue workers and aggregator
//! - `db`: SQLite-backed blob store, job records and work queue

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod types;
pub mod utils;
pub mod workflow;

pub use crate::config::EnrichConfig;
pub use crate::db::Stores;
pub use crate::error::{FetchError, WorkflowError, WorkflowResult};
pub use crate::services::BookEnricher;
pub use crate::workflow::{Aggregator, WorkDistributor, Worker, WorkerPool};

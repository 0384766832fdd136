//! Test Helper Utilities
//!
//! Shared utilities for shelf-genre integration tests. Nothing here touches
//! the network: sources are scripted and HTTP goes through a fake transport.

#![allow(dead_code)]

pub mod db_utils;
pub mod sources;
pub mod transport;

pub use db_utils::{create_test_stores, fast_worker_config, FailingQueue};
pub use sources::{build_enricher, Reply, ScriptedSource};
pub use transport::FakeTransport;

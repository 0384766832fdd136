//! Configuration for shelf-genre
//!
//! Resolution: TOML file (every field defaulted) → environment overrides.
//! File location is resolved by `shelf_common::config::locate_config_file`.

use serde::{Deserialize, Serialize};
use shelf_common::config::{env_override, load_toml_config};
use shelf_common::{Error, Result};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Service name; also the config file stem (`shelf-genre.toml`)
pub const SERVICE_NAME: &str = "shelf-genre";

/// Environment override for the Google Books API key
pub const GOOGLE_API_KEY_ENV: &str = "SHELF_GOOGLE_API_KEY";

/// Environment override for worker concurrency
pub const WORKER_CONCURRENCY_ENV: &str = "SHELF_WORKER_CONCURRENCY";

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    pub http: HttpSettings,
    pub retry: RetryPolicy,
    pub sources: SourceSettings,
    pub normalizer: NormalizerConfig,
    pub distributor: DistributorConfig,
    pub worker: WorkerConfig,
    pub aggregator: AggregatorConfig,
}

impl EnrichConfig {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: EnrichConfig = load_toml_config(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(key) = env_override(GOOGLE_API_KEY_ENV) {
            info!("Google Books API key loaded from environment variable");
            self.sources.google_api_key = Some(key);
        }

        if let Some(raw) = env_override(WORKER_CONCURRENCY_ENV) {
            let value = raw.trim().parse::<usize>().map_err(|e| {
                Error::Config(format!("{} must be a positive integer: {}", WORKER_CONCURRENCY_ENV, e))
            })?;
            self.worker.concurrency = value;
        }

        Ok(())
    }

    /// Reject settings that would stall the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.worker.concurrency == 0 {
            return Err(Error::Config("worker.concurrency must be at least 1".to_string()));
        }
        if self.worker.max_deliveries == 0 {
            return Err(Error::Config("worker.max_deliveries must be at least 1".to_string()));
        }
        if self.distributor.items_per_message == 0 {
            return Err(Error::Config(
                "distributor.items_per_message must be at least 1".to_string(),
            ));
        }
        if self.distributor.max_messages_per_job == Some(0) {
            return Err(Error::Config(
                "distributor.max_messages_per_job must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP client settings shared by all sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// API user agent; defaults to `shelf_common::config::user_agent()`
    pub user_agent: Option<String>,
    /// Browser-like user agent for the Goodreads scraper
    pub scraper_user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 5,
            user_agent: None,
            scraper_user_agent:
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36".to_string(),
        }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn api_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(shelf_common::config::user_agent)
    }
}

/// Retry bound and backoff shape for the source client
///
/// Delay before retry `n` (0-based): `base * 2^n + jitter`, where a 429
/// uses `rate_limited_delay_ms` as base and a larger jitter window, so a
/// rate-limited wait is always longer than a plain transient one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    pub rate_limited_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            jitter_ms: 500,
            rate_limited_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `retry` (0-based); `jitter` is a sample from `[0, 1)`
    pub fn delay(&self, retry: u32, rate_limited: bool, jitter: f64) -> Duration {
        let jitter = jitter.clamp(0.0, 1.0);
        let factor = 2u64.saturating_pow(retry.min(32));
        let ms = if rate_limited {
            // base * 2^n + uniform(1, 3) * base
            let unit = self.rate_limited_delay_ms;
            unit.saturating_mul(factor)
                .saturating_add(unit)
                .saturating_add((unit as f64 * 2.0 * jitter) as u64)
        } else {
            self.base_delay_ms
                .saturating_mul(factor)
                .saturating_add((self.jitter_ms as f64 * jitter) as u64)
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Per-source endpoints, rate limits and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub goodreads_base_url: String,
    pub google_books_base_url: String,
    pub open_library_base_url: String,
    /// Requests per second; 0 disables the limiter
    pub goodreads_rps: u32,
    pub google_books_rps: u32,
    pub open_library_rps: u32,
    pub google_api_key: Option<String>,
    /// `maxResults` for Google Books queries
    pub google_max_results: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            goodreads_base_url: "https://www.goodreads.com".to_string(),
            google_books_base_url: "https://www.googleapis.com/books/v1".to_string(),
            open_library_base_url: "https://openlibrary.org".to_string(),
            goodreads_rps: 2,
            google_books_rps: 5,
            open_library_rps: 5,
            google_api_key: None,
            google_max_results: 5,
        }
    }
}

/// Genre noise filtering thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Entries shorter than this (in chars) are dropped
    pub min_length: usize,
    /// Entries longer than this are dropped (sentences, not genres)
    pub max_length: usize,
    /// Drop pure numbers and year/date tokens ("1984", "1990s", "2001-05-03")
    pub drop_date_like: bool,
    /// Drop "… century" entries
    pub drop_century: bool,
    /// Prefixes stripped before anything else (ASCII case-insensitive)
    pub strip_prefixes: Vec<String>,
    /// Format terms that are never genres (compared case-insensitively)
    pub excluded_terms: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_length: 2,
            max_length: 80,
            drop_date_like: true,
            drop_century: true,
            strip_prefixes: vec!["nyt:".to_string(), "New York Times".to_string()],
            excluded_terms: ["audiobook", "audiobooks", "audio book", "audio books", "audible"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Fan-out shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Books per queue message
    pub items_per_message: usize,
    /// Cap on messages per job; batches grow to stay under it
    pub max_messages_per_job: Option<usize>,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            items_per_message: 1,
            max_messages_per_job: None,
        }
    }
}

impl DistributorConfig {
    /// Books per message for a job of `total` books
    pub fn batch_size(&self, total: usize) -> usize {
        let configured = self.items_per_message.max(1);
        match self.max_messages_per_job {
            Some(cap) if cap > 0 && total > 0 => configured.max(total.div_ceil(cap)),
            _ => configured,
        }
    }
}

/// Worker pool settings
///
/// `concurrency` is the number of independent pulling workers and should
/// match what the host actually sustains, not a nominal ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Deliveries before a message is dead-lettered
    pub max_deliveries: u32,
    /// Visibility timeout of a received message
    pub lease_secs: u64,
    /// Per-book invocation timeout
    pub item_timeout_secs: u64,
    /// Sleep between polls of an empty queue
    pub poll_interval_ms: u64,
    /// Delay before a failed message becomes visible again
    pub redelivery_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            max_deliveries: 3,
            lease_secs: 300,
            item_timeout_secs: 120,
            poll_interval_ms: 500,
            redelivery_delay_ms: 2_000,
        }
    }
}

impl WorkerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

/// Aggregator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub interval_secs: u64,
    /// Processing jobs older than this move to error; `None` waits forever
    pub job_timeout_secs: Option<u64>,
    /// Genres listed in the report summary
    pub top_genres: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            job_timeout_secs: Some(6 * 60 * 60),
            top_genres: 25,
        }
    }
}

impl AggregatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

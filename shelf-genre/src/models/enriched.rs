//! Per-book enrichment accumulator and per-source response records

use super::book::{BookIdentity, ItemKey};
use crate::services::genre_merger::GenreNormalizer;
use crate::services::goodreads::GoodreadsPage;
use crate::services::google_books::GoogleVolumes;
use crate::services::open_library::OpenLibraryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// External genre source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Goodreads book page scraper (primary)
    Goodreads,
    /// Google Books volumes API (fallback)
    GoogleBooks,
    /// Open Library edition/work APIs (fallback)
    OpenLibrary,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::Goodreads,
        SourceKind::GoogleBooks,
        SourceKind::OpenLibrary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Goodreads => "goodreads",
            SourceKind::GoogleBooks => "google_books",
            SourceKind::OpenLibrary => "open_library",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a source call ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// Payload retrieved and it carried genres
    Success,
    /// Call succeeded but nothing usable came back
    Empty,
    /// Call failed after retries (or permanently)
    Error { message: String },
}

/// Source-specific payload, one variant per source
///
/// Each variant has its own processor; nothing inspects payload shape at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourcePayload {
    Goodreads(GoodreadsPage),
    GoogleBooks(GoogleVolumes),
    OpenLibrary(OpenLibraryRecord),
}

impl SourcePayload {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourcePayload::Goodreads(_) => SourceKind::Goodreads,
            SourcePayload::GoogleBooks(_) => SourceKind::GoogleBooks,
            SourcePayload::OpenLibrary(_) => SourceKind::OpenLibrary,
        }
    }

    /// Run this payload's processor
    pub fn process(&self) -> ProcessedGenreSet {
        let genres = match self {
            SourcePayload::Goodreads(page) => crate::services::goodreads::process_page(page),
            SourcePayload::GoogleBooks(volumes) => {
                crate::services::google_books::process_volumes(volumes)
            }
            SourcePayload::OpenLibrary(record) => {
                crate::services::open_library::process_record(record)
            }
        };
        ProcessedGenreSet {
            source: self.kind(),
            genres,
        }
    }

    /// Cover or thumbnail URL carried by the payload
    pub fn image_url(&self) -> Option<String> {
        match self {
            SourcePayload::Goodreads(page) => page.cover_url.clone(),
            SourcePayload::GoogleBooks(volumes) => volumes.thumbnail_url(),
            SourcePayload::OpenLibrary(record) => record.cover_url(),
        }
    }
}

/// One source call as recorded on the book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceResponse {
    pub source: SourceKind,
    pub outcome: FetchOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SourcePayload>,
    pub fetched_at: DateTime<Utc>,
}

/// Genre strings extracted by one source's processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedGenreSet {
    pub source: SourceKind,
    pub genres: Vec<String>,
}

impl ProcessedGenreSet {
    pub fn empty(source: SourceKind) -> Self {
        Self {
            source,
            genres: Vec::new(),
        }
    }

    pub fn new(source: SourceKind, genres: Vec<String>) -> Self {
        Self { source, genres }
    }

    pub fn is_empty(&self) -> bool {
        self.genres.is_empty()
    }
}

/// Whether a source contributed genres for this book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFlag {
    pub source: SourceKind,
    pub success: bool,
}

/// Enrichment result for one book
///
/// `final_genres` is private: it only changes through [`EnrichedBook::finalize`],
/// which recomputes it from the processed sets. The processing log is
/// append-only through [`EnrichedBook::log`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedBook {
    pub identity: BookIdentity,
    pub item_key: ItemKey,
    #[serde(default)]
    pub raw_responses: Vec<RawSourceResponse>,
    #[serde(default)]
    pub processed: Vec<ProcessedGenreSet>,
    #[serde(default)]
    final_genres: Vec<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    pub source_success: Vec<SourceFlag>,
    /// Sources whose processed set was non-empty
    #[serde(default)]
    pub genre_sources: Vec<SourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    processing_log: Vec<String>,
    /// Written on worker invocation failure rather than by the enricher
    #[serde(default)]
    placeholder: bool,
    pub enriched_at: DateTime<Utc>,
}

impl EnrichedBook {
    pub fn new(identity: BookIdentity) -> Self {
        let item_key = identity.item_key();
        Self {
            identity,
            item_key,
            raw_responses: Vec::new(),
            processed: Vec::new(),
            final_genres: Vec::new(),
            success: false,
            source_success: Vec::new(),
            genre_sources: Vec::new(),
            thumbnail_url: None,
            processing_log: Vec::new(),
            placeholder: false,
            enriched_at: Utc::now(),
        }
    }

    /// Failure record for an item whose enrichment never produced a result
    pub fn failure_placeholder(identity: BookIdentity, reason: impl Into<String>) -> Self {
        let mut book = Self::new(identity);
        book.placeholder = true;
        book.log(format!("Enrichment failed: {}", reason.into()));
        book
    }

    /// Append to the processing log
    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(item_key = %self.item_key, "{}", message);
        self.processing_log.push(message);
    }

    /// Record one source call together with its processed genres
    pub fn record_source(&mut self, response: RawSourceResponse, processed: ProcessedGenreSet) {
        let success = matches!(response.outcome, FetchOutcome::Success) && !processed.is_empty();
        self.source_success.retain(|f| f.source != response.source);
        self.source_success.push(SourceFlag {
            source: response.source,
            success,
        });
        if self.thumbnail_url.is_none() {
            self.thumbnail_url = response.payload.as_ref().and_then(SourcePayload::image_url);
        }
        self.raw_responses.push(response);
        self.processed.retain(|p| p.source != processed.source);
        self.processed.push(processed);
    }

    /// Recompute `final_genres`, `success` and `genre_sources` from the processed sets
    pub fn finalize(&mut self, normalizer: &GenreNormalizer) {
        self.final_genres = normalizer.merge(&self.processed);
        self.success = !self.final_genres.is_empty();
        self.genre_sources = self
            .processed
            .iter()
            .filter(|p| !normalizer.merge(std::slice::from_ref(p)).is_empty())
            .map(|p| p.source)
            .collect();
    }

    pub fn final_genres(&self) -> &[String] {
        &self.final_genres
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn processing_log(&self) -> &[String] {
        &self.processing_log
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// Whether a source contributed genres; `false` when it was never called
    pub fn source_succeeded(&self, source: SourceKind) -> bool {
        self.source_success
            .iter()
            .any(|f| f.source == source && f.success)
    }

    /// Whether a source was called at all
    pub fn source_attempted(&self, source: SourceKind) -> bool {
        self.raw_responses.iter().any(|r| r.source == source)
    }
}

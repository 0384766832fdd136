//! Per-book enrichment: primary scraper, then parallel API fallback
//!
//! **Algorithm:**
//! 1. With an external id, ask Goodreads. A non-empty genre list is final;
//!    the fallback sources are not called.
//! 2. Otherwise call Google Books and Open Library concurrently, wait for
//!    both, and merge whatever they returned.
//!
//! Enrichment never fails: a book no source knows about comes back with
//! no genres and `success == false`. Every decision goes to the book's
//! processing log.

use crate::config::EnrichConfig;
use crate::models::{
    BookIdentity, EnrichedBook, FetchOutcome, ProcessedGenreSet, RawSourceResponse, SourceKind,
};
use crate::services::genre_merger::GenreNormalizer;
use crate::services::goodreads::GoodreadsScraper;
use crate::services::google_books::GoogleBooksClient;
use crate::services::open_library::OpenLibraryClient;
use crate::services::source_client::{HttpTransport, ReqwestTransport, ResilientClient};
use crate::types::GenreSource;
use chrono::Utc;
use shelf_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Primary-then-fallback enricher, shared by all workers
pub struct BookEnricher {
    scraper: Arc<dyn GenreSource>,
    google_books: Arc<dyn GenreSource>,
    open_library: Arc<dyn GenreSource>,
    normalizer: GenreNormalizer,
}

impl BookEnricher {
    pub fn new(
        scraper: Arc<dyn GenreSource>,
        google_books: Arc<dyn GenreSource>,
        open_library: Arc<dyn GenreSource>,
        normalizer: GenreNormalizer,
    ) -> Self {
        Self {
            scraper,
            google_books,
            open_library,
            normalizer,
        }
    }

    /// Build the real HTTP-backed sources
    pub fn from_config(config: &EnrichConfig) -> Result<Self> {
        let build = |user_agent: &str| -> Result<Arc<dyn HttpTransport>> {
            let transport = ReqwestTransport::new(&config.http, user_agent)
                .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
            Ok(Arc::new(transport))
        };
        let api_transport = build(&config.http.api_user_agent())?;
        let scraper_transport = build(&config.http.scraper_user_agent)?;
        let sources = &config.sources;

        let scraper = GoodreadsScraper::new(
            ResilientClient::new(
                SourceKind::Goodreads,
                scraper_transport,
                config.retry.clone(),
            )
            .with_rate_limit(sources.goodreads_rps),
            sources.goodreads_base_url.clone(),
        );

        let google_books = GoogleBooksClient::new(
            ResilientClient::new(
                SourceKind::GoogleBooks,
                api_transport.clone(),
                config.retry.clone(),
            )
            .with_rate_limit(sources.google_books_rps),
            sources.google_books_base_url.clone(),
        )
        .with_api_key(sources.google_api_key.clone())
        .with_max_results(sources.google_max_results);

        let open_library = OpenLibraryClient::new(
            ResilientClient::new(
                SourceKind::OpenLibrary,
                api_transport,
                config.retry.clone(),
            )
            .with_rate_limit(sources.open_library_rps),
            sources.open_library_base_url.clone(),
        );

        Ok(Self::new(
            Arc::new(scraper),
            Arc::new(google_books),
            Arc::new(open_library),
            GenreNormalizer::new(config.normalizer.clone()),
        ))
    }

    /// Enrich one book
    pub async fn enrich(&self, book: &BookIdentity) -> EnrichedBook {
        let mut enriched = EnrichedBook::new(book.clone());
        debug!(item_key = %enriched.item_key, book = %book.label(), "Enriching book");

        match book.external_id() {
            Some(external_id) => {
                let (response, processed) = call_source(self.scraper.as_ref(), book).await;
                let outcome = describe(&response.outcome, processed.genres.len());
                enriched.log(format!("{} (id {}): {}", response.source, external_id, outcome));
                enriched.record_source(response, processed);

                // Decided on normalized genres: a page of noise is no answer
                enriched.finalize(&self.normalizer);
                if enriched.success() {
                    enriched.log(format!(
                        "Primary source succeeded; fallback skipped; {} final genres",
                        enriched.final_genres().len()
                    ));
                    info!(
                        item_key = %enriched.item_key,
                        genres = enriched.final_genres().len(),
                        "Enriched from primary source"
                    );
                    return enriched;
                }
                enriched.log("Primary source returned no usable genres; using fallback sources");
            }
            None => enriched.log("No external id; using fallback sources"),
        }

        // Both fallbacks always run to completion before merging
        let (google, open_library) = tokio::join!(
            call_source(self.google_books.as_ref(), book),
            call_source(self.open_library.as_ref(), book),
        );

        for (response, processed) in [google, open_library] {
            let outcome = describe(&response.outcome, processed.genres.len());
            enriched.log(format!("{}: {}", response.source, outcome));
            enriched.record_source(response, processed);
        }

        enriched.finalize(&self.normalizer);
        if enriched.success() {
            let sources: Vec<&str> = enriched.genre_sources.iter().map(|s| s.as_str()).collect();
            enriched.log(format!(
                "Merged {} final genres from {}",
                enriched.final_genres().len(),
                sources.join(", ")
            ));
        } else {
            enriched.log("No genres found from any source");
        }

        info!(
            item_key = %enriched.item_key,
            genres = enriched.final_genres().len(),
            success = enriched.success(),
            "Enriched from fallback sources"
        );
        enriched
    }
}

/// Call one source and run its processor; failures become data
async fn call_source(
    source: &dyn GenreSource,
    book: &BookIdentity,
) -> (RawSourceResponse, ProcessedGenreSet) {
    let kind = source.kind();
    let result = source.fetch(book).await;
    let fetched_at = Utc::now();

    match result {
        Ok(Some(payload)) => {
            let processed = payload.process();
            let outcome = if processed.is_empty() {
                FetchOutcome::Empty
            } else {
                FetchOutcome::Success
            };
            (
                RawSourceResponse {
                    source: kind,
                    outcome,
                    payload: Some(payload),
                    fetched_at,
                },
                processed,
            )
        }
        Ok(None) => (
            RawSourceResponse {
                source: kind,
                outcome: FetchOutcome::Empty,
                payload: None,
                fetched_at,
            },
            ProcessedGenreSet::empty(kind),
        ),
        Err(err) => {
            debug!(source = %kind, error = %err, "Source failed");
            (
                RawSourceResponse {
                    source: kind,
                    outcome: FetchOutcome::Error {
                        message: err.to_string(),
                    },
                    payload: None,
                    fetched_at,
                },
                ProcessedGenreSet::empty(kind),
            )
        }
    }
}

fn describe(outcome: &FetchOutcome, genres: usize) -> String {
    match outcome {
        FetchOutcome::Success => format!("{} genres", genres),
        FetchOutcome::Empty => "no genres".to_string(),
        FetchOutcome::Error { message } => format!("failed ({})", message),
    }
}

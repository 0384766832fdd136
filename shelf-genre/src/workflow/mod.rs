//! Fan-out / fan-in workflow
//!
//! ```text
//! books ─► WorkDistributor ─► WorkQueue ─► Worker × N ─► results/{job}/{item}
//!                                                              │
//!                          reports/{job} ◄─ Aggregator scan ◄──┘
//! ```
//!
//! The three stages share nothing but the [`Stores`](crate::db::Stores):
//! each can run in its own process, and any of them may run more than once
//! for the same job without corrupting it.

pub mod aggregator;
pub mod distributor;
pub mod worker;

pub use aggregator::{load_report, Aggregator, ScanOutcome};
pub use distributor::WorkDistributor;
pub use worker::{DeliveryOutcome, PoolStats, Worker, WorkerPool};

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted genre sources for workflow tests

    use crate::config::NormalizerConfig;
    use crate::error::FetchError;
    use crate::models::{BookIdentity, SourceKind, SourcePayload};
    use crate::services::google_books::{GoogleVolume, GoogleVolumes, VolumeInfo};
    use crate::services::open_library::{OpenLibraryRecord, OpenLibraryWork, Subject};
    use crate::services::{BookEnricher, GenreNormalizer, GoodreadsPage};
    use crate::types::GenreSource;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    pub enum Reply {
        Genres(Vec<&'static str>),
        Fail,
        Panic,
    }

    /// Answers by book title; unknown titles get `Ok(None)`
    pub struct ScriptedSource {
        kind: SourceKind,
        replies: HashMap<String, Reply>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn new(kind: SourceKind) -> Self {
            Self {
                kind,
                replies: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn reply(mut self, title: &str, reply: Reply) -> Self {
            self.replies.insert(title.to_string(), reply);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl GenreSource for ScriptedSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn fetch(&self, book: &BookIdentity) -> Result<Option<SourcePayload>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let genres = match self.replies.get(&book.title) {
                None => return Ok(None),
                Some(Reply::Fail) => {
                    return Err(FetchError::Transient {
                        source_kind: self.kind,
                        attempts: 3,
                        reason: "HTTP 503".to_string(),
                    })
                }
                Some(Reply::Panic) => panic!("scripted panic for {}", book.title),
                Some(Reply::Genres(genres)) => genres.iter().map(|g| g.to_string()).collect(),
            };
            Ok(Some(payload(self.kind, book, genres)))
        }
    }

    fn payload(kind: SourceKind, book: &BookIdentity, genres: Vec<String>) -> SourcePayload {
        match kind {
            SourceKind::Goodreads => SourcePayload::Goodreads(GoodreadsPage {
                book_id: book.external_id().unwrap_or_default().to_string(),
                url: String::new(),
                genres,
                cover_url: None,
            }),
            SourceKind::GoogleBooks => SourcePayload::GoogleBooks(GoogleVolumes {
                total_items: 1,
                items: vec![GoogleVolume {
                    id: "v1".to_string(),
                    volume_info: VolumeInfo {
                        categories: genres,
                        ..VolumeInfo::default()
                    },
                }],
                query: None,
            }),
            SourceKind::OpenLibrary => SourcePayload::OpenLibrary(OpenLibraryRecord {
                work: Some(OpenLibraryWork {
                    subjects: genres.into_iter().map(Subject::Name).collect(),
                    ..OpenLibraryWork::default()
                }),
                ..OpenLibraryRecord::default()
            }),
        }
    }

    pub fn enricher(
        scraper: ScriptedSource,
        google_books: ScriptedSource,
        open_library: ScriptedSource,
    ) -> Arc<BookEnricher> {
        Arc::new(BookEnricher::new(
            Arc::new(scraper),
            Arc::new(google_books),
            Arc::new(open_library),
            GenreNormalizer::new(NormalizerConfig::default()),
        ))
    }

    /// Enricher whose sources know nothing
    pub fn silent_enricher() -> Arc<BookEnricher> {
        enricher(
            ScriptedSource::new(SourceKind::Goodreads),
            ScriptedSource::new(SourceKind::GoogleBooks),
            ScriptedSource::new(SourceKind::OpenLibrary),
        )
    }
}

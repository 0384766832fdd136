//! Scripted genre sources with call recording

use shelf_genre::config::NormalizerConfig;
use shelf_genre::models::{BookIdentity, SourceKind, SourcePayload};
use shelf_genre::services::google_books::{GoogleVolume, GoogleVolumes, VolumeInfo};
use shelf_genre::services::open_library::{OpenLibraryRecord, OpenLibraryWork, Subject};
use shelf_genre::services::{BookEnricher, GenreNormalizer, GoodreadsPage};
use shelf_genre::types::GenreSource;
use shelf_genre::FetchError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum Reply {
    Genres(Vec<&'static str>),
    Fail,
    Panic,
}

/// Answers by book title; unknown titles get `Ok(None)`
pub struct ScriptedSource {
    kind: SourceKind,
    replies: HashMap<String, Reply>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            replies: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, title: &str, reply: Reply) -> Self {
        self.replies.insert(title.to_string(), reply);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Titles fetched so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, title: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| *t == title).count()
    }
}

#[async_trait::async_trait]
impl GenreSource for ScriptedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, book: &BookIdentity) -> Result<Option<SourcePayload>, FetchError> {
        self.calls.lock().unwrap().push(book.title.clone());

        let genres: Vec<String> = match self.replies.get(&book.title) {
            None => return Ok(None),
            Some(Reply::Fail) => {
                return Err(FetchError::Permanent {
                    source_kind: self.kind,
                    status: Some(404),
                    reason: "not found".to_string(),
                })
            }
            Some(Reply::Panic) => panic!("scripted panic for {}", book.title),
            Some(Reply::Genres(genres)) => genres.iter().map(|g| g.to_string()).collect(),
        };

        Ok(Some(match self.kind {
            SourceKind::Goodreads => SourcePayload::Goodreads(GoodreadsPage {
                book_id: book.external_id().unwrap_or_default().to_string(),
                url: format!("https://goodreads.test/book/show/{}", book.external_id().unwrap_or_default()),
                genres,
                cover_url: None,
            }),
            SourceKind::GoogleBooks => SourcePayload::GoogleBooks(GoogleVolumes {
                total_items: 1,
                items: vec![GoogleVolume {
                    id: "vol".to_string(),
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
        }))
    }
}

/// Enricher over three sources with the default normalizer
pub fn build_enricher(
    scraper: Arc<dyn GenreSource>,
    google_books: Arc<dyn GenreSource>,
    open_library: Arc<dyn GenreSource>,
) -> Arc<BookEnricher> {
    Arc::new(BookEnricher::new(
        scraper,
        google_books,
        open_library,
        GenreNormalizer::new(NormalizerConfig::default()),
    ))
}

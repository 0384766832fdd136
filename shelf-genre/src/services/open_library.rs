//! Open Library (fallback genre source)
//!
//! Two dependent lookups: the edition (`/isbn/{isbn}.json`) names its
//! work, and the work (`/works/{id}.json`) carries the richer subject
//! list. Without an ISBN, or when the edition is unknown, the work key
//! comes from `/search.json?title=&author=` instead.

use crate::error::FetchError;
use crate::models::{BookIdentity, SourceKind, SourcePayload};
use crate::services::source_client::{HttpRequest, ResilientClient};
use crate::types::GenreSource;
use serde::{Deserialize, Serialize};
use tracing::debug;

const COVERS_BASE_URL: &str = "https://covers.openlibrary.org/b/id";

/// Subject entry: plain string on works, `{name, url}` on some editions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    Name(String),
    Named { name: String },
}

impl Subject {
    pub fn name(&self) -> &str {
        match self {
            Subject::Name(name) | Subject::Named { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRef {
    pub key: String,
}

/// Edition record (`/isbn/{isbn}.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenLibraryEdition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub works: Vec<KeyRef>,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub covers: Vec<i64>,
}

/// Work record (`/works/{id}.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenLibraryWork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub covers: Vec<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SearchResponse {
    #[serde(rename = "numFound", default)]
    num_found: u64,
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchDoc {
    #[serde(default)]
    key: String,
    #[serde(default)]
    cover_i: Option<i64>,
}

/// Everything Open Library returned for one book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenLibraryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<OpenLibraryEdition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<OpenLibraryWork>,
    /// Bare work id, e.g. `OL45804W`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,
    /// Cover id reported by search, used when neither record has covers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_cover_id: Option<i64>,
}

impl OpenLibraryRecord {
    pub fn is_empty(&self) -> bool {
        self.edition.is_none() && self.work.is_none()
    }

    /// Medium-size cover image URL
    pub fn cover_url(&self) -> Option<String> {
        let edition_covers = self.edition.iter().flat_map(|e| e.covers.iter());
        let work_covers = self.work.iter().flat_map(|w| w.covers.iter());
        edition_covers
            .chain(work_covers)
            .chain(self.search_cover_id.iter())
            .find(|id| **id > 0)
            .map(|id| format!("{}/{}-M.jpg", COVERS_BASE_URL, id))
    }
}

/// Subjects from edition then work, first occurrence kept
pub fn process_record(record: &OpenLibraryRecord) -> Vec<String> {
    let edition_subjects = record.edition.iter().flat_map(|e| e.subjects.iter());
    let work_subjects = record.work.iter().flat_map(|w| w.subjects.iter());

    let mut subjects: Vec<String> = Vec::new();
    for subject in edition_subjects.chain(work_subjects) {
        let name = subject.name().trim();
        if !name.is_empty() && !subjects.iter().any(|s| s == name) {
            subjects.push(name.to_string());
        }
    }
    subjects
}

/// `OL45804W` from `/works/OL45804W`
fn work_id_from_key(key: &str) -> Option<String> {
    key.strip_prefix("/works/")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn is_not_found(err: &FetchError) -> bool {
    matches!(err, FetchError::Permanent { status: Some(404), .. })
}

/// Open Library client
pub struct OpenLibraryClient {
    client: ResilientClient,
    base_url: String,
}

impl OpenLibraryClient {
    pub fn new(client: ResilientClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn search(&self, book: &BookIdentity) -> Result<Option<SearchDoc>, FetchError> {
        let request = HttpRequest::get(format!("{}/search.json", self.base_url))
            .query("title", book.title.trim())
            .query("author", book.author.trim())
            .query("limit", "5");
        let response: SearchResponse = self.client.attempt_json(&request).await?;
        if response.num_found == 0 {
            return Ok(None);
        }
        Ok(response
            .docs
            .into_iter()
            .find(|doc| work_id_from_key(&doc.key).is_some()))
    }
}

#[async_trait::async_trait]
impl GenreSource for OpenLibraryClient {
    fn kind(&self) -> SourceKind {
        SourceKind::OpenLibrary
    }

    /// A failed step does not stop the next one. The last non-404 failure
    /// is returned only when nothing at all was retrieved.
    async fn fetch(&self, book: &BookIdentity) -> Result<Option<SourcePayload>, FetchError> {
        let mut record = OpenLibraryRecord::default();
        let mut last_error = None;

        if let Some(isbn) = book.best_isbn() {
            let request = HttpRequest::get(format!("{}/isbn/{}.json", self.base_url, isbn));
            match self.client.attempt_json::<OpenLibraryEdition>(&request).await {
                Ok(edition) => {
                    record.work_id = edition
                        .works
                        .iter()
                        .find_map(|w| work_id_from_key(&w.key));
                    debug!(isbn = %isbn, work_id = ?record.work_id, "Open Library edition found");
                    record.edition = Some(edition);
                }
                Err(err) if is_not_found(&err) => debug!(isbn = %isbn, "No Open Library edition"),
                Err(err) => {
                    debug!(isbn = %isbn, error = %err, "Open Library edition lookup failed");
                    last_error = Some(err);
                }
            }
        }

        if record.work_id.is_none() && !book.title.trim().is_empty() {
            match self.search(book).await {
                Ok(Some(doc)) => {
                    record.work_id = work_id_from_key(&doc.key);
                    record.search_cover_id = doc.cover_i;
                    debug!(work_id = ?record.work_id, "Open Library search match");
                }
                Ok(None) => debug!(book = %book.label(), "No Open Library search match"),
                Err(err) => {
                    debug!(error = %err, "Open Library search failed");
                    last_error = Some(err);
                }
            }
        }

        if let Some(work_id) = record.work_id.clone() {
            let request = HttpRequest::get(format!("{}/works/{}.json", self.base_url, work_id));
            match self.client.attempt_json::<OpenLibraryWork>(&request).await {
                Ok(work) => record.work = Some(work),
                Err(err) if is_not_found(&err) => debug!(work_id = %work_id, "Open Library work missing"),
                Err(err) => {
                    debug!(work_id = %work_id, error = %err, "Open Library work lookup failed");
                    last_error = Some(err);
                }
            }
        }

        if !record.is_empty() {
            return Ok(Some(SourcePayload::OpenLibrary(record)));
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

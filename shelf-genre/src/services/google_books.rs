//! Google Books volumes API (fallback genre source)
//!
//! Query order: `isbn:{isbn13}`, then `isbn:{isbn}` when it differs, then
//! `intitle:"…" inauthor:"…"`. The first query with results wins.

use crate::error::FetchError;
use crate::models::{BookIdentity, SourceKind, SourcePayload};
use crate::services::source_client::{HttpRequest, ResilientClient};
use crate::types::GenreSource;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Volumes search response, plus the query that produced it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleVolumes {
    #[serde(default)]
    pub total_items: u32,
    #[serde(default)]
    pub items: Vec<GoogleVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleVolume {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub volume_info: VolumeInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_category: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_links: Option<ImageLinks>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl GoogleVolumes {
    /// First thumbnail across the returned volumes
    pub fn thumbnail_url(&self) -> Option<String> {
        self.items
            .iter()
            .filter_map(|v| v.volume_info.image_links.as_ref())
            .find_map(|links| links.thumbnail.clone().or_else(|| links.small_thumbnail.clone()))
    }
}

/// `mainCategory` and `categories` of every volume, first occurrence kept
pub fn process_volumes(volumes: &GoogleVolumes) -> Vec<String> {
    let mut genres: Vec<String> = Vec::new();
    for volume in &volumes.items {
        let info = &volume.volume_info;
        for category in info.main_category.iter().chain(info.categories.iter()) {
            let category = category.trim();
            if !category.is_empty() && !genres.iter().any(|g| g == category) {
                genres.push(category.to_string());
            }
        }
    }
    genres
}

/// Queries to try for a book, most specific first
pub fn build_queries(book: &BookIdentity) -> Vec<String> {
    let mut queries = Vec::new();

    let isbn13 = book.clean_isbn13();
    if let Some(isbn13) = &isbn13 {
        queries.push(format!("isbn:{}", isbn13));
    }
    if let Some(isbn) = book.clean_isbn() {
        if Some(&isbn) != isbn13.as_ref() {
            queries.push(format!("isbn:{}", isbn));
        }
    }

    let title = book.title.replace('"', "");
    let author = book.author.replace('"', "");
    let (title, author) = (title.trim(), author.trim());
    match (title.is_empty(), author.is_empty()) {
        (false, false) => queries.push(format!(r#"intitle:"{}" inauthor:"{}""#, title, author)),
        (false, true) => queries.push(format!(r#"intitle:"{}""#, title)),
        _ => {}
    }

    queries
}

/// Google Books client
pub struct GoogleBooksClient {
    client: ResilientClient,
    base_url: String,
    api_key: Option<String>,
    max_results: u32,
}

impl GoogleBooksClient {
    pub fn new(client: ResilientClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            max_results: 5,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    fn request(&self, query: &str) -> HttpRequest {
        let request = HttpRequest::get(format!("{}/volumes", self.base_url))
            .query("q", query)
            .query("projection", "full")
            .query("maxResults", self.max_results.to_string());
        match &self.api_key {
            Some(key) => request.query("key", key.as_str()),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl GenreSource for GoogleBooksClient {
    fn kind(&self) -> SourceKind {
        SourceKind::GoogleBooks
    }

    /// A failed query moves on to the next one. If no query got an answer,
    /// the last failure is returned.
    async fn fetch(&self, book: &BookIdentity) -> Result<Option<SourcePayload>, FetchError> {
        let mut answered = false;
        let mut last_error = None;

        for query in build_queries(book) {
            match self.client.attempt_json::<GoogleVolumes>(&self.request(&query)).await {
                Ok(mut volumes) => {
                    answered = true;
                    if volumes.total_items > 0 && !volumes.items.is_empty() {
                        debug!(query = %query, volumes = volumes.items.len(), "Google Books match");
                        volumes.query = Some(query);
                        return Ok(Some(SourcePayload::GoogleBooks(volumes)));
                    }
                    debug!(query = %query, "Google Books query returned no volumes");
                }
                Err(err) => {
                    debug!(query = %query, error = %err, "Google Books query failed, trying next");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if !answered => Err(err),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::source_client::testing::{fast_policy, ScriptedTransport};
    use crate::services::source_client::HttpResponse;
    use std::sync::Arc;

    const VOLUMES: &str = r#"{
        "totalItems": 2,
        "items": [
            {"id": "a", "volumeInfo": {"title": "Steve Jobs", "mainCategory": "Biography",
             "categories": ["Biography & Autobiography", "Biography"],
             "imageLinks": {"smallThumbnail": "http://img/s", "thumbnail": "http://img/t"}}},
            {"id": "b", "volumeInfo": {"categories": [" Business "]}}
        ]
    }"#;

    fn client(transport: Arc<ScriptedTransport>) -> GoogleBooksClient {
        GoogleBooksClient::new(
            ResilientClient::new(SourceKind::GoogleBooks, transport, fast_policy()),
            "https://gb.test",
        )
    }

    #[test]
    fn test_process_volumes_collects_categories() {
        let volumes: GoogleVolumes = serde_json::from_str(VOLUMES).unwrap();
        assert_eq!(
            process_volumes(&volumes),
            vec!["Biography", "Biography & Autobiography", "Business"]
        );
        assert_eq!(volumes.thumbnail_url().as_deref(), Some("http://img/t"));
    }

    #[test]
    fn test_query_order() {
        let book = BookIdentity::new("Dune", "Frank Herbert")
            .with_isbn13("=\"9780441013593\"")
            .with_isbn("0441013597");
        assert_eq!(
            build_queries(&book),
            vec![
                "isbn:9780441013593",
                "isbn:0441013597",
                r#"intitle:"Dune" inauthor:"Frank Herbert""#,
            ]
        );
    }

    #[tokio::test]
    async fn test_falls_through_to_title_author() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .ok("isbn:9780441013593", r#"{"totalItems": 0}"#)
                .ok("intitle:", VOLUMES),
        );
        let book = BookIdentity::new("Steve Jobs", "Walter Isaacson").with_isbn13("9780441013593");
        let payload = client(transport.clone()).fetch(&book).await.unwrap().unwrap();

        let SourcePayload::GoogleBooks(volumes) = payload else {
            panic!("expected a Google Books payload");
        };
        assert_eq!(
            volumes.query.as_deref(),
            Some(r#"intitle:"Steve Jobs" inauthor:"Walter Isaacson""#)
        );
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_no_match_is_none() {
        let transport = Arc::new(ScriptedTransport::new().ok("/volumes", r#"{"totalItems": 0}"#));
        let payload = client(transport)
            .fetch(&BookIdentity::new("Nothing", "Nobody"))
            .await
            .unwrap();
        assert!(payload.is_none());
    }

    #[tokio::test]
    async fn test_transient_isbn_failure_falls_through_to_title_query() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route("isbn:9780441013593", vec![Ok(HttpResponse::new(503, ""))])
                .ok("intitle:", VOLUMES),
        );
        let book = BookIdentity::new("Steve Jobs", "Walter Isaacson").with_isbn13("9780441013593");
        let payload = client(transport.clone()).fetch(&book).await.unwrap().unwrap();

        let SourcePayload::GoogleBooks(volumes) = payload else {
            panic!("expected Google Books payload");
        };
        assert!(volumes.query.unwrap().starts_with("intitle:"));
        let calls = transport.calls();
        assert_eq!(calls.iter().filter(|c| c.contains("isbn:")).count(), 3);
        assert!(calls.last().unwrap().contains("intitle:"));
    }

    #[tokio::test]
    async fn test_transient_failure_surfaces_when_no_query_answers() {
        let transport = Arc::new(
            ScriptedTransport::new().route("/volumes", vec![Ok(HttpResponse::new(503, ""))]),
        );
        let err = client(transport)
            .fetch(&BookIdentity::new("Dune", "Frank Herbert"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_api_key_is_sent() {
        let transport = Arc::new(ScriptedTransport::new().ok("/volumes", r#"{"totalItems": 0}"#));
        let client = client(transport.clone()).with_api_key(Some("secret".into()));
        client.fetch(&BookIdentity::new("Dune", "Frank Herbert")).await.unwrap();
        assert!(transport.calls()[0].contains("key=secret"));
    }
}

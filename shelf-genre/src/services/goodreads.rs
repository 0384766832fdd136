//! Goodreads book page scraper (primary genre source)
//!
//! Fetches `{base}/book/show/{id}` and reads the community genre shelf.
//! A page with no recognizable genre links is a valid "no genres" answer,
//! not an error.

use crate::error::FetchError;
use crate::models::{BookIdentity, SourceKind, SourcePayload};
use crate::services::source_client::{HttpRequest, ResilientClient};
use crate::types::GenreSource;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Genre links inside the genre list block
const PRIMARY_SELECTOR: &str = r#"[data-testid="genresList"] a[href*="/genres/"]"#;

/// Any genre link, for older page layouts
const FALLBACK_SELECTOR: &str = r#"a[href*="/genres/"]"#;

const COVER_SELECTOR: &str = r#"meta[property="og:image"]"#;

/// Fallback links at or over this length are navigation, not genres
const MAX_FALLBACK_GENRE_LEN: usize = 50;

/// Shelf names that describe a format rather than a genre
const EXCLUDED_GENRES: &[&str] = &["audiobook", "audiobooks", "audio book", "audio books", "audible"];

/// What was extracted from one Goodreads book page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodreadsPage {
    pub book_id: String,
    pub url: String,
    /// Genres in page order
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
}

fn selector(cell: &'static OnceLock<Selector>, css: &'static str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).expect("static CSS selector is valid"))
}

fn element_text(element: scraper::ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_excluded(genre: &str) -> bool {
    let lower = genre.to_lowercase();
    EXCLUDED_GENRES.contains(&lower.as_str())
}

/// Extract genre names from a book page
///
/// Uses the genre list block when present; otherwise falls back to any
/// genre link shorter than [`MAX_FALLBACK_GENRE_LEN`]. Order is kept and
/// exact duplicates are dropped.
pub fn parse_genres(html: &str) -> Vec<String> {
    static PRIMARY: OnceLock<Selector> = OnceLock::new();
    static FALLBACK: OnceLock<Selector> = OnceLock::new();

    let document = Html::parse_document(html);
    let mut genres: Vec<String> = Vec::new();

    for element in document.select(selector(&PRIMARY, PRIMARY_SELECTOR)) {
        let genre = element_text(element);
        if !genre.is_empty() && !is_excluded(&genre) && !genres.contains(&genre) {
            genres.push(genre);
        }
    }

    if genres.is_empty() {
        for element in document.select(selector(&FALLBACK, FALLBACK_SELECTOR)) {
            let genre = element_text(element);
            if !genre.is_empty()
                && genre.chars().count() < MAX_FALLBACK_GENRE_LEN
                && !is_excluded(&genre)
                && !genres.contains(&genre)
            {
                genres.push(genre);
            }
        }
    }

    genres
}

/// `og:image` cover URL, if the page declares one
pub fn parse_cover_url(html: &str) -> Option<String> {
    static COVER: OnceLock<Selector> = OnceLock::new();

    let document = Html::parse_document(html);
    let cover = document
        .select(selector(&COVER, COVER_SELECTOR))
        .filter_map(|meta| meta.value().attr("content"))
        .map(str::trim)
        .find(|url| !url.is_empty())
        .map(str::to_string);
    cover
}

/// Genre list for a scraped page
pub fn process_page(page: &GoodreadsPage) -> Vec<String> {
    page.genres
        .iter()
        .map(|g| g.trim())
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

/// Goodreads scraper
pub struct GoodreadsScraper {
    client: ResilientClient,
    base_url: String,
}

impl GoodreadsScraper {
    pub fn new(client: ResilientClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn book_url(&self, book_id: &str) -> String {
        format!("{}/book/show/{}", self.base_url, book_id)
    }
}

#[async_trait::async_trait]
impl GenreSource for GoodreadsScraper {
    fn kind(&self) -> SourceKind {
        SourceKind::Goodreads
    }

    async fn fetch(&self, book: &BookIdentity) -> Result<Option<SourcePayload>, FetchError> {
        let Some(book_id) = book.external_id() else {
            return Ok(None);
        };

        let url = self.book_url(book_id);
        let response = self.client.attempt(&HttpRequest::get(&url)).await?;

        let genres = parse_genres(&response.body);
        tracing::debug!(book_id, genres = genres.len(), "Parsed Goodreads page");

        Ok(Some(SourcePayload::Goodreads(GoodreadsPage {
            book_id: book_id.to_string(),
            url,
            genres,
            cover_url: parse_cover_url(&response.body),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::source_client::testing::{fast_policy, ScriptedTransport};
    use crate::services::source_client::HttpResponse;
    use std::sync::Arc;

    const MODERN_PAGE: &str = r#"
        <html><head><meta property="og:image" content="https://img.example/cover.jpg"></head>
        <body>
          <nav><a href="/genres/fiction">Browse every genre on the site</a></nav>
          <div data-testid="genresList">
            <a href="/genres/fantasy"><span>Fantasy</span></a>
            <a href="/genres/fiction"><span>Fiction</span></a>
            <a href="/genres/audiobook"><span>Audiobook</span></a>
            <a href="/genres/fantasy"><span>Fantasy</span></a>
          </div>
        </body></html>"#;

    const LEGACY_PAGE: &str = r#"
        <html><body>
          <a href="/genres/classics">Classics</a>
          <a href="/genres/romance">Romance</a>
          <a href="/genres/">Explore the complete list of genres and find your next great read</a>
          <a href="/shelf/show/to-read">To Read</a>
        </body></html>"#;

    #[test]
    fn test_primary_selector_wins() {
        assert_eq!(parse_genres(MODERN_PAGE), vec!["Fantasy", "Fiction"]);
    }

    #[test]
    fn test_fallback_selector_filters_long_links() {
        assert_eq!(parse_genres(LEGACY_PAGE), vec!["Classics", "Romance"]);
    }

    #[test]
    fn test_page_without_genres_is_empty() {
        assert!(parse_genres("<html><body><p>Sign in</p></body></html>").is_empty());
    }

    #[test]
    fn test_cover_from_og_image() {
        assert_eq!(
            parse_cover_url(MODERN_PAGE).as_deref(),
            Some("https://img.example/cover.jpg")
        );
        assert_eq!(parse_cover_url(LEGACY_PAGE), None);
    }

    fn scraper(transport: Arc<ScriptedTransport>) -> GoodreadsScraper {
        GoodreadsScraper::new(
            ResilientClient::new(SourceKind::Goodreads, transport, fast_policy()),
            "https://gr.test/",
        )
    }

    #[tokio::test]
    async fn test_fetch_without_external_id_skips_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let payload = scraper(transport.clone())
            .fetch(&BookIdentity::new("Emma", "Jane Austen"))
            .await
            .unwrap();
        assert!(payload.is_none());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_parses_page() {
        let transport = Arc::new(ScriptedTransport::new().ok("/book/show/42", MODERN_PAGE));
        let payload = scraper(transport)
            .fetch(&BookIdentity::new("Dune", "Frank Herbert").with_external_id("42"))
            .await
            .unwrap()
            .unwrap();

        let SourcePayload::Goodreads(page) = &payload else {
            panic!("expected a Goodreads payload");
        };
        assert_eq!(page.url, "https://gr.test/book/show/42");
        assert_eq!(process_page(page), vec!["Fantasy", "Fiction"]);
        assert_eq!(payload.image_url().as_deref(), Some("https://img.example/cover.jpg"));
    }

    #[tokio::test]
    async fn test_missing_book_is_permanent() {
        let transport = Arc::new(
            ScriptedTransport::new().route("/book/show/7", vec![Ok(HttpResponse::new(404, ""))]),
        );
        let err = scraper(transport.clone())
            .fetch(&BookIdentity::new("Gone", "Nobody").with_external_id("7"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(transport.calls().len(), 1);
    }
}

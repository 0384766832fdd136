//! Trait seams for genre sources
//!
//! Every external source (Goodreads, Google Books, Open Library) implements
//! [`GenreSource`]. The enricher only sees this trait, so tests swap in
//! scripted sources without touching the network.

use crate::error::FetchError;
use crate::models::{BookIdentity, SourceKind, SourcePayload};

/// One external genre source
///
/// # Example
///
/// ```ignore
/// #[async_trait::async_trait]
/// impl GenreSource for FixedSource {
///     fn kind(&self) -> SourceKind { SourceKind::GoogleBooks }
///
///     async fn fetch(&self, book: &BookIdentity) -> Result<Option<SourcePayload>, FetchError> {
///         Ok(Some(SourcePayload::GoogleBooks(self.volumes.clone())))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait GenreSource: Send + Sync {
    /// Which source this is
    fn kind(&self) -> SourceKind;

    /// Fetch this source's payload for one book
    ///
    /// # Returns
    /// * `Ok(Some(payload))` - the source answered (the payload may hold no genres)
    /// * `Ok(None)` - the source has nothing to look up for this book
    ///   (for example, no external id for the scraper) or found no match
    /// * `Err(FetchError)` - the call failed after retries, or permanently
    async fn fetch(&self, book: &BookIdentity) -> Result<Option<SourcePayload>, FetchError>;
}

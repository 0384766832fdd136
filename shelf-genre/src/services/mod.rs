//! Genre sources, the resilient client they share, merging and per-book enrichment

pub mod enricher;
pub mod genre_merger;
pub mod goodreads;
pub mod google_books;
pub mod open_library;
pub mod source_client;

pub use enricher::BookEnricher;
pub use genre_merger::GenreNormalizer;
pub use goodreads::{GoodreadsPage, GoodreadsScraper};
pub use google_books::{GoogleBooksClient, GoogleVolumes};
pub use open_library::{OpenLibraryClient, OpenLibraryRecord};
pub use source_client::{
    HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, ResilientClient, TransportError,
};

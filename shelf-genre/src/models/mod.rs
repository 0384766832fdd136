//! Data models for genre enrichment

pub mod book;
pub mod enriched;
pub mod job;
pub mod report;

pub use book::{BookIdentity, ItemKey};
pub use enriched::{
    EnrichedBook, FetchOutcome, ProcessedGenreSet, RawSourceResponse, SourceFlag, SourceKind,
    SourcePayload,
};
pub use job::{is_ready, EnrichmentRequest, Job, JobManifest, JobStatus, WorkMessage};
pub use report::{FinalReport, GenreCount, ReportEntry, ReportSummary};

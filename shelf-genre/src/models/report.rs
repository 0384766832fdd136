//! Final job report: one entry per canonical identity plus summary statistics

use super::book::ItemKey;
use super::enriched::{EnrichedBook, SourceFlag, SourceKind};
use super::BookIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Report entry for one book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub item_key: ItemKey,
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn13: Option<String>,
    pub final_genres: Vec<String>,
    pub success: bool,
    pub genre_sources: Vec<SourceKind>,
    pub source_success: Vec<SourceFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub processing_log: Vec<String>,
    /// Worker wrote a failure placeholder for this item
    pub placeholder: bool,
    /// No persisted result existed at aggregation; entry made up by the aggregator
    pub synthesized: bool,
}

impl ReportEntry {
    /// Entry from a persisted result
    pub fn from_result(book: &EnrichedBook) -> Self {
        Self {
            item_key: book.item_key.clone(),
            title: book.identity.title.clone(),
            author: book.identity.author.clone(),
            external_id: book.identity.external_id.clone(),
            isbn13: book.identity.isbn13.clone(),
            final_genres: book.final_genres().to_vec(),
            success: book.success(),
            genre_sources: book.genre_sources.clone(),
            source_success: book.source_success.clone(),
            thumbnail_url: book.thumbnail_url.clone(),
            processing_log: book.processing_log().to_vec(),
            placeholder: book.is_placeholder(),
            synthesized: false,
        }
    }

    /// Failure entry for an identity with no persisted result
    pub fn missing(identity: &BookIdentity) -> Self {
        Self {
            item_key: identity.item_key(),
            title: identity.title.clone(),
            author: identity.author.clone(),
            external_id: identity.external_id.clone(),
            isbn13: identity.isbn13.clone(),
            final_genres: Vec::new(),
            success: false,
            genre_sources: Vec::new(),
            source_success: Vec::new(),
            thumbnail_url: None,
            processing_log: vec!["No result was persisted for this item".to_string()],
            placeholder: false,
            synthesized: true,
        }
    }
}

/// Genre with its occurrence count across the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenreCount {
    pub genre: String,
    pub count: usize,
}

/// Summary statistics over all entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub placeholder_items: usize,
    pub synthesized_items: usize,
    /// Fraction of items with at least one genre (0.0 - 1.0)
    pub success_rate: f64,
    /// Books each source contributed genres to
    pub source_contributions: BTreeMap<SourceKind, usize>,
    pub distinct_genres: usize,
    pub top_genres: Vec<GenreCount>,
}

impl ReportSummary {
    pub fn from_entries(entries: &[ReportEntry], top_n: usize) -> Self {
        let total_items = entries.len();
        let successful_items = entries.iter().filter(|e| e.success).count();

        let mut source_contributions: BTreeMap<SourceKind, usize> =
            SourceKind::ALL.iter().map(|k| (*k, 0)).collect();
        let mut genre_counts: HashMap<&str, usize> = HashMap::new();

        for entry in entries {
            for source in &entry.genre_sources {
                *source_contributions.entry(*source).or_default() += 1;
            }
            for genre in &entry.final_genres {
                *genre_counts.entry(genre.as_str()).or_default() += 1;
            }
        }

        let distinct_genres = genre_counts.len();
        let mut top_genres: Vec<GenreCount> = genre_counts
            .into_iter()
            .map(|(genre, count)| GenreCount {
                genre: genre.to_string(),
                count,
            })
            .collect();
        // Highest count first, ties alphabetical so output is stable
        top_genres.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.genre.cmp(&b.genre)));
        top_genres.truncate(top_n);

        Self {
            total_items,
            successful_items,
            failed_items: total_items - successful_items,
            placeholder_items: entries.iter().filter(|e| e.placeholder).count(),
            synthesized_items: entries.iter().filter(|e| e.synthesized).count(),
            success_rate: if total_items == 0 {
                0.0
            } else {
                successful_items as f64 / total_items as f64
            },
            source_contributions,
            distinct_genres,
            top_genres,
        }
    }
}

/// Final report for one job, written once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub job_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub summary: ReportSummary,
    /// In canonical identity order
    pub entries: Vec<ReportEntry>,
}

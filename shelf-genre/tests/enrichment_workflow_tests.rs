//! Fan-out / fan-in workflow tests
//!
//! Distributor, worker pool and aggregator against a temp-dir SQLite
//! database, with scripted genre sources.

mod helpers;

use helpers::{build_enricher, create_test_stores, fast_worker_config, Reply, ScriptedSource};
use shelf_common::events::EventBus;
use shelf_genre::config::{AggregatorConfig, DistributorConfig};
use shelf_genre::db::blobs::put_json;
use shelf_genre::db::keys::{report_key, result_key, results_prefix};
use shelf_genre::db::Stores;
use shelf_genre::models::{
    BookIdentity, EnrichedBook, EnrichmentRequest, JobStatus, SourceKind, WorkMessage,
};
use shelf_genre::services::BookEnricher;
use shelf_genre::workflow::{load_report, Aggregator, ScanOutcome, WorkDistributor, Worker, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn distributor(stores: &Stores) -> WorkDistributor {
    WorkDistributor::new(stores.clone(), DistributorConfig::default(), EventBus::new(64))
}

fn aggregator(stores: &Stores) -> Aggregator {
    Aggregator::new(stores.clone(), AggregatorConfig::default(), EventBus::new(64))
}

fn worker(stores: &Stores, enricher: Arc<BookEnricher>) -> Worker {
    Worker::new(stores.clone(), enricher, fast_worker_config(), EventBus::new(64))
}

async fn drain(stores: &Stores, enricher: Arc<BookEnricher>) {
    let pool = WorkerPool::new(worker(stores, enricher), 3);
    tokio::time::timeout(Duration::from_secs(10), pool.run(CancellationToken::new(), true))
        .await
        .expect("worker pool did not drain");
}

fn silent_enricher() -> Arc<BookEnricher> {
    build_enricher(
        ScriptedSource::new(SourceKind::Goodreads).shared(),
        ScriptedSource::new(SourceKind::GoogleBooks).shared(),
        ScriptedSource::new(SourceKind::OpenLibrary).shared(),
    )
}

/// End-to-end batch of three books
///
/// **Given:**
///   1. "The Name of the Wind" with an external id; scraper returns Fantasy, Fiction
///   2. "Steve Jobs" without an external id; Google Books returns Biography,
///      Open Library returns Biography, History
///   3. "Obscure Pamphlet" with an external id; every source returns nothing
///
/// **Then:** a 3-entry report matched by identity, job complete, results removed
#[tokio::test]
async fn test_three_book_batch_end_to_end() {
    let (_dir, stores) = create_test_stores().await;

    let scraper = ScriptedSource::new(SourceKind::Goodreads)
        .reply("The Name of the Wind", Reply::Genres(vec!["Fantasy", "Fiction"]))
        .reply("Obscure Pamphlet", Reply::Genres(vec![]))
        .shared();
    let google = ScriptedSource::new(SourceKind::GoogleBooks)
        .reply("Steve Jobs", Reply::Genres(vec!["Biography"]))
        .reply("Obscure Pamphlet", Reply::Genres(vec![]))
        .shared();
    let open_library = ScriptedSource::new(SourceKind::OpenLibrary)
        .reply("Steve Jobs", Reply::Genres(vec!["Biography", "History"]))
        .reply("Obscure Pamphlet", Reply::Genres(vec![]))
        .shared();
    let enricher = build_enricher(scraper.clone(), google.clone(), open_library.clone());

    let books = vec![
        BookIdentity::new("The Name of the Wind", "Patrick Rothfuss").with_external_id("186074"),
        BookIdentity::new("Steve Jobs", "Walter Isaacson"),
        BookIdentity::new("Obscure Pamphlet", "Nobody").with_external_id("999"),
    ];

    let job = distributor(&stores).submit(books.clone()).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);

    drain(&stores, enricher).await;

    // Primary success skips the fallback entirely
    assert_eq!(scraper.calls_for("The Name of the Wind"), 1);
    assert_eq!(google.calls_for("The Name of the Wind"), 0);
    assert_eq!(open_library.calls_for("The Name of the Wind"), 0);
    // No external id: scraper never called, both fallbacks are
    assert_eq!(scraper.calls_for("Steve Jobs"), 0);
    assert_eq!(google.calls_for("Steve Jobs"), 1);
    assert_eq!(open_library.calls_for("Steve Jobs"), 1);
    // Empty primary result falls through to both fallbacks
    assert_eq!(google.calls_for("Obscure Pamphlet"), 1);
    assert_eq!(open_library.calls_for("Obscure Pamphlet"), 1);

    let outcome = aggregator(&stores).scan_job(job.job_id).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Completed { .. }));

    let stored = stores.jobs.get(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Complete);
    assert_eq!(stored.completed_items, 3);

    let report = load_report(&stores, job.job_id).await.unwrap().unwrap();
    assert_eq!(report.entries.len(), 3);
    for (entry, book) in report.entries.iter().zip(&books) {
        assert_eq!(entry.item_key, book.item_key());
        assert!(!entry.synthesized);
    }
    assert_eq!(report.entries[0].final_genres, vec!["Fantasy", "Fiction"]);
    assert!(report.entries[0].success);
    assert_eq!(report.entries[1].final_genres, vec!["Biography", "History"]);
    assert!(report.entries[1].success);
    assert!(report.entries[2].final_genres.is_empty());
    assert!(!report.entries[2].success);

    assert_eq!(report.summary.total_items, 3);
    assert_eq!(report.summary.successful_items, 2);
    assert_eq!(report.summary.failed_items, 1);

    // Intermediate artifacts removed
    assert_eq!(
        stores.blobs.count_prefix(&results_prefix(job.job_id)).await.unwrap(),
        0
    );
    assert_eq!(stores.queue.depth().await.unwrap(), 0);
}

/// Re-running the scan on a complete job changes nothing
#[tokio::test]
async fn test_rescan_of_complete_job_is_noop() {
    let (_dir, stores) = create_test_stores().await;
    let job = distributor(&stores)
        .submit(vec![BookIdentity::new("Emma", "Jane Austen")])
        .await
        .unwrap();
    drain(&stores, silent_enricher()).await;

    let aggregator = aggregator(&stores);
    assert!(matches!(
        aggregator.scan_job(job.job_id).await.unwrap(),
        ScanOutcome::Completed { .. }
    ));
    let first_report = stores.blobs.get(&report_key(job.job_id)).await.unwrap().unwrap();
    let first_job = stores.jobs.get(job.job_id).await.unwrap().unwrap();

    assert_eq!(
        aggregator.scan_job(job.job_id).await.unwrap(),
        ScanOutcome::Terminal(JobStatus::Complete)
    );
    assert!(aggregator.scan_once().await.unwrap().is_empty());

    let second_report = stores.blobs.get(&report_key(job.job_id)).await.unwrap().unwrap();
    assert_eq!(first_report, second_report);
    assert_eq!(stores.jobs.get(job.job_id).await.unwrap().unwrap(), first_job);
    assert_eq!(stores.blobs.count_prefix("reports/").await.unwrap(), 1);
}

/// Duplicate delivery yields one result and one report entry
#[tokio::test]
async fn test_duplicate_delivery_yields_single_entry() {
    let (_dir, stores) = create_test_stores().await;
    let book = BookIdentity::new("Emma", "Jane Austen");
    let job = distributor(&stores).submit(vec![book.clone()]).await.unwrap();

    // Same request published again, as an at-least-once queue may do
    stores
        .queue
        .publish(&WorkMessage {
            message_id: Uuid::new_v4(),
            job_id: job.job_id,
            requests: vec![EnrichmentRequest::new(job.job_id, book.clone())],
        })
        .await
        .unwrap();

    let worker = worker(&stores, silent_enricher());
    worker.process_next().await.unwrap().unwrap();
    worker.process_next().await.unwrap().unwrap();
    assert_eq!(
        stores.blobs.count_prefix(&results_prefix(job.job_id)).await.unwrap(),
        1
    );

    aggregator(&stores).scan_job(job.job_id).await.unwrap();
    let report = load_report(&stores, job.job_id).await.unwrap().unwrap();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].item_key, book.item_key());
}

/// Readiness boundary: N-1 persisted is not ready, N is
#[tokio::test]
async fn test_readiness_boundary() {
    let (_dir, stores) = create_test_stores().await;
    let books: Vec<BookIdentity> = (0..3)
        .map(|i| BookIdentity::new(format!("Volume {}", i), "Series Author"))
        .collect();
    let job = distributor(&stores).submit(books).await.unwrap();

    let worker = worker(&stores, silent_enricher());
    let aggregator = aggregator(&stores);

    worker.process_next().await.unwrap().unwrap();
    worker.process_next().await.unwrap().unwrap();
    assert_eq!(
        aggregator.scan_job(job.job_id).await.unwrap(),
        ScanOutcome::InProgress {
            persisted: 2,
            total: 3
        }
    );
    assert_eq!(
        stores.jobs.get(job.job_id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );

    worker.process_next().await.unwrap().unwrap();
    assert!(matches!(
        aggregator.scan_job(job.job_id).await.unwrap(),
        ScanOutcome::Completed { .. }
    ));
}

/// A manifest identity without a result still gets a report entry
#[tokio::test]
async fn test_missing_result_gets_synthesized_entry() {
    let (_dir, stores) = create_test_stores().await;
    let present = BookIdentity::new("Persuasion", "Jane Austen");
    let absent = BookIdentity::new("Sanditon", "Jane Austen");
    let job = WorkDistributor::new(
        stores.clone(),
        DistributorConfig {
            items_per_message: 2,
            max_messages_per_job: None,
        },
        EventBus::new(8),
    )
    .submit(vec![absent.clone(), present.clone()])
    .await
    .unwrap();

    // One real result plus a stray result whose identity is not in the manifest
    let result = EnrichedBook::new(present.clone());
    put_json(
        stores.blobs.as_ref(),
        &result_key(job.job_id, &result.item_key),
        &result,
    )
    .await
    .unwrap();
    let stray = EnrichedBook::new(BookIdentity::new("Lady Susan", "Jane Austen"));
    put_json(
        stores.blobs.as_ref(),
        &result_key(job.job_id, &stray.item_key),
        &stray,
    )
    .await
    .unwrap();

    aggregator(&stores).scan_job(job.job_id).await.unwrap();
    let report = load_report(&stores, job.job_id).await.unwrap().unwrap();

    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.entries[0].item_key, absent.item_key());
    assert!(report.entries[0].synthesized);
    assert!(!report.entries[0].success);
    assert_eq!(report.entries[1].item_key, present.item_key());
    assert!(!report.entries[1].synthesized);
    assert_eq!(report.summary.synthesized_items, 1);
}

/// Two aggregators racing on one ready job: one completes, one stands down
#[tokio::test]
async fn test_concurrent_scans_complete_once() {
    let (_dir, stores) = create_test_stores().await;
    let job = distributor(&stores)
        .submit(vec![
            BookIdentity::new("Emma", "Jane Austen"),
            BookIdentity::new("Mansfield Park", "Jane Austen"),
        ])
        .await
        .unwrap();
    drain(&stores, silent_enricher()).await;

    let first = aggregator(&stores);
    let second = aggregator(&stores);
    let (a, b) = tokio::join!(first.scan_job(job.job_id), second.scan_job(job.job_id));
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, ScanOutcome::Completed { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(
        stores.jobs.get(job.job_id).await.unwrap().unwrap().status,
        JobStatus::Complete
    );
    assert_eq!(stores.blobs.count_prefix("reports/").await.unwrap(), 1);
}

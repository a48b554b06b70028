use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use digest_pipeline::{
    CompileOutcome, PeriodId, PipelineStore, RawRecord, RetryPolicy, RunStatus, ScanBatch,
    Scheduler, SchedulerConfig, SourceType,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

fn record(title: &str, link: &str, published: Option<(i32, u32, u32)>) -> RawRecord {
    RawRecord {
        title: title.to_string(),
        link: link.to_string(),
        summary: None,
        published_at: published.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
        authors: Vec::new(),
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_secs(0),
            multiplier: 2.0,
            max_interval: Duration::from_secs(0),
        },
        ..SchedulerConfig::default()
    }
}

async fn scheduler_with_store() -> (Scheduler, Arc<PipelineStore>) {
    let store = Arc::new(PipelineStore::in_memory().await.unwrap());
    (Scheduler::new(store.clone(), fast_config()), store)
}

/// Three batches for 2025-01: two papers, a blog post duplicating one
/// paper's identity key, and a malformed record. The digest ends up with
/// one classified item, one merged item, one dropped record, and
/// source counts of one paper and one blog post.
#[tokio::test]
async fn end_to_end_dedup_classification_and_counts() {
    init_tracing();
    let (scheduler, store) = scheduler_with_store().await;
    let period: PeriodId = "2025-01".parse().unwrap();

    store
        .append_batch(&ScanBatch {
            batch_id: uuid::Uuid::new_v4(),
            source_type: SourceType::Paper,
            collected_at: at("2025-01-10T06:00:00Z"),
            records: vec![
                record(
                    "Machine learning for patent analysis",
                    "https://example.org/papers/ml-patents",
                    Some((2025, 1, 8)),
                ),
                record(
                    "Quarterly almanac",
                    "https://example.org/almanac",
                    Some((2025, 1, 5)),
                ),
            ],
        })
        .await
        .unwrap();

    // Later blog scan picks up the almanac at the same canonical URL.
    store
        .append_batch(&ScanBatch {
            batch_id: uuid::Uuid::new_v4(),
            source_type: SourceType::BlogPost,
            collected_at: at("2025-01-20T06:00:00Z"),
            records: vec![record(
                "Quarterly almanac",
                "https://example.org/almanac?utm_source=rss",
                Some((2025, 1, 5)),
            )],
        })
        .await
        .unwrap();

    store
        .append_batch(&ScanBatch {
            batch_id: uuid::Uuid::new_v4(),
            source_type: SourceType::Paper,
            collected_at: at("2025-01-25T06:00:00Z"),
            records: vec![record("", "https://example.org/untitled", None)],
        })
        .await
        .unwrap();

    let outcome = scheduler.trigger_compile(&period, false).await.unwrap();
    let CompileOutcome::Compiled(success) = outcome else {
        panic!("expected a compiled digest, got {outcome:?}");
    };

    assert_eq!(success.dropped_records, 1);
    assert_eq!(success.duplicates_merged, 1);
    assert_eq!(success.digest.item_count(), 2);

    let trends = success
        .digest
        .sections
        .iter()
        .find(|s| s.key == "emerging_trends")
        .expect("classified section present");
    assert_eq!(trends.items.len(), 1);
    assert_eq!(trends.items[0].title, "Machine learning for patent analysis");

    // The merged item keeps the latest scan: the blog post wins.
    assert_eq!(success.digest.source_counts.papers, 1);
    assert_eq!(success.digest.source_counts.blog_posts, 1);
    assert_eq!(
        success.digest.source_counts,
        success.digest.recompute_source_counts()
    );

    // Every requested format rendered from the same snapshot.
    assert_eq!(success.artifacts.len(), 3);
    assert!(success.render_failures.is_empty());
}

#[tokio::test]
async fn recompile_without_force_returns_existing_digest() {
    init_tracing();
    let (scheduler, store) = scheduler_with_store().await;
    let period: PeriodId = "2025-01".parse().unwrap();

    store
        .append_batch(&ScanBatch {
            batch_id: uuid::Uuid::new_v4(),
            source_type: SourceType::Paper,
            collected_at: at("2025-01-10T06:00:00Z"),
            records: vec![record(
                "Original paper",
                "https://example.org/one",
                Some((2025, 1, 2)),
            )],
        })
        .await
        .unwrap();

    let first = scheduler.trigger_compile(&period, false).await.unwrap();
    let CompileOutcome::Compiled(first) = first else {
        panic!("expected initial compile to succeed");
    };

    // New material lands after the period compiled.
    store
        .append_batch(&ScanBatch {
            batch_id: uuid::Uuid::new_v4(),
            source_type: SourceType::Paper,
            collected_at: at("2025-01-28T06:00:00Z"),
            records: vec![record(
                "Late arrival",
                "https://example.org/two",
                Some((2025, 1, 20)),
            )],
        })
        .await
        .unwrap();

    let again = scheduler.trigger_compile(&period, false).await.unwrap();
    let CompileOutcome::AlreadySucceeded { digest, record } = again else {
        panic!("expected no recomputation without force");
    };
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(digest.item_count(), first.digest.item_count());
    assert_eq!(digest.generated_at, first.digest.generated_at);

    // Force picks up the late batch and retains the superseded document.
    let forced = scheduler.trigger_compile(&period, true).await.unwrap();
    let CompileOutcome::Compiled(forced) = forced else {
        panic!("expected forced recompile to run");
    };
    assert_eq!(forced.digest.item_count(), 2);

    let superseded = store.superseded_digests(&period).await.unwrap();
    assert_eq!(superseded.len(), 1);
    assert_eq!(superseded[0].item_count(), 1);

    let current = store.current_digest(&period).await.unwrap().unwrap();
    assert_eq!(current.item_count(), 2);
}

#[tokio::test]
async fn empty_period_fails_with_empty_digest_and_backs_off() {
    init_tracing();
    let (scheduler, store) = scheduler_with_store().await;
    let period: PeriodId = "2025-03".parse().unwrap();

    // Attempt 1: nothing scanned for the period.
    let outcome = scheduler.trigger_compile(&period, false).await.unwrap();
    let CompileOutcome::Failed(record) = outcome else {
        panic!("expected failure for an empty period");
    };
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.attempt_count, 1);
    assert!(record
        .last_error
        .as_deref()
        .unwrap()
        .contains("no items remained"));
    // Zero backoff in the test policy: immediately due for retry.
    assert!(record.next_retry_at.is_some());

    // Attempts 2 and 3 burn through the policy.
    for expected_attempt in 2..=3 {
        let outcome = scheduler.trigger_compile(&period, false).await.unwrap();
        let CompileOutcome::Failed(record) = outcome else {
            panic!("expected repeated failure");
        };
        assert_eq!(record.attempt_count, expected_attempt);
    }

    // Exhausted: further triggers are surfaced no-ops, not new attempts.
    let outcome = scheduler.trigger_compile(&period, false).await.unwrap();
    let CompileOutcome::Failed(record) = outcome else {
        panic!("expected surfaced failure");
    };
    assert_eq!(record.attempt_count, 3);
    assert!(record.next_retry_at.is_none());

    // No digest was ever produced for the period.
    assert!(store.current_digest(&period).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_run_waiting_out_backoff_is_not_retried() {
    init_tracing();
    let store = Arc::new(PipelineStore::in_memory().await.unwrap());
    let config = SchedulerConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_secs(3600),
            multiplier: 2.0,
            max_interval: Duration::from_secs(7200),
        },
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(store.clone(), config);
    let period: PeriodId = "2025-04".parse().unwrap();

    let first = scheduler.trigger_compile(&period, false).await.unwrap();
    assert_eq!(first.record().attempt_count, 1);

    // Backoff has not elapsed; the trigger is a no-op on the same record.
    let second = scheduler.trigger_compile(&period, false).await.unwrap();
    assert_eq!(second.record().attempt_count, 1);
    assert_eq!(second.record().status, RunStatus::Failed);
}

//! Concurrent access tests for the observation store.
//!
//! Writers and readers share one store through an `Arc` with no caller-side
//! locking; the store must neither lose nor duplicate writes.

use futures::future::join_all;
use logpush_estimator::config::DatabaseConfig;
use logpush_estimator::{summarize, TimeSeriesStore};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

async fn open_store(dir: &TempDir) -> Arc<TimeSeriesStore> {
    let config = DatabaseConfig::with_path(dir.path().join("concurrent.db").to_string_lossy());
    Arc::new(TimeSeriesStore::builder(&config).open().await.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_are_all_visible() {
    const WRITERS: u64 = 8;
    const PER_WRITER: u64 = 25;

    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let handles = (0..WRITERS).map(|writer| {
        let store = store.clone();
        tokio::spawn(async move {
            for i in 0..PER_WRITER {
                store.insert(writer * 1000 + i).await.unwrap();
            }
        })
    });
    for result in join_all(handles).await {
        result.unwrap();
    }

    let all = store.all().await.unwrap();
    assert_eq!(all.len() as u64, WRITERS * PER_WRITER);

    let ids: HashSet<i64> = all.iter().map(|o| o.id).collect();
    assert_eq!(ids.len(), all.len(), "duplicate ids");
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));

    let sizes: HashSet<u64> = all.iter().map(|o| o.size_bytes).collect();
    assert_eq!(sizes.len() as u64, WRITERS * PER_WRITER, "lost or duplicated writes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_during_writes_never_see_partial_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                store.insert(4096).await.unwrap();
            }
        })
    };

    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut last_seen = 0;
            for _ in 0..20 {
                let snapshot = store.all().await.unwrap();
                assert!(snapshot.len() >= last_seen, "committed rows disappeared");
                assert!(snapshot.iter().all(|o| o.size_bytes == 4096));
                last_seen = snapshot.len();
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();

    let stats = summarize(&store.all().await.unwrap());
    assert_eq!(stats.count, 100);
    assert_eq!(stats.total_bytes, 409_600);
}

#[tokio::test]
async fn test_insert_is_visible_to_the_next_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    for expected in 1..=10 {
        let inserted = store.insert(expected).await.unwrap();
        let all = store.all().await.unwrap();
        assert_eq!(all.len() as u64, expected);
        assert_eq!(all.last(), Some(&inserted));

        let now = store.now();
        let recent = store
            .range_query(inserted.timestamp, now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(recent.contains(&inserted));
    }
}

#[tokio::test]
async fn test_close_while_shared_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    store.insert(1).await.unwrap();

    let closers = (0..4).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.close().await })
    });
    for result in join_all(closers).await {
        result.unwrap().unwrap();
    }

    let err = store.insert(2).await.unwrap_err();
    assert!(err.is_closed());
    assert_eq!(err.operation(), Some("insert"));
}

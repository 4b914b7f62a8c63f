//! Append-only time-series store for payload size observations.
//!
//! Observations live in a single SQLite table keyed by an autoincrement id and
//! indexed by timestamp, so range scans walk the index instead of the table.
//!
//! # Concurrency
//!
//! ```text
//! insert ──▶ write lock ──▶ clock.now() ──▶ INSERT ──▶ Ack
//! all / range_query ──▶ pool connection (concurrent, WAL snapshot)
//! ```
//!
//! One physical write is in flight at a time. Reads run concurrently with each
//! other and with the writer; WAL mode gives each read a consistent snapshot, so
//! a read never sees a partially written row.

use crate::clock::{Clock, SystemClock};
use crate::config::DatabaseConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, FixedOffset, TimeZone};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::FromRow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument, Span};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS observations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recorded_at_us INTEGER NOT NULL,
        utc_offset_secs INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0)
    )
"#;

const CREATE_TIME_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_observations_recorded_at
    ON observations(recorded_at_us)
"#;

const RANGE_QUERY: &str = r#"
    SELECT id, recorded_at_us, utc_offset_secs, size_bytes
    FROM observations
    WHERE recorded_at_us >= ?1 AND recorded_at_us < ?2
    ORDER BY recorded_at_us, id
"#;

/// A single recorded payload size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Store-assigned id, strictly increasing with insertion order
    pub id: i64,
    /// When the store accepted the write, in the offset the clock reported
    pub timestamp: DateTime<FixedOffset>,
    /// Payload size in bytes
    pub size_bytes: u64,
}

/// Row layout of the `observations` table
#[derive(Debug, FromRow)]
struct ObservationRow {
    id: i64,
    recorded_at_us: i64,
    utc_offset_secs: i32,
    size_bytes: i64,
}

impl TryFrom<ObservationRow> for Observation {
    type Error = StoreError;

    fn try_from(row: ObservationRow) -> Result<Self> {
        let corrupt = |reason: String| StoreError::Corrupt { id: row.id, reason };

        let offset = FixedOffset::east_opt(row.utc_offset_secs)
            .ok_or_else(|| corrupt(format!("utc offset {}s out of range", row.utc_offset_secs)))?;
        let utc = DateTime::from_timestamp_micros(row.recorded_at_us)
            .ok_or_else(|| corrupt(format!("timestamp {}us out of range", row.recorded_at_us)))?;
        let size_bytes = u64::try_from(row.size_bytes)
            .map_err(|_| corrupt(format!("negative size {}", row.size_bytes)))?;

        Ok(Observation {
            id: row.id,
            timestamp: utc.with_timezone(&offset),
            size_bytes,
        })
    }
}

/// Builder for opening a [`TimeSeriesStore`]
pub struct StoreBuilder {
    config: DatabaseConfig,
    clock: Arc<dyn Clock>,
    span: Option<Span>,
}

impl StoreBuilder {
    fn new(config: &DatabaseConfig) -> Self {
        Self {
            config: config.clone(),
            clock: Arc::new(SystemClock),
            span: None,
        }
    }

    /// Time source used to stamp new observations
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Parent span for every event the store emits
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Open (or create) the database and ensure the schema exists
    pub async fn open(self) -> Result<TimeSeriesStore> {
        let span = self
            .span
            .unwrap_or_else(|| info_span!("observation_store", path = %self.config.path));
        TimeSeriesStore::open(self.config, self.clock, span.clone())
            .instrument(span)
            .await
    }
}

/// Durable, append-only store of size observations
pub struct TimeSeriesStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
    span: Span,
    path: String,
}

impl fmt::Debug for TimeSeriesStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSeriesStore")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl TimeSeriesStore {
    /// Start building a store for the given database configuration
    pub fn builder(config: &DatabaseConfig) -> StoreBuilder {
        StoreBuilder::new(config)
    }

    async fn open(config: DatabaseConfig, clock: Arc<dyn Clock>, span: Span) -> Result<Self> {
        let context = format!("path={}", config.path);

        info!("Opening SQLite database");

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| StoreError::storage("open", context.clone(), e))?;

        for statement in [CREATE_TABLE, CREATE_TIME_INDEX] {
            if let Err(e) = sqlx::query(statement).execute(&pool).await {
                pool.close().await;
                return Err(StoreError::storage("open", context, e));
            }
        }

        info!("Observation store ready");

        Ok(Self {
            pool,
            clock,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            span,
            path: config.path,
        })
    }

    /// Append one observation stamped with the current time
    ///
    /// Sizes above `i64::MAX` cannot be persisted and are rejected with
    /// [`StoreError::InvalidArgument`]; zero is a valid size.
    pub async fn insert(&self, size_bytes: u64) -> Result<Observation> {
        let span = info_span!(parent: &self.span, "insert", size_bytes);
        async { self.insert_inner(size_bytes).await.map_err(record_error) }
            .instrument(span)
            .await
    }

    async fn insert_inner(&self, size_bytes: u64) -> Result<Observation> {
        self.ensure_open("insert")?;

        let stored_size = i64::try_from(size_bytes).map_err(|_| StoreError::InvalidArgument {
            operation: "insert",
            message: format!("size_bytes {size_bytes} exceeds {}", i64::MAX),
        })?;

        let _write = self.write_lock.lock().await;
        // close() may have won the race for the lock
        self.ensure_open("insert")?;

        let now = self.clock.now();
        let recorded_at_us = now.timestamp_micros();
        let utc_offset_secs = now.offset().local_minus_utc();

        let result = sqlx::query(
            r#"
            INSERT INTO observations (recorded_at_us, utc_offset_secs, size_bytes)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(recorded_at_us)
        .bind(utc_offset_secs)
        .bind(stored_size)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::storage("insert", format!("size_bytes={size_bytes}"), e))?;

        let observation = Observation::try_from(ObservationRow {
            id: result.last_insert_rowid(),
            recorded_at_us,
            utc_offset_secs,
            size_bytes: stored_size,
        })?;

        debug!(
            id = observation.id,
            timestamp = %observation.timestamp,
            "Observation inserted"
        );

        metrics::counter!("estimator.observations.inserted").increment(1);
        metrics::histogram!("estimator.observation.size_bytes").record(size_bytes as f64);

        Ok(observation)
    }

    /// Every stored observation in insertion (id) order
    ///
    /// Loads the whole table into memory; callers with large histories should
    /// prefer [`range_query`](Self::range_query).
    pub async fn all(&self) -> Result<Vec<Observation>> {
        let span = info_span!(parent: &self.span, "all");
        async { self.all_inner().await.map_err(record_error) }
            .instrument(span)
            .await
    }

    async fn all_inner(&self) -> Result<Vec<Observation>> {
        self.ensure_open("all")?;

        let rows = sqlx::query_as::<_, ObservationRow>(
            r#"
            SELECT id, recorded_at_us, utc_offset_secs, size_bytes
            FROM observations
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::storage("all", "full scan", e))?;

        let observations = decode_rows(rows)?;
        debug!(count = observations.len(), "Query all completed");
        Ok(observations)
    }

    /// Observations with `start <= timestamp < end`, ordered by timestamp
    ///
    /// Ties on timestamp are returned in id order. An empty or inverted range
    /// returns an empty vector.
    pub async fn range_query<Tz>(
        &self,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<Vec<Observation>>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let span = info_span!(
            parent: &self.span,
            "range_query",
            start = %start.to_rfc3339(),
            end = %end.to_rfc3339()
        );
        let (start_us, end_us) = (ceil_micros(&start), ceil_micros(&end));
        async { self.range_inner(start_us, end_us).await.map_err(record_error) }
            .instrument(span)
            .await
    }

    async fn range_inner(&self, start_us: i64, end_us: i64) -> Result<Vec<Observation>> {
        self.ensure_open("range_query")?;

        if start_us >= end_us {
            debug!("Empty range requested");
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ObservationRow>(RANGE_QUERY)
            .bind(start_us)
            .bind(end_us)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                StoreError::storage(
                    "range_query",
                    format!("start_us={start_us}, end_us={end_us}"),
                    e,
                )
            })?;

        let observations = decode_rows(rows)?;
        debug!(count = observations.len(), "Range query completed");
        Ok(observations)
    }

    /// Check that the database answers queries
    pub async fn ping(&self) -> Result<()> {
        self.ensure_open("ping")?;
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::storage("ping", "SELECT 1", e))?;
        Ok(())
    }

    /// Release the connection pool
    ///
    /// Waits for an in-flight insert to finish. Calling it again is a no-op;
    /// every other operation fails with [`StoreError::Closed`] afterwards.
    pub async fn close(&self) -> Result<()> {
        let span = info_span!(parent: &self.span, "close");
        async {
            if self.closed.swap(true, Ordering::AcqRel) {
                debug!("Store already closed");
                return Ok(());
            }

            let _write = self.write_lock.lock().await;
            self.pool.close().await;

            info!("Observation store closed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current time according to the store's clock
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.clock.now()
    }

    /// Database file path
    pub fn path(&self) -> &str {
        &self.path
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed { operation });
        }
        Ok(())
    }
}

/// Microseconds since the epoch, rounded up to the next whole microsecond
///
/// Rows are stored at microsecond resolution, so `>= ceil(start)` and
/// `< ceil(end)` match `start <= t < end` exactly.
fn ceil_micros<Tz: TimeZone>(t: &DateTime<Tz>) -> i64 {
    let micros = t.timestamp_micros();
    if t.timestamp_subsec_nanos() % 1_000 != 0 {
        micros.saturating_add(1)
    } else {
        micros
    }
}

fn decode_rows(rows: Vec<ObservationRow>) -> Result<Vec<Observation>> {
    rows.into_iter().map(Observation::try_from).collect()
}

fn record_error(err: StoreError) -> StoreError {
    warn!(error = %err, "Store operation failed");
    metrics::counter!("estimator.store.errors").increment(1);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MockClock};
    use chrono::Duration;
    use sqlx::Row;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn at(rfc3339: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap()
    }

    fn db_config(dir: &TempDir) -> DatabaseConfig {
        DatabaseConfig::with_path(dir.path().join("observations.db").to_string_lossy())
    }

    async fn open_with_clock(dir: &TempDir, clock: Arc<dyn Clock>) -> TimeSeriesStore {
        TimeSeriesStore::builder(&db_config(dir))
            .clock(clock)
            .open()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_with_clock(&dir, Arc::new(SystemClock)).await;

        for size in [1024, 2048, 512] {
            assert_ok!(store.insert(size).await);
        }

        let all = store.all().await.unwrap();
        let sizes: Vec<u64> = all.iter().map(|o| o.size_bytes).collect();
        assert_eq!(sizes, vec![1024, 2048, 512]);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_insert_accepts_zero_and_rejects_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_with_clock(&dir, Arc::new(SystemClock)).await;

        let zero = assert_ok!(store.insert(0).await);
        assert_eq!(zero.size_bytes, 0);

        let err = assert_err!(store.insert(u64::MAX).await);
        assert!(err.is_invalid_argument());

        let max = assert_ok!(store.insert(i64::MAX as u64).await);
        assert_eq!(max.size_bytes, i64::MAX as u64);

        // the rejected insert left nothing behind
        assert_eq!(store.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_stamps_clock_time_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at("2024-05-01T10:15:30.123456+05:30")));
        let store = open_with_clock(&dir, clock).await;

        let inserted = store.insert(99).await.unwrap();
        assert_eq!(inserted.timestamp, at("2024-05-01T10:15:30.123456+05:30"));

        let stored = store.all().await.unwrap();
        assert_eq!(stored, vec![inserted]);
        assert_eq!(
            stored[0].timestamp.to_rfc3339(),
            "2024-05-01T10:15:30.123456+05:30"
        );
    }

    #[tokio::test]
    async fn test_range_query_is_half_open() {
        let dir = tempfile::tempdir().unwrap();
        let t = at("2024-05-01T12:00:00+00:00");
        let clock = Arc::new(ManualClock::new(t - Duration::hours(1)));
        let store = open_with_clock(&dir, clock.clone()).await;

        store.insert(1).await.unwrap();
        clock.set(t);
        store.insert(2).await.unwrap();
        clock.set(t + Duration::hours(1));
        store.insert(3).await.unwrap();

        let hits = store.range_query(t, t + Duration::hours(1)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].size_bytes, 2);
        assert_eq!(hits[0].timestamp, t);
    }

    #[tokio::test]
    async fn test_range_query_with_sub_microsecond_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let t = at("2024-05-01T12:00:00.000001+00:00");
        let store = open_with_clock(&dir, Arc::new(ManualClock::new(t))).await;
        store.insert(1).await.unwrap();

        let half = Duration::nanoseconds(500);
        assert!(store
            .range_query(t + half, t + Duration::hours(1))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .range_query(t - Duration::hours(1), t + half)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store.range_query(t - half, t + half).await.unwrap().len(),
            1
        );

        // before the epoch the rounding still goes up
        let early = at("1969-12-31T23:59:59.999999+00:00");
        assert_eq!(ceil_micros(&(early + half)), early.timestamp_micros() + 1);
        assert_eq!(ceil_micros(&early), early.timestamp_micros());
    }

    #[tokio::test]
    async fn test_range_query_uses_time_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_with_clock(&dir, Arc::new(SystemClock)).await;

        let plan = sqlx::query(&format!("EXPLAIN QUERY PLAN {RANGE_QUERY}"))
            .bind(0_i64)
            .bind(1_i64)
            .fetch_all(&store.pool)
            .await
            .unwrap();

        let details: Vec<String> = plan.iter().map(|row| row.get("detail")).collect();
        assert!(
            details
                .iter()
                .any(|d| d.contains("USING INDEX idx_observations_recorded_at")),
            "unexpected plan: {details:?}"
        );
        assert!(!details.iter().any(|d| d.starts_with("SCAN observations")));
    }

    #[tokio::test]
    async fn test_empty_and_inverted_ranges_return_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let t = at("2024-05-01T12:00:00+00:00");
        let store = open_with_clock(&dir, Arc::new(ManualClock::new(t))).await;
        store.insert(10).await.unwrap();

        assert!(store.range_query(t, t).await.unwrap().is_empty());
        assert!(store
            .range_query(t + Duration::hours(1), t)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_range_query_orders_by_timestamp_not_id() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at("2024-05-01T10:30:00+00:00")));
        let store = open_with_clock(&dir, clock.clone()).await;

        let later = store.insert(100).await.unwrap();
        clock.set(at("2024-05-01T10:10:00+00:00"));
        let earlier = store.insert(200).await.unwrap();
        assert!(later.id < earlier.id);

        let ranged = store
            .range_query(at("2024-05-01T10:00:00+00:00"), at("2024-05-01T11:00:00+00:00"))
            .await
            .unwrap();
        assert_eq!(ranged, vec![earlier.clone(), later.clone()]);

        let all = store.all().await.unwrap();
        assert_eq!(all, vec![later, earlier]);
    }

    #[tokio::test]
    async fn test_range_query_accepts_other_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_with_clock(
            &dir,
            Arc::new(ManualClock::new(at("2024-05-01T12:00:00+00:00"))),
        )
        .await;
        store.insert(5).await.unwrap();

        // same instants expressed in UTC-05:00
        let hits = store
            .range_query(at("2024-05-01T07:00:00-05:00"), at("2024-05-01T07:00:01-05:00"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let utc_hits = store
            .range_query(
                chrono::Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
                chrono::Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(utc_hits.len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_later_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_with_clock(&dir, Arc::new(SystemClock)).await;
        store.insert(1).await.unwrap();

        assert_ok!(store.close().await);
        assert_ok!(store.close().await);
        assert!(store.is_closed());

        assert!(assert_err!(store.insert(1).await).is_closed());
        assert!(assert_err!(store.all().await).is_closed());
        let now = store.now();
        assert!(assert_err!(store.range_query(now - Duration::hours(1), now).await).is_closed());
        assert!(assert_err!(store.ping().await).is_closed());
    }

    #[tokio::test]
    async fn test_observations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = open_with_clock(&dir, Arc::new(SystemClock)).await;
        let a = first.insert(111).await.unwrap();
        let b = first.insert(222).await.unwrap();
        first.close().await.unwrap();

        let second = open_with_clock(&dir, Arc::new(SystemClock)).await;
        assert_eq!(second.all().await.unwrap(), vec![a.clone(), b.clone()]);

        // ids keep increasing after reopen
        let c = second.insert(333).await.unwrap();
        assert!(c.id > b.id);
    }

    #[tokio::test]
    async fn test_clock_read_once_per_insert() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = MockClock::new();
        clock
            .expect_now()
            .times(2)
            .returning(|| DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap());
        let store = open_with_clock(&dir, Arc::new(clock)).await;

        store.insert(1).await.unwrap();
        store.insert(2).await.unwrap();
        // rejected before the clock is consulted
        assert_err!(store.insert(u64::MAX).await);
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_with_clock(&dir, Arc::new(SystemClock)).await;
        assert_ok!(store.ping().await);
        assert_eq!(store.path(), db_config(&dir).path);
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let row = ObservationRow {
            id: 7,
            recorded_at_us: 0,
            utc_offset_secs: 0,
            size_bytes: -1,
        };
        match Observation::try_from(row) {
            Err(StoreError::Corrupt { id, reason }) => {
                assert_eq!(id, 7);
                assert!(reason.contains("negative"));
            }
            other => panic!("Expected Corrupt, got {:?}", other),
        }
    }
}

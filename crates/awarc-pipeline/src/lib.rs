//! Ingestion pipeline orchestration: pages from the partner API into
//! per-partition merge batches, with a run summary and fail-fast errors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use awarc_api::{ApiError, AvailabilityFeed, AvailabilityQuery, PartnerClient};
use awarc_core::{AvailabilityRecord, Source};
use awarc_storage::{MergeStats, StorageError, Table, TableConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "awarc-pipeline";

pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 500;
/// Default vacuum horizon, one week of history.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Conflict policy: the merge engine never retries, the orchestrator does.
const MAX_MERGE_ATTEMPTS: usize = 5;
const CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Layout of the availability archive table.
pub fn availability_table_config() -> TableConfig {
    TableConfig {
        merge_keys: AvailabilityRecord::MERGE_KEYS
            .iter()
            .map(|key| key.to_string())
            .collect(),
        hash_denylist: AvailabilityRecord::HASH_DENYLIST
            .iter()
            .map(|key| key.to_string())
            .collect(),
    }
}

pub fn open_availability_table(root: impl Into<PathBuf>) -> Result<Table, StorageError> {
    Table::open(root, availability_table_config())
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_key: String,
    pub base_url: String,
    pub table_root: PathBuf,
    pub page_size: u32,
    pub batch_size: usize,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("AWARC_API_KEY").unwrap_or_default(),
            base_url: std::env::var("AWARC_BASE_URL")
                .unwrap_or_else(|_| awarc_api::DEFAULT_BASE_URL.to_string()),
            table_root: std::env::var("AWARC_TABLE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./archive/availability")),
            page_size: std::env::var("AWARC_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PAGE_SIZE),
            batch_size: std::env::var("AWARC_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            http_timeout_secs: std::env::var("AWARC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A failed run, carrying the summary accumulated up to the failure.
#[derive(Debug, Error)]
#[error("ingestion run for {} failed: {error}", .run.source)]
pub struct RunFailure {
    pub run: IngestionRun,
    #[source]
    pub error: PipelineError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Cancelled,
    DeadlineExceeded,
}

/// Cooperative cancellation handle, checked between batches. An in-flight
/// commit is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub max_pages: Option<u64>,
    pub batch_size: usize,
    pub deadline: Option<Duration>,
    pub cancel: CancelFlag,
    pub optimize_after: bool,
    pub retention: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_pages: None,
            batch_size: DEFAULT_BATCH_SIZE,
            deadline: None,
            cancel: CancelFlag::new(),
            optimize_after: false,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Per-run statistics. Ephemeral: reported once, never stored in the table.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionRun {
    pub source: Source,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages_fetched: u64,
    pub records_seen: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_unchanged: u64,
    pub errors: Vec<String>,
    pub stopped_early: Option<StopReason>,
    pub final_version: Option<u64>,
}

impl IngestionRun {
    fn start(source: Source) -> Self {
        Self {
            source,
            started_at: Utc::now(),
            finished_at: None,
            pages_fetched: 0,
            records_seen: 0,
            records_inserted: 0,
            records_updated: 0,
            records_unchanged: 0,
            errors: Vec::new(),
            stopped_early: None,
            final_version: None,
        }
    }
}

fn stop_reason(cancel: &CancelFlag, deadline: Option<Instant>) -> Option<StopReason> {
    if cancel.is_cancelled() {
        return Some(StopReason::Cancelled);
    }
    if deadline.is_some_and(|at| Instant::now() >= at) {
        return Some(StopReason::DeadlineExceeded);
    }
    None
}

async fn merge_with_retry(
    table: &Table,
    partition: &str,
    batch: &[Map<String, Value>],
) -> Result<MergeStats, StorageError> {
    let mut attempt = 1;
    loop {
        match table.merge(partition, batch, Utc::now()) {
            Err(StorageError::MergeConflict { version, .. }) if attempt < MAX_MERGE_ATTEMPTS => {
                warn!(
                    partition,
                    attempt, version, "concurrent write conflict, retrying with a fresh base"
                );
                tokio::time::sleep(CONFLICT_RETRY_DELAY * attempt as u32).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn flush_batch(
    table: &Table,
    records: Vec<AvailabilityRecord>,
    run: &mut IngestionRun,
) -> Result<(), PipelineError> {
    let mut partitions: BTreeMap<String, BTreeMap<(String, String), AvailabilityRecord>> =
        BTreeMap::new();
    for record in records {
        // Within one batch the later occurrence of a key wins, preserving
        // page order: a later page's view of a key supersedes an earlier one.
        partitions
            .entry(record.partition_key().to_string())
            .or_default()
            .insert((record.route_id.clone(), record.travel_date.clone()), record);
    }

    for (partition, rows) in partitions {
        let payloads: Vec<Map<String, Value>> =
            rows.values().map(|record| record.payload()).collect();
        let stats = merge_with_retry(table, &partition, &payloads).await?;
        run.records_inserted += stats.inserted;
        run.records_updated += stats.updated;
        run.records_unchanged += stats.unchanged;
        if stats.version.is_some() {
            run.final_version = stats.version;
        }
    }
    Ok(())
}

/// Drives one ingestion run for one source: page in, flatten, hash, merge
/// per partition in page order, summarize.
///
/// Failures are recorded on the run summary and propagated; batches already
/// committed stay committed. Cancellation and the optional deadline are
/// checked between batches only.
pub async fn run_ingestion<F: AvailabilityFeed>(
    feed: &mut F,
    table: &Table,
    source: Source,
    options: &IngestOptions,
) -> Result<IngestionRun, RunFailure> {
    let mut run = IngestionRun::start(source);
    let deadline = options.deadline.map(|limit| Instant::now() + limit);
    let batch_size = options.batch_size.max(1);
    let mut buffer: Vec<AvailabilityRecord> = Vec::new();
    info!(source = %source, "starting ingestion run");

    'pages: loop {
        if options
            .max_pages
            .is_some_and(|max| run.pages_fetched >= max)
        {
            break;
        }
        if let Some(reason) = stop_reason(&options.cancel, deadline) {
            run.stopped_early = Some(reason);
            break;
        }

        let page = match feed.next_page().await {
            Ok(Some(records)) => records,
            Ok(None) => break,
            Err(err) => {
                run.errors.push(err.to_string());
                run.finished_at = Some(Utc::now());
                return Err(RunFailure {
                    run,
                    error: err.into(),
                });
            }
        };
        run.pages_fetched += 1;
        run.records_seen += page.len() as u64;
        buffer.extend(page.iter().map(AvailabilityRecord::from_api));

        while buffer.len() >= batch_size {
            if let Some(reason) = stop_reason(&options.cancel, deadline) {
                run.stopped_early = Some(reason);
                break 'pages;
            }
            let chunk: Vec<AvailabilityRecord> = buffer.drain(..batch_size).collect();
            if let Err(error) = flush_batch(table, chunk, &mut run).await {
                run.errors.push(error.to_string());
                run.finished_at = Some(Utc::now());
                return Err(RunFailure { run, error });
            }
        }
    }

    while run.stopped_early.is_none() && !buffer.is_empty() {
        let take = batch_size.min(buffer.len());
        let chunk: Vec<AvailabilityRecord> = buffer.drain(..take).collect();
        if let Err(error) = flush_batch(table, chunk, &mut run).await {
            run.errors.push(error.to_string());
            run.finished_at = Some(Utc::now());
            return Err(RunFailure { run, error });
        }
    }

    if options.optimize_after && run.stopped_early.is_none() {
        match table.optimize(options.retention, Utc::now()) {
            Ok(stats) => info!(
                partitions_compacted = stats.partitions_compacted,
                files_deleted = stats.files_deleted,
                "post-run optimize finished"
            ),
            Err(err) => {
                run.errors.push(err.to_string());
                run.finished_at = Some(Utc::now());
                return Err(RunFailure {
                    run,
                    error: err.into(),
                });
            }
        }
    }

    run.finished_at = Some(Utc::now());
    info!(
        source = %source,
        pages = run.pages_fetched,
        seen = run.records_seen,
        inserted = run.records_inserted,
        updated = run.records_updated,
        unchanged = run.records_unchanged,
        "ingestion run complete"
    );
    Ok(run)
}

/// Convenience entry point: builds a pager for `source` and runs it to
/// completion against the table.
pub async fn ingest_source(
    client: &PartnerClient,
    table: &Table,
    source: Source,
    query: AvailabilityQuery,
    page_size: u32,
    start_skip: u64,
    options: &IngestOptions,
) -> Result<IngestionRun, RunFailure> {
    let mut pager = client.availability_pager(source, query, page_size, start_skip);
    run_ingestion(&mut pager, table, source, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use awarc_core::{AvailabilityResult, RouteInfo};
    use tempfile::tempdir;

    struct MockFeed {
        pages: VecDeque<Vec<AvailabilityResult>>,
        fail_after: Option<u64>,
        served: u64,
    }

    impl MockFeed {
        fn new(pages: Vec<Vec<AvailabilityResult>>) -> Self {
            Self {
                pages: pages.into(),
                fail_after: None,
                served: 0,
            }
        }

        fn failing_after(pages: Vec<Vec<AvailabilityResult>>, after: u64) -> Self {
            Self {
                pages: pages.into(),
                fail_after: Some(after),
                served: 0,
            }
        }
    }

    #[async_trait]
    impl AvailabilityFeed for MockFeed {
        async fn next_page(&mut self) -> Result<Option<Vec<AvailabilityResult>>, ApiError> {
            if self.fail_after.is_some_and(|after| self.served >= after) {
                return Err(ApiError::Rejected {
                    status: 401,
                    url: "mock://availability".to_string(),
                });
            }
            self.served += 1;
            Ok(self.pages.pop_front())
        }
    }

    fn mk_result(route_id: &str, date: &str, seats: i64) -> AvailabilityResult {
        AvailabilityResult {
            id: format!("avail-{route_id}-{date}"),
            route_id: route_id.to_string(),
            route: RouteInfo {
                id: route_id.to_string(),
                origin_airport: "SFO".into(),
                origin_region: "North America".into(),
                destination_airport: "NRT".into(),
                destination_region: "Asia".into(),
                num_days_out: 30,
                distance: 5124,
                source: Source::Aeroplan,
            },
            date: date.to_string(),
            parsed_date: date.to_string(),
            y_available: seats > 0,
            w_available: false,
            j_available: false,
            f_available: false,
            y_mileage_cost: Some("55000".into()),
            w_mileage_cost: None,
            j_mileage_cost: None,
            f_mileage_cost: None,
            y_mileage_cost_raw: Some(55000),
            w_mileage_cost_raw: None,
            j_mileage_cost_raw: None,
            f_mileage_cost_raw: None,
            y_remaining_seats: seats,
            w_remaining_seats: 0,
            j_remaining_seats: 0,
            f_remaining_seats: 0,
            y_airlines: Some("AC".into()),
            w_airlines: None,
            j_airlines: None,
            f_airlines: None,
            y_direct: true,
            w_direct: false,
            j_direct: false,
            f_direct: false,
            taxes_currency: Some("CAD".into()),
            source: Source::Aeroplan,
            created_at: "2026-08-01T00:00:00Z".into(),
            updated_at: "2026-08-06T07:15:00Z".into(),
        }
    }

    #[tokio::test]
    async fn run_ingests_every_page_into_the_table() {
        let dir = tempdir().expect("tempdir");
        let table = open_availability_table(dir.path()).expect("table");
        let mut feed = MockFeed::new(vec![
            vec![
                mk_result("r1", "2026-09-01", 4),
                mk_result("r2", "2026-09-01", 2),
            ],
            vec![mk_result("r1", "2026-09-02", 1)],
        ]);

        let run = run_ingestion(&mut feed, &table, Source::Aeroplan, &IngestOptions::default())
            .await
            .expect("run");

        assert_eq!(run.pages_fetched, 2);
        assert_eq!(run.records_seen, 3);
        assert_eq!(run.records_inserted, 3);
        assert_eq!(run.records_updated, 0);
        assert_eq!(run.records_unchanged, 0);
        assert_eq!(run.stopped_early, None);
        assert!(run.errors.is_empty());
        assert_eq!(run.final_version, Some(0));
        assert_eq!(table.read_partition("aeroplan").expect("read").len(), 3);
    }

    #[tokio::test]
    async fn rerunning_the_same_snapshot_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let table = open_availability_table(dir.path()).expect("table");
        let pages = || {
            vec![vec![
                mk_result("r1", "2026-09-01", 4),
                mk_result("r2", "2026-09-01", 2),
            ]]
        };

        let first = run_ingestion(
            &mut MockFeed::new(pages()),
            &table,
            Source::Aeroplan,
            &IngestOptions::default(),
        )
        .await
        .expect("first run");
        let second = run_ingestion(
            &mut MockFeed::new(pages()),
            &table,
            Source::Aeroplan,
            &IngestOptions::default(),
        )
        .await
        .expect("second run");

        assert_eq!(second.records_inserted, 0);
        assert_eq!(second.records_updated, 0);
        assert_eq!(second.records_unchanged, 2);
        assert_eq!(second.final_version, first.final_version);
        assert_eq!(table.current_version().expect("version"), Some(0));
    }

    #[tokio::test]
    async fn later_page_wins_for_a_key_refreshed_mid_run() {
        let dir = tempdir().expect("tempdir");
        let table = open_availability_table(dir.path()).expect("table");
        let mut feed = MockFeed::new(vec![
            vec![mk_result("r1", "2026-09-01", 4)],
            vec![mk_result("r1", "2026-09-01", 0)],
        ]);
        let options = IngestOptions {
            batch_size: 1,
            ..Default::default()
        };

        let run = run_ingestion(&mut feed, &table, Source::Aeroplan, &options)
            .await
            .expect("run");

        assert_eq!(run.records_inserted, 1);
        assert_eq!(run.records_updated, 1);
        let rows = table.read_partition("aeroplan").expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload["y_remaining_seats"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_the_next_batch() {
        let dir = tempdir().expect("tempdir");
        let table = open_availability_table(dir.path()).expect("table");
        let mut feed = MockFeed::new(vec![vec![mk_result("r1", "2026-09-01", 4)]]);
        let options = IngestOptions::default();
        options.cancel.cancel();

        let run = run_ingestion(&mut feed, &table, Source::Aeroplan, &options)
            .await
            .expect("run");

        assert_eq!(run.stopped_early, Some(StopReason::Cancelled));
        assert_eq!(run.pages_fetched, 0);
        assert_eq!(table.current_version().expect("version"), None);
    }

    #[tokio::test]
    async fn expired_deadline_stops_issuing_batches() {
        let dir = tempdir().expect("tempdir");
        let table = open_availability_table(dir.path()).expect("table");
        let mut feed = MockFeed::new(vec![vec![mk_result("r1", "2026-09-01", 4)]]);
        let options = IngestOptions {
            deadline: Some(Duration::ZERO),
            ..Default::default()
        };

        let run = run_ingestion(&mut feed, &table, Source::Aeroplan, &options)
            .await
            .expect("run");

        assert_eq!(run.stopped_early, Some(StopReason::DeadlineExceeded));
        assert_eq!(run.records_inserted, 0);
    }

    #[tokio::test]
    async fn feed_failure_is_recorded_and_propagated() {
        let dir = tempdir().expect("tempdir");
        let table = open_availability_table(dir.path()).expect("table");
        let mut feed =
            MockFeed::failing_after(vec![vec![mk_result("r1", "2026-09-01", 4)]], 1);
        let options = IngestOptions {
            batch_size: 1,
            ..Default::default()
        };

        let failure = run_ingestion(&mut feed, &table, Source::Aeroplan, &options)
            .await
            .unwrap_err();

        assert_eq!(failure.run.pages_fetched, 1);
        assert_eq!(failure.run.errors.len(), 1);
        assert!(matches!(
            failure.error,
            PipelineError::Api(ApiError::Rejected { status: 401, .. })
        ));
        // The batch committed before the failure stays committed.
        assert_eq!(failure.run.records_inserted, 1);
        assert_eq!(table.read_partition("aeroplan").expect("read").len(), 1);
    }

    #[tokio::test]
    async fn max_pages_caps_the_run() {
        let dir = tempdir().expect("tempdir");
        let table = open_availability_table(dir.path()).expect("table");
        let mut feed = MockFeed::new(vec![
            vec![mk_result("r1", "2026-09-01", 4)],
            vec![mk_result("r2", "2026-09-01", 2)],
        ]);
        let options = IngestOptions {
            max_pages: Some(1),
            ..Default::default()
        };

        let run = run_ingestion(&mut feed, &table, Source::Aeroplan, &options)
            .await
            .expect("run");

        assert_eq!(run.pages_fetched, 1);
        assert_eq!(run.records_inserted, 1);
    }

    #[tokio::test]
    async fn optimize_after_compacts_multi_segment_partitions() {
        let dir = tempdir().expect("tempdir");
        let table = open_availability_table(dir.path()).expect("table");
        let mut feed = MockFeed::new(vec![
            vec![mk_result("r1", "2026-09-01", 4)],
            vec![mk_result("r2", "2026-09-01", 2)],
        ]);
        let options = IngestOptions {
            batch_size: 1,
            optimize_after: true,
            ..Default::default()
        };

        run_ingestion(&mut feed, &table, Source::Aeroplan, &options)
            .await
            .expect("run");

        assert_eq!(table.info().expect("info").active_segments, 1);
        assert_eq!(table.read_partition("aeroplan").expect("read").len(), 2);
    }
}

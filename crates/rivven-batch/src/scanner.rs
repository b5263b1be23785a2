//! Concurrent, resumable table scanning
//!
//! A fixed pool of workers drains a shared bounded queue of [`TableWork`].
//! Each worker owns one table at a time and walks it batch by batch:
//!
//! ```text
//! Init ──► Scanning ──► Done
//!   │          │
//!   └──────────┴──► Failed
//! ```
//!
//! Per batch: wait for a rate-limiter permit, run the next range query, emit
//! every row, wait for all completions, then advance and store the cursor.
//! A failing table never stops its siblings; cancellation is observed between
//! batches and while waiting for a permit or for work.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounds::Bound;
use crate::config::BatchConfig;
use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::emitter::{Emitter, MessageSubmitter};
use crate::error::{Error, Result};
use crate::key_selector::{ScanColumnSet, TableWork};
use crate::position::{init_table_position, PositionStore, TableScanState};
use crate::query::{RangeQuery, RangeQueryBuilder};
use crate::rate_limiter::{BatchRateLimiter, RateLimitConfig, RateLimiterStats};
use crate::types::TableIdentity;

/// Engine sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerOptions {
    /// Number of concurrent workers
    pub nr_scanner: usize,
    /// Rows per batch
    pub batch_size: usize,
    /// Batches per second across all workers (0 = unlimited)
    pub batches_per_second: u64,
    /// Maximum wait for one message's completion
    pub completion_timeout: Option<Duration>,
    /// Work queue capacity (none = one slot per table)
    pub work_queue_capacity: Option<usize>,
}

impl From<&BatchConfig> for ScannerOptions {
    fn from(config: &BatchConfig) -> Self {
        Self {
            nr_scanner: config.nr_scanner,
            batch_size: config.table_scan_batch,
            batches_per_second: config.batch_per_second_limit,
            completion_timeout: config.completion_timeout(),
            work_queue_capacity: config.work_queue_capacity,
        }
    }
}

/// Run counters
#[derive(Debug, Default)]
pub struct ScanStats {
    tables_completed: AtomicU64,
    tables_failed: AtomicU64,
    tables_skipped: AtomicU64,
    batches: AtomicU64,
    rows_emitted: AtomicU64,
}

impl ScanStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished batch
    pub fn record_batch(&self, rows: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows_emitted.fetch_add(rows, Ordering::Relaxed);
    }

    /// Record a table scanned to completion
    pub fn record_table_completed(&self) {
        self.tables_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed table
    pub fn record_table_failed(&self) {
        self.tables_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a table with nothing left to scan
    pub fn record_table_skipped(&self) {
        self.tables_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy
    pub fn snapshot(&self, rows_committed: u64) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            tables_completed: self.tables_completed.load(Ordering::Relaxed),
            tables_failed: self.tables_failed.load(Ordering::Relaxed),
            tables_skipped: self.tables_skipped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
            rows_committed,
        }
    }
}

/// Copy of [`ScanStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStatsSnapshot {
    /// Tables scanned to completion in this run
    pub tables_completed: u64,
    /// Tables that failed
    pub tables_failed: u64,
    /// Tables already complete or queued twice
    pub tables_skipped: u64,
    /// Batch queries that returned rows or ended a table
    pub batches: u64,
    /// Rows emitted downstream
    pub rows_emitted: u64,
    /// Rows whose after-commit callback ran
    pub rows_committed: u64,
}

/// A table that failed during the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    /// `schema.table`
    pub table: String,
    /// Error text
    pub error: String,
}

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Final counters
    pub stats: ScanStatsSnapshot,
    /// Failed tables in failure order
    pub failed: Vec<TableFailure>,
    /// Whether the run stopped before every table finished
    pub cancelled: bool,
    /// Rate limiter counters
    pub rate_limiter: RateLimiterStats,
    /// Wall time
    pub elapsed: Duration,
}

impl ScanReport {
    /// Whether every table finished
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty()
    }

    /// `Ok(self)` on success, else [`Error::Cancelled`] or [`Error::TablesFailed`]
    pub fn into_result(self) -> Result<Self> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        if !self.failed.is_empty() {
            return Err(Error::TablesFailed {
                failed: self.failed.into_iter().map(|f| f.table).collect(),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Default)]
struct TableOutcome {
    batches: u64,
    rows: u64,
    skipped: bool,
}

struct Shared {
    conn: Arc<dyn Connection>,
    dialect: Arc<dyn SqlDialect>,
    store: Arc<PositionStore>,
    emitter: Emitter,
    limiter: BatchRateLimiter,
    batch_size: usize,
    cancel: CancellationToken,
    stats: ScanStats,
    in_flight: Mutex<HashSet<TableIdentity>>,
    failures: Mutex<Vec<TableFailure>>,
    finished: AtomicU64,
}

/// The scanner engine
pub struct TableScanner {
    shared: Arc<Shared>,
    options: ScannerOptions,
}

impl TableScanner {
    /// Create an engine
    pub fn new(
        conn: Arc<dyn Connection>,
        dialect: Arc<dyn SqlDialect>,
        store: Arc<PositionStore>,
        submitter: Arc<dyn MessageSubmitter>,
        options: ScannerOptions,
    ) -> Self {
        let shared = Shared {
            conn,
            dialect,
            store,
            emitter: Emitter::new(submitter, options.completion_timeout),
            limiter: BatchRateLimiter::new(RateLimitConfig::new(options.batches_per_second)),
            batch_size: options.batch_size.max(1),
            cancel: CancellationToken::new(),
            stats: ScanStats::new(),
            in_flight: Mutex::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
            finished: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
            options,
        }
    }

    /// Token that stops the run when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Queue `works` and start the worker pool
    pub fn start(self, works: Vec<TableWork>) -> ScanHandle {
        let total = works.len() as u64;
        let capacity = self.options.work_queue_capacity.unwrap_or(works.len()).max(1);
        let workers_count = self.options.nr_scanner.max(1);
        let (tx, rx) = mpsc::channel::<TableWork>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        info!(
            tables = total,
            workers = workers_count,
            batch_size = self.shared.batch_size,
            "Starting batch table scan"
        );

        let cancel = self.shared.cancel.clone();
        let feeder = tokio::spawn(async move {
            for work in works {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(work) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let workers = (0..workers_count)
            .map(|id| tokio::spawn(worker_loop(id, self.shared.clone(), rx.clone())))
            .collect();

        ScanHandle {
            shared: self.shared,
            feeder,
            workers,
            total,
            started: Instant::now(),
        }
    }
}

/// A running scan
pub struct ScanHandle {
    shared: Arc<Shared>,
    feeder: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    total: u64,
    started: Instant,
}

impl ScanHandle {
    /// Stop after in-flight batches finish
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Current counters
    pub fn stats(&self) -> ScanStatsSnapshot {
        self.shared
            .stats
            .snapshot(self.shared.emitter.rows_committed())
    }

    /// Wait for every worker and build the report
    pub async fn join(self) -> ScanReport {
        if let Err(e) = self.feeder.await {
            error!("Work feeder ended abnormally: {}", e);
        }
        for (id, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!(worker = id, "Scanner worker ended abnormally: {}", e);
                self.shared.failures.lock().push(TableFailure {
                    table: format!("<worker {}>", id),
                    error: e.to_string(),
                });
            }
        }

        let finished = self.shared.finished.load(Ordering::Relaxed);
        let cancelled = self.shared.cancel.is_cancelled() && finished < self.total;
        let report = ScanReport {
            stats: self
                .shared
                .stats
                .snapshot(self.shared.emitter.rows_committed()),
            failed: self.shared.failures.lock().clone(),
            cancelled,
            rate_limiter: self.shared.limiter.stats(),
            elapsed: self.started.elapsed(),
        };
        info!(
            completed = report.stats.tables_completed,
            failed = report.stats.tables_failed,
            skipped = report.stats.tables_skipped,
            rows = report.stats.rows_emitted,
            cancelled = report.cancelled,
            "Batch table scan finished in {:?}",
            report.elapsed
        );
        report
    }

    /// Wait for the run; fails when it was cancelled or any table failed
    pub async fn wait(self) -> Result<ScanReport> {
        self.join().await.into_result()
    }
}

async fn worker_loop(
    id: usize,
    shared: Arc<Shared>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<TableWork>>>,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => None,
                work = rx.recv() => work,
            }
        };
        let Some(work) = next else {
            debug!(worker = id, "Scanner worker exiting");
            return;
        };

        let identity = work.identity().clone();
        if !shared.in_flight.lock().insert(identity.clone()) {
            warn!(worker = id, table = %identity, "Table is already being scanned, skipping duplicate");
            shared.stats.record_table_skipped();
            shared.finished.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let result = scan_table(&shared, &work).await;
        shared.in_flight.lock().remove(&identity);

        match result {
            Ok(outcome) => {
                shared.finished.fetch_add(1, Ordering::Relaxed);
                if outcome.skipped {
                    shared.stats.record_table_skipped();
                } else {
                    shared.stats.record_table_completed();
                    info!(
                        worker = id,
                        table = %identity,
                        batches = outcome.batches,
                        rows = outcome.rows,
                        "Table scan complete"
                    );
                }
            }
            Err(Error::Cancelled) => {
                info!(worker = id, table = %identity, "Table scan cancelled");
                return;
            }
            Err(e) => {
                shared.finished.fetch_add(1, Ordering::Relaxed);
                error!(worker = id, table = %identity, "Table scan failed: {}", e);
                shared.stats.record_table_failed();
                shared.failures.lock().push(TableFailure {
                    table: identity.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

async fn scan_table(shared: &Shared, work: &TableWork) -> Result<TableOutcome> {
    let conn = shared.conn.as_ref();
    let dialect = shared.dialect.as_ref();
    let mut state = init_table_position(conn, dialect, &shared.store, work).await?;

    if state.is_exhausted()? {
        if !state.done {
            state.done = true;
            shared.store.put(state.clone())?;
        }
        info!(table = %state.identity, "Table already complete, nothing to scan");
        return Ok(TableOutcome {
            skipped: true,
            ..Default::default()
        });
    }

    let builder = RangeQueryBuilder::new(dialect.qualified_table(&state.identity), shared.batch_size);
    let scan_columns = state.scan_columns.columns().to_vec();
    let quoted_scan_columns = dialect.quote_columns(&scan_columns);
    let order_columns: Vec<String> = work
        .table
        .column_names()
        .into_iter()
        .map(|c| dialect.quote_identifier(c))
        .collect();

    info!(
        table = %state.identity,
        scan_columns = %state.scan_columns,
        resumed = state.current.is_some() || state.rows_scanned > 0,
        "Scanning table"
    );

    let mut outcome = TableOutcome::default();
    loop {
        if shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        shared.limiter.acquire_cancellable(&shared.cancel).await?;

        let query = next_query(&builder, &state, &quoted_scan_columns, &order_columns)?;
        let rows = conn.query(&query.sql, &query.args).await?;
        outcome.batches += 1;

        if rows.is_empty() {
            state.done = true;
            shared.store.put(state.clone())?;
            shared.stats.record_batch(0);
            break;
        }

        let count = rows.len();
        let last = match &state.scan_columns {
            ScanColumnSet::Keyed(_) => rows
                .last()
                .map(|row| Bound::from_row(row, &scan_columns))
                .transpose()?,
            ScanColumnSet::FullDump => None,
        };

        shared.emitter.emit_batch(&state.identity, rows).await?;

        state.rows_scanned += count as u64;
        if last.is_some() {
            state.current = last;
        }
        if count < shared.batch_size || state.is_exhausted()? {
            state.done = true;
        }
        shared.store.put(state.clone())?;
        shared.stats.record_batch(count as u64);
        outcome.rows += count as u64;

        debug!(
            table = %state.identity,
            batch = outcome.batches,
            rows = count,
            done = state.done,
            "Batch committed"
        );

        if state.done {
            break;
        }
    }

    Ok(outcome)
}

fn next_query(
    builder: &RangeQueryBuilder,
    state: &TableScanState,
    quoted_scan_columns: &[String],
    order_columns: &[String],
) -> Result<RangeQuery> {
    match (&state.scan_columns, &state.current) {
        (ScanColumnSet::FullDump, _) => builder.full_dump(order_columns, state.rows_scanned),
        (ScanColumnSet::Keyed(_), None) => builder.initial_range(
            quoted_scan_columns,
            &state.min.values(),
            &state.max.values(),
        ),
        (ScanColumnSet::Keyed(_), Some(current)) => builder.range(
            quoted_scan_columns,
            &current.values(),
            &state.max.values(),
        ),
    }
}

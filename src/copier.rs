//! The parallel chunk copier.
//!
//! Drives a [`Chunker`] over the source table's PK space and executes up
//! to `concurrency` bulk `INSERT IGNORE ... SELECT` copies into the
//! shadow table at a time. Insert-if-not-exists semantics make every
//! chunk safe to re-execute, which is what allows resume-from-checkpoint
//! to replay work whose completion was never durably recorded.
//!
//! Progress is tracked with two counters: the DB-reported affected rows
//! (exact work done, but undercounts on resume) and the logical rows (sum
//! of chunk sizes, exact even on resume). Which one feeds the progress
//! and ETA estimates depends on whether the PK is a monotonic integer:
//! `max_value` is a far better total than table statistics when it is.
//! The statistics-based estimate is known to drift on tables with skewed
//! row sizes; the progress string reflects whatever the chosen counters
//! say.

use crate::chunk::{new_chunker, Chunk, Chunker};
use crate::dbconn::DbExecutor;
use crate::error::{Result, ShiftError};
use crate::metrics::{
    MetricKind, MetricValue, Metrics, MetricsSink, NoopSink, CHUNK_AFFECTED_ROWS_COUNT,
    CHUNK_LOGICAL_ROWS_COUNT, CHUNK_PROCESSING_TIME, SINK_TIMEOUT,
};
use crate::repl::KeyAboveWatermark;
use crate::table::{intersect_columns, TableInfo};
use crate::throttler::{NoopThrottler, Throttler};
use mysql_async::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How frequently the copy speed is re-estimated.
pub const COPY_ESTIMATE_INTERVAL: Duration = Duration::from_secs(10);
/// How long after start before the first ETA is produced, so a fast
/// start does not skew the estimate.
pub const COPY_ETA_INITIAL_WAIT: Duration = Duration::from_secs(60);

const ETA_HISTORY_LEN: usize = 5;
const ETA_SAMPLE_SPACING: Duration = Duration::from_secs(60);

/// Copier construction options.
pub struct CopierConfig {
    pub concurrency: usize,
    /// Target wall-clock time per chunk, passed through to the chunker.
    pub target_chunk_time: Duration,
    /// Whether a checksum pass will validate the copy afterwards. Selects
    /// the stricter transaction-retry mode.
    pub final_checksum: bool,
    pub throttler: Arc<dyn Throttler>,
    pub metrics_sink: Arc<dyn MetricsSink>,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            target_chunk_time: Duration::from_millis(1000),
            final_checksum: true,
            throttler: Arc::new(NoopThrottler),
            metrics_sink: Arc::new(NoopSink),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EtaSample {
    at: Instant,
    estimate: Duration,
}

/// Bounded ring of recent ETA estimates, for the trend annotation.
#[derive(Debug, Default)]
struct EtaHistory {
    samples: VecDeque<EtaSample>,
}

impl EtaHistory {
    fn add_current_estimate_and_compare(&mut self, estimate: Duration) -> Option<&'static str> {
        self.add_at(Instant::now(), estimate)
    }

    fn add_at(&mut self, now: Instant, estimate: Duration) -> Option<&'static str> {
        let spaced = self
            .samples
            .back()
            .map_or(true, |s| now.duration_since(s.at) >= ETA_SAMPLE_SPACING);
        if spaced {
            self.samples.push_back(EtaSample { at: now, estimate });
            if self.samples.len() > ETA_HISTORY_LEN {
                self.samples.pop_front();
            }
        }
        if self.samples.len() < 2 {
            return None;
        }
        let oldest = self.samples.front()?.estimate.as_secs_f64();
        if oldest <= 0.0 {
            return None;
        }
        let ratio = estimate.as_secs_f64() / oldest;
        Some(if ratio > 1.1 {
            "increasing"
        } else if ratio < 0.9 {
            "decreasing"
        } else {
            "stable"
        })
    }
}

struct CopierInner {
    start_time: Option<Instant>,
    exec_time: Duration,
    is_invalid: bool,
    throttler: Arc<dyn Throttler>,
}

/// Orchestrates parallel chunk copies from the source table into the
/// shadow table.
pub struct Copier {
    db: Arc<dyn DbExecutor>,
    table: Arc<TableInfo>,
    new_table: Arc<TableInfo>,
    chunker: Arc<dyn Chunker>,
    concurrency: usize,
    final_checksum: bool,
    metrics_sink: Arc<dyn MetricsSink>,
    copy_rows_count: AtomicU64,
    copy_rows_logical_count: AtomicU64,
    copy_chunks_count: AtomicU64,
    rows_per_second: AtomicU64,
    is_open: AtomicBool,
    inner: Mutex<CopierInner>,
    eta_history: Mutex<EtaHistory>,
}

impl Copier {
    /// Create a copier with the built-in chunker for the table's PK shape.
    pub fn new(
        db: Arc<dyn DbExecutor>,
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        config: CopierConfig,
    ) -> Result<Self> {
        let chunker = new_chunker(table.clone(), config.target_chunk_time)?;
        Self::with_chunker(db, table, new_table, chunker, config)
    }

    /// Create a copier around an externally supplied chunker.
    pub fn with_chunker(
        db: Arc<dyn DbExecutor>,
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        chunker: Arc<dyn Chunker>,
        config: CopierConfig,
    ) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(ShiftError::config("concurrency must be at least 1"));
        }
        if intersect_columns(&table, &new_table).is_empty() {
            return Err(ShiftError::table(format!(
                "{} and {} share no copyable columns",
                table.quoted_name(),
                new_table.quoted_name()
            )));
        }
        Ok(Self {
            db,
            table,
            new_table,
            chunker,
            concurrency: config.concurrency,
            final_checksum: config.final_checksum,
            metrics_sink: config.metrics_sink,
            copy_rows_count: AtomicU64::new(0),
            copy_rows_logical_count: AtomicU64::new(0),
            copy_chunks_count: AtomicU64::new(0),
            rows_per_second: AtomicU64::new(0),
            is_open: AtomicBool::new(false),
            inner: Mutex::new(CopierInner {
                start_time: None,
                exec_time: Duration::ZERO,
                is_invalid: false,
                throttler: config.throttler,
            }),
            eta_history: Mutex::new(EtaHistory::default()),
        })
    }

    /// Create a copier resuming from a checkpoint.
    ///
    /// The chunker is opened at the persisted low watermark and the row
    /// counters are seeded from the checkpoint. Chunk overlap with the
    /// previously copied region is harmless because the chunk inserts are
    /// idempotent.
    pub fn new_from_checkpoint(
        db: Arc<dyn DbExecutor>,
        table: Arc<TableInfo>,
        new_table: Arc<TableInfo>,
        config: CopierConfig,
        low_watermark: &str,
        rows_copied: u64,
        rows_copied_logical: u64,
    ) -> Result<Self> {
        let copier = Self::new(db, table, new_table, config)?;
        copier.chunker.open_at_watermark(low_watermark)?;
        copier.is_open.store(true, Ordering::Release);
        copier.copy_rows_count.store(rows_copied, Ordering::Relaxed);
        copier
            .copy_rows_logical_count
            .store(rows_copied_logical, Ordering::Relaxed);
        Ok(copier)
    }

    /// Run the copy to completion.
    ///
    /// Returns once every chunk has been copied, or with the first error
    /// after in-flight workers drain. Chunk-level retries are delegated
    /// to the transaction layer; any error surfacing here is fatal to the
    /// run and resume happens from the last durable checkpoint.
    pub async fn run(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        info!(
            table = %self.table.quoted_name(),
            shadow = %self.new_table.quoted_name(),
            concurrency = self.concurrency,
            "starting row copy"
        );
        self.inner.lock().unwrap().start_time = Some(Instant::now());
        if !self.is_open.swap(true, Ordering::AcqRel) {
            // Resume-from-checkpoint arrives already open.
            self.chunker.open()?;
        }

        let estimator = {
            let copier = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move { copier.estimate_rows_per_second_loop(token).await })
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        let mut first_error: Option<ShiftError> = None;

        while !self.chunker.is_read() && self.is_healthy(token) {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let chunk = match self.chunker.next() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    self.set_invalid(true);
                    first_error.get_or_insert(e);
                    break;
                }
            };
            let copier = Arc::clone(self);
            let token = token.clone();
            workers.spawn(async move {
                let _permit = permit;
                let result = copier.copy_chunk(&token, &chunk).await;
                if result.is_err() {
                    copier.set_invalid(true);
                }
                result
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    self.set_invalid(true);
                    first_error
                        .get_or_insert_with(|| ShiftError::other(format!("copy worker panicked: {e}")));
                }
            }
        }
        estimator.abort();

        {
            let mut inner = self.inner.lock().unwrap();
            inner.exec_time = inner.start_time.map(|t| t.elapsed()).unwrap_or_default();
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    chunks = self.copy_chunks_count.load(Ordering::Relaxed),
                    rows = self.copy_rows_count.load(Ordering::Relaxed),
                    "row copy finished"
                );
                Ok(())
            }
        }
    }

    /// Copy a single chunk and feed the chunker.
    ///
    /// Public so tests and harnesses can drive chunks one at a time.
    pub async fn copy_chunk(&self, token: &CancellationToken, chunk: &Chunk) -> Result<()> {
        let throttler = self.throttler();
        tokio::select! {
            _ = token.cancelled() => return Err(ShiftError::Cancelled),
            _ = throttler.block_wait() => {}
        }

        let started = Instant::now();
        let columns = intersect_columns(&self.table, &self.new_table);
        // INSERT IGNORE: resume from checkpoint re-applies some previously
        // executed work, and duplicate rows must not error.
        let query = format!(
            "INSERT IGNORE INTO {} ({}) SELECT {} FROM {} FORCE INDEX (PRIMARY) WHERE {}",
            self.new_table.quoted_name(),
            columns,
            columns,
            self.table.quoted_name(),
            chunk,
        );
        debug!(chunk = %chunk, "running chunk copy");
        let affected = self
            .db
            .retryable_transaction(token, self.final_checksum, vec![query])
            .await?;

        self.copy_rows_count.fetch_add(affected, Ordering::Relaxed);
        self.copy_rows_logical_count
            .fetch_add(chunk.chunk_size, Ordering::Relaxed);
        self.copy_chunks_count.fetch_add(1, Ordering::Relaxed);

        let processing_time = started.elapsed();
        self.chunker.feedback(chunk, processing_time);

        if let Err(e) = self
            .send_metrics(processing_time, chunk.chunk_size, affected)
            .await
        {
            // Metrics failures never affect the copy.
            error!("error sending metrics from copier: {e}");
        }
        Ok(())
    }

    fn is_healthy(&self, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        !self.inner.lock().unwrap().is_invalid
    }

    fn set_invalid(&self, invalid: bool) {
        self.inner.lock().unwrap().is_invalid = invalid;
    }

    fn throttler(&self) -> Arc<dyn Throttler> {
        self.inner.lock().unwrap().throttler.clone()
    }

    /// Swap the throttler. Takes effect from the next chunk.
    pub fn set_throttler(&self, throttler: Arc<dyn Throttler>) {
        self.inner.lock().unwrap().throttler = throttler;
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.inner.lock().unwrap().start_time
    }

    pub fn exec_time(&self) -> Duration {
        self.inner.lock().unwrap().exec_time
    }

    pub fn copy_rows_count(&self) -> u64 {
        self.copy_rows_count.load(Ordering::Relaxed)
    }

    pub fn copy_rows_logical_count(&self) -> u64 {
        self.copy_rows_logical_count.load(Ordering::Relaxed)
    }

    pub fn copy_chunks_count(&self) -> u64 {
        self.copy_chunks_count.load(Ordering::Relaxed)
    }

    /// Copied/total/percent under the counting strategy for this PK
    /// shape: monotonic integer PKs measure logical rows against
    /// `max_value`, everything else measures affected rows against the
    /// statistics estimate.
    fn copy_stats(&self) -> (u64, u64, f64) {
        let (copied, total) = if self.table.key_is_auto_inc {
            (
                self.copy_rows_logical_count.load(Ordering::Relaxed),
                self.table.max_value.unwrap_or(self.table.estimated_rows),
            )
        } else {
            (
                self.copy_rows_count.load(Ordering::Relaxed),
                self.table.estimated_rows,
            )
        };
        let pct = if total == 0 {
            if copied == 0 {
                0.0
            } else {
                100.0
            }
        } else {
            copied as f64 / total as f64 * 100.0
        };
        (copied, total, pct)
    }

    /// Human-readable progress, e.g. `4500/10000 45.00%`.
    pub fn get_progress(&self) -> String {
        let (copied, total, pct) = self.copy_stats();
        format!("{copied}/{total} {pct:.2}%")
    }

    /// Estimated time to completion: `TBD` during warm-up, `DUE` at or
    /// past 99.99%, otherwise a duration, annotated with the trend
    /// against recent estimates once enough history exists.
    pub fn get_eta(&self) -> String {
        let (copied, total, pct) = self.copy_stats();
        if pct > 99.99 {
            return "DUE".to_string();
        }
        let rows_per_second = self.rows_per_second.load(Ordering::Relaxed);
        let warmed_up = self
            .start_time()
            .is_some_and(|t| t.elapsed() >= COPY_ETA_INITIAL_WAIT);
        if rows_per_second == 0 || !warmed_up {
            return "TBD".to_string();
        }
        let remaining = total.saturating_sub(copied);
        let estimate = Duration::from_secs(remaining / rows_per_second);
        match self
            .eta_history
            .lock()
            .unwrap()
            .add_current_estimate_and_compare(estimate)
        {
            Some(trend) => format!("{} ({trend})", format_duration(estimate)),
            None => format_duration(estimate),
        }
    }

    fn estimate_counter(&self) -> u64 {
        if self.table.key_is_auto_inc {
            self.copy_rows_logical_count.load(Ordering::Relaxed)
        } else {
            self.copy_rows_count.load(Ordering::Relaxed)
        }
    }

    async fn estimate_rows_per_second_loop(&self, token: CancellationToken) {
        // >10 second averages: parallel copy makes shorter windows bounce
        // around too much to be useful.
        let mut prev = self.estimate_counter();
        let mut ticker = tokio::time::interval(COPY_ESTIMATE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if self.inner.lock().unwrap().is_invalid {
                        return;
                    }
                    let current = self.estimate_counter();
                    let per_second =
                        current.saturating_sub(prev) / COPY_ESTIMATE_INTERVAL.as_secs();
                    self.rows_per_second.store(per_second, Ordering::Relaxed);
                    prev = current;
                }
            }
        }
    }

    async fn send_metrics(
        &self,
        processing_time: Duration,
        logical_rows: u64,
        affected_rows: u64,
    ) -> Result<()> {
        let metrics = Metrics {
            values: vec![
                MetricValue {
                    name: CHUNK_PROCESSING_TIME,
                    kind: MetricKind::Gauge,
                    value: processing_time.as_millis() as f64,
                },
                MetricValue {
                    name: CHUNK_LOGICAL_ROWS_COUNT,
                    kind: MetricKind::Counter,
                    value: logical_rows as f64,
                },
                MetricValue {
                    name: CHUNK_AFFECTED_ROWS_COUNT,
                    kind: MetricKind::Counter,
                    value: affected_rows as f64,
                },
            ],
        };
        match tokio::time::timeout(SINK_TIMEOUT, self.metrics_sink.send(metrics)).await {
            Ok(result) => result,
            Err(_) => Err(ShiftError::timeout("metrics sink send timed out")),
        }
    }

    /// The stringified low watermark: the resumable copy checkpoint.
    pub fn get_low_watermark(&self) -> Result<String> {
        self.chunker.get_low_watermark()
    }
}

impl KeyAboveWatermark for Copier {
    fn key_above_high_watermark(&self, key: &Value) -> bool {
        self.chunker.key_above_high_watermark(key)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

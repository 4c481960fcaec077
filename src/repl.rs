//! The binlog change tracker.
//!
//! Consumes the replication stream for the source table, coalesces
//! changed keys into the [`Changeset`] buffer, and periodically flushes
//! the buffer into the shadow table with idempotent DELETE / REPLACE
//! statements. Together with the copier's low watermark, the synced
//! position it maintains forms the crash-safe resumption checkpoint.
//!
//! ## Key-above-watermark optimization
//!
//! While the copier is actively copying, any row event whose PK lies
//! strictly above the chunker's high watermark can be discarded: the
//! bulk copy has not reached that key yet and will read the row's final
//! state when it does. The optimization is off by default, since enabling
//! it before the copier opens (or after cutover begins) would lose events;
//! the coordinator toggles it on only during the copy phase. Turning it
//! off never affects correctness, only throughput.
//!
//! ## Pull semantics of REPLACE
//!
//! Flushed replaces read the source table at flush time, not at event
//! time, so the applied value may be newer than the event's row image.
//! That is intentional: the source's final state subsumes every earlier
//! in-window mutation of the same PK.

use crate::changeset::Changeset;
use crate::dbconn::DbExecutor;
use crate::error::{Result, ShiftError};
use crate::fingerprint::{hash_key, unhash_key};
use crate::position::BinlogPosition;
use crate::subscription::{BinlogSubscription, ReplEvent, RowAction, SubscriptionConnector};
use crate::table::{intersect_columns, quote_identifier, TableInfo};
use mysql_async::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Below this many pending entries the changeset is considered trivial
/// and the coordinator may proceed to cutover.
pub const BINLOG_TRIVIAL_THRESHOLD: usize = 1000;
/// Entries applied per flush transaction.
pub const FLUSH_BATCH_SIZE: usize = 10_000;

const BLOCK_WAIT_POLL: Duration = Duration::from_millis(100);

/// Read-only view of the copier's high watermark.
///
/// The tracker holds this weakly: the chunker belongs to the copier, and
/// a dropped copier simply disables the optimization (events fall back to
/// the changeset, which is always safe).
pub trait KeyAboveWatermark: Send + Sync {
    fn key_above_high_watermark(&self, key: &Value) -> bool;
}

/// Invoked when DDL touches the source or shadow table mid-migration.
pub type TableChangedCallback = Box<dyn Fn() + Send + Sync>;

/// Tracks changes to the source table through the binary log.
pub struct BinlogTracker {
    db: Arc<dyn DbExecutor>,
    table: Arc<TableInfo>,
    shadow_table: Arc<TableInfo>,
    connector: Arc<dyn SubscriptionConnector>,
    changeset: Changeset,
    watermark: Mutex<Option<Weak<dyn KeyAboveWatermark>>>,
    watermark_enabled: AtomicBool,
    table_changed_callback: Mutex<Option<TableChangedCallback>>,
    failed: AtomicBool,
    /// Row images seen for the tracked table.
    rows_event_count: AtomicU64,
    /// Row images discarded by the key-above-watermark optimization.
    rows_discarded_count: AtomicU64,
    /// Entries applied to the shadow table across all flushes.
    rows_flushed_count: AtomicU64,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl BinlogTracker {
    pub fn new(
        db: Arc<dyn DbExecutor>,
        table: Arc<TableInfo>,
        shadow_table: Arc<TableInfo>,
        connector: Arc<dyn SubscriptionConnector>,
    ) -> Self {
        Self {
            db,
            table,
            shadow_table,
            connector,
            changeset: Changeset::new(),
            watermark: Mutex::new(None),
            watermark_enabled: AtomicBool::new(false),
            table_changed_callback: Mutex::new(None),
            failed: AtomicBool::new(false),
            rows_event_count: AtomicU64::new(0),
            rows_discarded_count: AtomicU64::new(0),
            rows_flushed_count: AtomicU64::new(0),
            consumer: Mutex::new(None),
        }
    }

    /// Attach the copier's watermark view. The optimization additionally
    /// needs [`set_key_above_watermark_optimization`] to be turned on.
    ///
    /// [`set_key_above_watermark_optimization`]: Self::set_key_above_watermark_optimization
    pub fn attach_watermark(&self, view: &Arc<dyn KeyAboveWatermark>) {
        *self.watermark.lock().unwrap() = Some(Arc::downgrade(view));
    }

    /// Toggle the key-above-watermark optimization. Only safe while the
    /// copier is actively copying rows.
    pub fn set_key_above_watermark_optimization(&self, enabled: bool) {
        self.watermark_enabled.store(enabled, Ordering::Release);
    }

    /// Register the DDL failsafe callback.
    pub fn set_table_changed_callback(&self, callback: TableChangedCallback) {
        *self.table_changed_callback.lock().unwrap() = Some(callback);
    }

    /// Set the synced position (resume from checkpoint). Must be called
    /// before [`start`](Self::start).
    pub fn set_pos(&self, pos: BinlogPosition) {
        self.changeset.set_synced(pos);
    }

    /// The crash-safe checkpoint position: everything up to it has been
    /// flushed to the shadow table.
    pub fn get_synced_position(&self) -> Option<BinlogPosition> {
        self.changeset.synced()
    }

    /// Externally observable pending work, non-collapsing during flushes.
    pub fn pending_count(&self) -> usize {
        self.changeset.len()
    }

    /// Row images seen for the tracked table.
    pub fn rows_event_count(&self) -> u64 {
        self.rows_event_count.load(Ordering::Relaxed)
    }

    /// Row images eliminated by the watermark optimization.
    pub fn rows_discarded_count(&self) -> u64 {
        self.rows_discarded_count.load(Ordering::Relaxed)
    }

    /// Entries applied to the shadow table across all flushes.
    pub fn rows_flushed_count(&self) -> u64 {
        self.rows_flushed_count.load(Ordering::Relaxed)
    }

    /// False once the background consumer has hit a fatal error.
    pub fn is_healthy(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    /// Open the subscription and spawn the background consumer.
    ///
    /// With no prior position the stream starts at the server's current
    /// master position. With a resumed position, the position's log file
    /// is validated against the server's log inventory first so a purged
    /// file fails synchronously instead of from the background task.
    pub async fn start(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let start_pos = match self.changeset.synced() {
            Some(pos) => {
                if self.position_is_impossible(&pos).await {
                    return Err(ShiftError::PositionPurged(pos.to_string()));
                }
                pos
            }
            None => {
                let pos = self.db.master_status().await?;
                self.changeset.set_synced(pos.clone());
                pos
            }
        };
        self.changeset.init_stream(start_pos.clone());

        let subscription = self.connector.connect(&start_pos).await?;
        info!(
            file = %start_pos.file,
            pos = start_pos.pos,
            table = %self.table.quoted_name(),
            "starting binary log subscription"
        );

        let tracker = Arc::clone(self);
        let token = token.clone();
        let handle = tokio::spawn(async move { tracker.consume(subscription, token).await });
        *self.consumer.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn position_is_impossible(&self, pos: &BinlogPosition) -> bool {
        match self.db.master_logs().await {
            Ok(logs) => !logs.iter().any(|log| log == &pos.file),
            // If the logs cannot be enumerated the position is already
            // impossible to prove usable.
            Err(_) => true,
        }
    }

    async fn consume(&self, mut subscription: Box<dyn BinlogSubscription>, token: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return,
                next = subscription.next_event() => next,
            };
            match next {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => {
                    warn!("binlog subscription stream ended");
                    self.failed.store(true, Ordering::Release);
                    return;
                }
                Err(e) => {
                    // Fatal: the coordinator resumes from the checkpoint.
                    error!("binlog subscription has failed: {e}");
                    self.failed.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }

    fn handle_event(&self, event: ReplEvent) {
        match event {
            ReplEvent::Rows {
                schema,
                table,
                action,
                rows,
                log_pos,
            } => {
                if self.table.is_named(&schema, &table) {
                    for row in &rows {
                        self.rows_event_count.fetch_add(1, Ordering::Relaxed);
                        let Some(key) = self.table.extract_primary_key(row) else {
                            warn!("row image too short to extract the primary key");
                            continue;
                        };
                        if self.key_above_high_watermark(&key) {
                            // The copy has not reached this key yet; the
                            // bulk copy reads its final state later.
                            self.rows_discarded_count.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        self.changeset
                            .record(hash_key(&key), action == RowAction::Delete);
                    }
                }
                // Positions advance on all traffic, not just the tracked
                // table, so block-wait can observe a busy server.
                self.changeset.update_row_pos(log_pos);
            }
            ReplEvent::Rotate { next_log } => self.changeset.rotate(next_log),
            ReplEvent::TableChanged { schema, table } => {
                if self.table.is_named(&schema, &table)
                    || self.shadow_table.is_named(&schema, &table)
                {
                    // Failsafe: DDL on either table mid-migration is fatal
                    // and the decision belongs to the coordinator.
                    if let Some(callback) = self.table_changed_callback.lock().unwrap().as_ref() {
                        callback();
                    }
                }
            }
            ReplEvent::Heartbeat => {}
        }
    }

    fn key_above_high_watermark(&self, key: &[Value]) -> bool {
        if !self.watermark_enabled.load(Ordering::Acquire) {
            return false;
        }
        let view = match self.watermark.lock().unwrap().as_ref().and_then(Weak::upgrade) {
            Some(view) => view,
            None => return false,
        };
        key.first()
            .map(|k| view.key_above_high_watermark(k))
            .unwrap_or(false)
    }

    /// Apply the buffered changeset to the shadow table.
    ///
    /// Captures the map and the in-memory position under the mutex, then
    /// drains the capture in batched transactions with the lock released.
    /// On success the synced position advances to the captured position;
    /// on error it does not, and the window replays after resume.
    pub async fn flush(&self, token: &CancellationToken) -> Result<()> {
        let (captured, pos) = self.changeset.swap();
        let total = captured.len();

        let result = self.flush_captured(token, &captured).await;
        match result {
            Ok(()) => {
                self.rows_flushed_count
                    .fetch_add(total as u64, Ordering::Relaxed);
                self.changeset.settle(pos);
                debug!(entries = total, "changeset flushed");
                Ok(())
            }
            Err(e) => {
                self.changeset.zero_delta();
                Err(e)
            }
        }
    }

    async fn flush_captured(
        &self,
        token: &CancellationToken,
        captured: &std::collections::HashMap<String, bool>,
    ) -> Result<()> {
        let mut delete_keys: Vec<&str> = Vec::new();
        let mut replace_keys: Vec<&str> = Vec::new();
        let mut batched = 0usize;
        for (key, tombstone) in captured {
            if *tombstone {
                delete_keys.push(key);
            } else {
                replace_keys.push(key);
            }
            batched += 1;
            if batched % FLUSH_BATCH_SIZE == 0 {
                self.apply_batch(token, &mut delete_keys, &mut replace_keys)
                    .await?;
                self.changeset.drain_delta(FLUSH_BATCH_SIZE as i64);
            }
        }
        self.apply_batch(token, &mut delete_keys, &mut replace_keys)
            .await
    }

    /// One retryable transaction: a DELETE for the tombstoned batch and a
    /// REPLACE pulling current rows from the source for the live batch.
    async fn apply_batch(
        &self,
        token: &CancellationToken,
        delete_keys: &mut Vec<&str>,
        replace_keys: &mut Vec<&str>,
    ) -> Result<()> {
        if delete_keys.is_empty() && replace_keys.is_empty() {
            return Ok(());
        }
        let mut statements = Vec::new();
        if !delete_keys.is_empty() {
            statements.push(format!(
                "DELETE FROM {} WHERE ({}) IN ({})",
                self.shadow_table.quoted_name(),
                self.shadow_table.quoted_primary_key(),
                values_constructor(delete_keys)?,
            ));
        }
        if !replace_keys.is_empty() {
            let columns = intersect_columns(&self.table, &self.shadow_table);
            statements.push(format!(
                "REPLACE INTO {} ({}) SELECT {} FROM {} FORCE INDEX (PRIMARY) WHERE ({}) IN ({})",
                self.shadow_table.quoted_name(),
                columns,
                columns,
                self.table.quoted_name(),
                self.table.quoted_primary_key(),
                values_constructor(replace_keys)?,
            ));
        }
        self.db.retryable_transaction(token, false, statements).await?;
        delete_keys.clear();
        replace_keys.clear();
        Ok(())
    }

    /// Flush repeatedly until the buffer is trivially small and the
    /// subscription has caught up to the server. This is the handoff
    /// routine the coordinator calls before cutover.
    pub async fn flush_until_trivial(&self, token: &CancellationToken) -> Result<()> {
        info!("starting to flush changeset");
        loop {
            self.flush(token).await?;
            self.block_wait(token).await?;
            if self.changeset.map_len() < BINLOG_TRIVIAL_THRESHOLD {
                break;
            }
        }
        Ok(())
    }

    /// Block until the subscription has caught up to the server's master
    /// position as of entry.
    ///
    /// A quiet server may never push the stream past the target on its
    /// own, so each poll performs a benign no-op ALTER on the checkpoint
    /// helper table to generate an event. The helper must not be the
    /// source or shadow table: DDL on those trips the failsafe.
    pub async fn block_wait(&self, token: &CancellationToken) -> Result<()> {
        let target = self.db.master_status().await?;
        loop {
            self.inject_binlog_noise().await?;
            if self.changeset.in_memory().map_or(false, |pos| pos >= target) {
                return Ok(());
            }
            if !self.is_healthy() {
                return Err(ShiftError::replication(
                    "binlog subscription has failed while waiting to catch up",
                ));
            }
            tokio::select! {
                _ = token.cancelled() => return Err(ShiftError::Cancelled),
                _ = tokio::time::sleep(BLOCK_WAIT_POLL) => {}
            }
        }
    }

    async fn inject_binlog_noise(&self) -> Result<()> {
        let statement = format!(
            "ALTER TABLE {}.{} AUTO_INCREMENT=0",
            quote_identifier(&self.table.schema_name),
            quote_identifier(&format!("_{}_chkpnt", self.table.table_name)),
        );
        self.db.exec(&statement).await?;
        Ok(())
    }

    /// Abort the background consumer, if one is running.
    pub fn close(&self) {
        if let Some(handle) = self.consumer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn values_constructor(keys: &[&str]) -> Result<String> {
    let tuples = keys
        .iter()
        .map(|k| unhash_key(k))
        .collect::<Result<Vec<_>>>()?;
    Ok(tuples.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_constructor() {
        let a = hash_key(&[Value::Int(7), Value::Int(10)]);
        let b = hash_key(&[Value::Int(1), Value::Int(5)]);
        let keys = vec![a.as_str(), b.as_str()];
        assert_eq!(values_constructor(&keys).unwrap(), "(7,10),(1,5)");
    }

    #[test]
    fn test_trivial_threshold_constant() {
        // The cutover handoff depends on this bound staying small.
        assert!(BINLOG_TRIVIAL_THRESHOLD <= FLUSH_BATCH_SIZE);
    }
}

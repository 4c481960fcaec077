//! The coalescing changeset buffer.
//!
//! A de-duplicated map from PK fingerprint to tombstone flag: `true`
//! means the last observed operation on that key was a delete, `false`
//! an insert or update. A key appears at most once; later events
//! overwrite the earlier flag, which is sound because the flush REPLACEs
//! live rows from the source's current state and DELETEs tombstoned
//! ones; intermediate states are unobservable at PK granularity.
//!
//! One mutex guards the map and the two replication positions; it is
//! never held across a database round-trip. The flush swaps the map out
//! under the lock and drains it outside, while the signed delta keeps
//! `len()` reporting a non-collapsing estimate of pending work.

use crate::position::BinlogPosition;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct ChangesetState {
    entries: HashMap<String, bool>,
    /// Most recent position seen on a row event.
    pos_in_memory: Option<BinlogPosition>,
    /// Position of the last successfully flushed changeset: the
    /// crash-safe checkpoint.
    pos_synced: Option<BinlogPosition>,
    /// Log file from the most recent rotation event; row events only
    /// carry an offset.
    current_log_file: String,
}

/// In-memory buffer of keys changed since the migration started.
#[derive(Debug, Default)]
pub struct Changeset {
    state: Mutex<ChangesetState>,
    delta: AtomicI64,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a key: later operations overwrite earlier flags.
    pub fn record(&self, fingerprint: String, tombstone: bool) {
        let mut st = self.state.lock().unwrap();
        st.entries.insert(fingerprint, tombstone);
    }

    /// Externally observable pending work: map size plus the in-flight
    /// flush delta.
    pub fn len(&self) -> usize {
        let entries = self.state.lock().unwrap().entries.len() as i64;
        (entries + self.delta.load(Ordering::Acquire)).max(0) as usize
    }

    /// Size of the live map only, ignoring any in-flight flush.
    pub fn map_len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically swap in a fresh map; returns the captured entries and
    /// the in-memory position at the moment of the swap. The delta is set
    /// to the captured length so `len()` keeps reporting the drained work.
    pub fn swap(&self) -> (HashMap<String, bool>, Option<BinlogPosition>) {
        let mut st = self.state.lock().unwrap();
        let captured = std::mem::take(&mut st.entries);
        let pos = st.pos_in_memory.clone();
        self.delta.store(captured.len() as i64, Ordering::Release);
        (captured, pos)
    }

    /// Report `n` drained entries of an in-flight flush.
    pub fn drain_delta(&self, n: i64) {
        self.delta.fetch_sub(n, Ordering::AcqRel);
    }

    /// Zero the flush delta.
    pub fn zero_delta(&self) {
        self.delta.store(0, Ordering::Release);
    }

    /// Complete a flush: advance the synced position and zero the delta.
    pub fn settle(&self, pos: Option<BinlogPosition>) {
        let mut st = self.state.lock().unwrap();
        if pos.is_some() {
            st.pos_synced = pos;
        }
        self.delta.store(0, Ordering::Release);
    }

    /// Record the offset of a row event; the file name comes from the
    /// last rotation.
    pub fn update_row_pos(&self, log_pos: u64) {
        let mut st = self.state.lock().unwrap();
        let file = st.current_log_file.clone();
        st.pos_in_memory = Some(BinlogPosition::new(file, log_pos));
    }

    /// Record a log rotation.
    pub fn rotate(&self, next_log_file: String) {
        let mut st = self.state.lock().unwrap();
        st.current_log_file = next_log_file;
    }

    /// Set the synced position (resume from checkpoint).
    pub fn set_synced(&self, pos: BinlogPosition) {
        let mut st = self.state.lock().unwrap();
        st.pos_synced = Some(pos);
    }

    /// Initialize stream-tracking state from the start position.
    pub fn init_stream(&self, pos: BinlogPosition) {
        let mut st = self.state.lock().unwrap();
        st.current_log_file = pos.file.clone();
        st.pos_in_memory = Some(pos);
    }

    pub fn synced(&self) -> Option<BinlogPosition> {
        self.state.lock().unwrap().pos_synced.clone()
    }

    pub fn in_memory(&self) -> Option<BinlogPosition> {
        self.state.lock().unwrap().pos_in_memory.clone()
    }
}

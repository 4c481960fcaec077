//! Resumable checkpoints.
//!
//! The checkpoint pairs the copier's low watermark and row counters with
//! the tracker's synced replication position. Persistence is the
//! coordinator's job; the core only guarantees the format round-trips.

use crate::copier::Copier;
use crate::error::{Result, ShiftError};
use crate::position::BinlogPosition;
use crate::repl::BinlogTracker;
use serde::{Deserialize, Serialize};

/// A point a new process can resume the migration from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The chunker's low watermark: every chunk at or below it is copied.
    pub low_watermark: String,
    /// DB-reported affected rows so far (may undercount after resume).
    pub copy_rows: u64,
    /// Sum of chunk sizes so far (exact across resumes).
    pub copy_rows_logical: u64,
    /// Synced binlog file: the changeset is flushed up to here.
    pub log_file: String,
    /// Synced binlog offset.
    pub log_pos: u64,
}

impl Checkpoint {
    /// Capture the current resumable state of a run.
    ///
    /// Errors until both a chunk has completed contiguously and a flush
    /// has recorded a synced position; before that there is nothing
    /// worth resuming from.
    pub fn capture(copier: &Copier, tracker: &BinlogTracker) -> Result<Self> {
        let low_watermark = copier.get_low_watermark()?;
        let pos = tracker
            .get_synced_position()
            .ok_or_else(|| ShiftError::invalid_state("no synced binlog position yet"))?;
        Ok(Self {
            low_watermark,
            copy_rows: copier.copy_rows_count(),
            copy_rows_logical: copier.copy_rows_logical_count(),
            log_file: pos.file,
            log_pos: pos.pos,
        })
    }

    /// The synced replication position this checkpoint resumes from.
    pub fn position(&self) -> BinlogPosition {
        BinlogPosition::new(self.log_file.clone(), self.log_pos)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let checkpoint = Checkpoint {
            low_watermark: r#"{"key":"`id`","chunk_size":1000,"lower":4000,"upper":5000}"#.into(),
            copy_rows: 4821,
            copy_rows_logical: 5000,
            log_file: "binlog.000007".into(),
            log_pos: 193_844,
        };
        let json = checkpoint.to_json().unwrap();
        let restored = Checkpoint::from_json(&json).unwrap();
        assert_eq!(restored, checkpoint);
        assert_eq!(
            restored.position(),
            BinlogPosition::new("binlog.000007", 193_844)
        );
    }

    #[test]
    fn test_reject_garbage() {
        assert!(Checkpoint::from_json("not json").is_err());
        assert!(Checkpoint::from_json(r#"{"low_watermark":"x"}"#).is_err());
    }
}

//! Primary-key chunking.
//!
//! A [`Chunk`] is a contiguous PK-range slice of the source table,
//! rendered as a WHERE fragment. The [`Chunker`] hands chunks to the
//! copier in non-decreasing PK order, absorbs timing feedback to keep
//! chunks roughly equal-time, and exposes the two watermarks:
//!
//! - the *low watermark*, the greatest chunk below which everything has
//!   been fully copied (the resumable checkpoint), and
//! - the *high watermark*, the upper edge of the furthest chunk handed
//!   out, which the binlog tracker consults to discard events for rows
//!   the copy has not reached yet.
//!
//! [`AutoIncChunker`] is the built-in implementation for single-column
//! auto-increment primary keys. Other PK shapes plug in through the
//! trait.

use crate::error::{Result, ShiftError};
use crate::table::{quote_identifier, TableInfo};
use mysql_async::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Initial chunk size before any timing feedback has arrived.
pub const STARTING_CHUNK_SIZE: u64 = 1000;

const MIN_CHUNK_SIZE: u64 = 100;
const MAX_CHUNK_SIZE: u64 = 100_000;

/// A contiguous PK-range processing unit.
///
/// `chunk_size` is the count of PK values spanned, not the count of live
/// rows. `lower` is inclusive, `upper` exclusive; `None` bounds are open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Quoted key column the bounds apply to
    pub key: String,
    /// Logical size: count of PK values spanned
    pub chunk_size: u64,
    /// Inclusive lower bound
    pub lower: Option<u64>,
    /// Exclusive upper bound
    pub upper: Option<u64>,
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.lower, self.upper) {
            (Some(l), Some(u)) => write!(f, "{} >= {} AND {} < {}", self.key, l, self.key, u),
            (None, Some(u)) => write!(f, "{} < {}", self.key, u),
            (Some(l), None) => write!(f, "{} >= {}", self.key, l),
            (None, None) => write!(f, "1=1"),
        }
    }
}

/// Partitions the source table's PK space into processing units.
///
/// Implementations must be internally thread-safe: `next` is called by the
/// copier driver while `feedback` arrives from worker tasks and
/// `key_above_high_watermark` from the binlog consumer.
pub trait Chunker: Send + Sync {
    /// Open for a fresh copy starting at the beginning of the key space.
    fn open(&self) -> Result<()>;

    /// Open resuming from a previously persisted low watermark.
    fn open_at_watermark(&self, watermark: &str) -> Result<()>;

    /// The next chunk, or `None` once the table is fully read.
    fn next(&self) -> Result<Option<Chunk>>;

    /// Report a completed chunk and how long its copy took. Drives both
    /// the low watermark and the chunk-size retargeting.
    fn feedback(&self, chunk: &Chunk, elapsed: Duration);

    /// True once every chunk has been handed out.
    fn is_read(&self) -> bool;

    /// True if `key` lies strictly above the high watermark, i.e. in key
    /// space no chunk has been handed out for yet.
    fn key_above_high_watermark(&self, key: &Value) -> bool;

    /// The stringified low watermark, suitable for `open_at_watermark`.
    /// Errors until at least one chunk has completed contiguously.
    fn get_low_watermark(&self) -> Result<String>;
}

/// Create the built-in chunker for a table, or fail if no built-in
/// supports its PK shape.
pub fn new_chunker(table: Arc<TableInfo>, target_chunk_time: Duration) -> Result<Arc<dyn Chunker>> {
    if table.key_is_auto_inc {
        Ok(Arc::new(AutoIncChunker::new(table, target_chunk_time)))
    } else {
        Err(ShiftError::chunker(format!(
            "no built-in chunker for the primary key shape of {}",
            table.quoted_name()
        )))
    }
}

#[derive(Debug, Default)]
struct ChunkerState {
    open: bool,
    chunk_size: u64,
    /// Lower boundary of the next chunk to hand out. Doubles as the high
    /// watermark: keys at or beyond it are untouched by any chunk.
    next_lower: u64,
    final_issued: bool,
    /// Boundary the low watermark needs next to advance contiguously.
    expected_boundary: u64,
    low_watermark: Option<Chunk>,
    /// Completed chunks that finished ahead of `expected_boundary`,
    /// keyed by their lower boundary.
    completed: BTreeMap<u64, Chunk>,
}

/// Chunker for single-column auto-increment primary keys.
///
/// Hands out contiguous `[lower, upper)` ranges and finishes with one
/// open-ended chunk so rows inserted above the start-time maximum are
/// still copied. Chunk sizes retarget toward `target_chunk_time` from
/// copy feedback, bounded to half/1.5x steps per adjustment.
pub struct AutoIncChunker {
    table: Arc<TableInfo>,
    target_chunk_time: Duration,
    state: Mutex<ChunkerState>,
}

impl AutoIncChunker {
    pub fn new(table: Arc<TableInfo>, target_chunk_time: Duration) -> Self {
        Self {
            table,
            target_chunk_time,
            state: Mutex::new(ChunkerState::default()),
        }
    }

    fn quoted_key(&self) -> String {
        quote_identifier(&self.table.primary_key[0])
    }
}

impl Chunker for AutoIncChunker {
    fn open(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.open {
            return Err(ShiftError::invalid_state("chunker is already open"));
        }
        *st = ChunkerState {
            open: true,
            chunk_size: STARTING_CHUNK_SIZE,
            ..ChunkerState::default()
        };
        Ok(())
    }

    fn open_at_watermark(&self, watermark: &str) -> Result<()> {
        let chunk: Chunk = serde_json::from_str(watermark)
            .map_err(|e| ShiftError::chunker(format!("invalid low watermark: {e}")))?;
        let resume_at = chunk.upper.ok_or_else(|| {
            ShiftError::chunker("cannot resume from an open-ended low watermark")
        })?;
        let mut st = self.state.lock().unwrap();
        if st.open {
            return Err(ShiftError::invalid_state("chunker is already open"));
        }
        *st = ChunkerState {
            open: true,
            chunk_size: chunk.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
            next_lower: resume_at,
            expected_boundary: resume_at,
            low_watermark: Some(chunk),
            ..ChunkerState::default()
        };
        Ok(())
    }

    fn next(&self) -> Result<Option<Chunk>> {
        let mut st = self.state.lock().unwrap();
        if !st.open {
            return Err(ShiftError::chunker("chunker is not open"));
        }
        if st.final_issued {
            return Ok(None);
        }
        let key = self.quoted_key();
        let chunk = match self.table.max_value {
            // Empty table: one chunk covers the whole key space.
            None => {
                st.final_issued = true;
                Chunk {
                    key,
                    chunk_size: 0,
                    lower: None,
                    upper: None,
                }
            }
            Some(max) if st.next_lower > max => {
                // Past the start-time maximum: one open-ended chunk picks
                // up rows inserted during the copy.
                st.final_issued = true;
                Chunk {
                    key,
                    chunk_size: 0,
                    lower: Some(st.next_lower),
                    upper: None,
                }
            }
            Some(_) => {
                let lower = st.next_lower;
                let upper = lower + st.chunk_size;
                st.next_lower = upper;
                Chunk {
                    key,
                    chunk_size: st.chunk_size,
                    lower: (lower > 0).then_some(lower),
                    upper: Some(upper),
                }
            }
        };
        Ok(Some(chunk))
    }

    fn feedback(&self, chunk: &Chunk, elapsed: Duration) {
        let mut st = self.state.lock().unwrap();

        // Retarget the next chunk toward the target wall-clock time,
        // bounded to half/1.5x per step.
        if chunk.chunk_size > 0 {
            let target = self.target_chunk_time.as_secs_f64();
            let actual = elapsed.as_secs_f64().max(1e-4);
            let ratio = (target / actual).clamp(0.5, 1.5);
            st.chunk_size =
                ((st.chunk_size as f64 * ratio) as u64).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        }

        // Record completion and advance the contiguous low watermark.
        st.completed
            .insert(chunk.lower.unwrap_or(0), chunk.clone());
        while let Some(done) = {
            let key = st.expected_boundary;
            st.completed.remove(&key)
        } {
            match done.upper {
                Some(upper) => {
                    st.expected_boundary = upper;
                    st.low_watermark = Some(done);
                }
                None => {
                    st.low_watermark = Some(done);
                    break;
                }
            }
        }
    }

    fn is_read(&self) -> bool {
        self.state.lock().unwrap().final_issued
    }

    fn key_above_high_watermark(&self, key: &Value) -> bool {
        let st = self.state.lock().unwrap();
        if !st.open || st.final_issued {
            return false;
        }
        let key = match key {
            Value::UInt(v) => *v,
            Value::Int(v) if *v >= 0 => *v as u64,
            // Negative or non-integer keys never sort above an
            // auto-increment range; buffering them is always safe.
            _ => return false,
        };
        key >= st.next_lower
    }

    fn get_low_watermark(&self) -> Result<String> {
        let st = self.state.lock().unwrap();
        let chunk = st
            .low_watermark
            .as_ref()
            .ok_or_else(|| ShiftError::invalid_state("no chunks have completed yet"))?;
        Ok(serde_json::to_string(chunk)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(max_value: Option<u64>) -> Arc<TableInfo> {
        let mut info = TableInfo::new(
            "test",
            "users",
            vec!["id".into(), "name".into()],
            vec!["id".into()],
        )
        .unwrap();
        info.key_is_auto_inc = true;
        info.max_value = max_value;
        Arc::new(info)
    }

    fn chunker(max_value: Option<u64>) -> AutoIncChunker {
        AutoIncChunker::new(table(max_value), Duration::from_millis(500))
    }

    #[test]
    fn test_chunk_display() {
        let key = "`id`".to_string();
        let bounded = Chunk {
            key: key.clone(),
            chunk_size: 1000,
            lower: Some(5),
            upper: Some(1005),
        };
        assert_eq!(bounded.to_string(), "`id` >= 5 AND `id` < 1005");

        let first = Chunk {
            key: key.clone(),
            chunk_size: 1000,
            lower: None,
            upper: Some(1000),
        };
        assert_eq!(first.to_string(), "`id` < 1000");

        let last = Chunk {
            key: key.clone(),
            chunk_size: 0,
            lower: Some(2000),
            upper: None,
        };
        assert_eq!(last.to_string(), "`id` >= 2000");

        let all = Chunk {
            key,
            chunk_size: 0,
            lower: None,
            upper: None,
        };
        assert_eq!(all.to_string(), "1=1");
    }

    #[test]
    fn test_next_requires_open() {
        let c = chunker(Some(5000));
        assert!(c.next().is_err());
    }

    #[test]
    fn test_chunk_sequence_and_final_chunk() {
        let c = chunker(Some(2500));
        c.open().unwrap();

        let c1 = c.next().unwrap().unwrap();
        assert_eq!((c1.lower, c1.upper), (None, Some(1000)));
        let c2 = c.next().unwrap().unwrap();
        assert_eq!((c2.lower, c2.upper), (Some(1000), Some(2000)));
        let c3 = c.next().unwrap().unwrap();
        assert_eq!((c3.lower, c3.upper), (Some(2000), Some(3000)));
        assert!(!c.is_read());

        // Past max-value: one open-ended chunk, then the table is read.
        let last = c.next().unwrap().unwrap();
        assert_eq!((last.lower, last.upper), (Some(3000), None));
        assert!(c.is_read());
        assert!(c.next().unwrap().is_none());
    }

    #[test]
    fn test_empty_table_single_chunk() {
        let c = chunker(None);
        c.open().unwrap();
        let only = c.next().unwrap().unwrap();
        assert_eq!(only.to_string(), "1=1");
        assert_eq!(only.chunk_size, 0);
        assert!(c.is_read());
        assert!(c.next().unwrap().is_none());
    }

    #[test]
    fn test_low_watermark_advances_contiguously() {
        let c = chunker(Some(10_000));
        c.open().unwrap();
        let c1 = c.next().unwrap().unwrap();
        let c2 = c.next().unwrap().unwrap();
        let c3 = c.next().unwrap().unwrap();

        assert!(c.get_low_watermark().is_err());

        // Out-of-order completion: c2 alone must not advance anything.
        c.feedback(&c2, Duration::from_millis(500));
        assert!(c.get_low_watermark().is_err());

        // c1 completes: watermark jumps over the already-completed c2.
        c.feedback(&c1, Duration::from_millis(500));
        let watermark: Chunk = serde_json::from_str(&c.get_low_watermark().unwrap()).unwrap();
        assert_eq!(watermark.upper, c2.upper);

        c.feedback(&c3, Duration::from_millis(500));
        let watermark: Chunk = serde_json::from_str(&c.get_low_watermark().unwrap()).unwrap();
        assert_eq!(watermark.upper, c3.upper);
    }

    #[test]
    fn test_watermark_round_trip_resume() {
        let c = chunker(Some(10_000));
        c.open().unwrap();
        let c1 = c.next().unwrap().unwrap();
        c.feedback(&c1, Duration::from_millis(500));
        let watermark = c.get_low_watermark().unwrap();

        let resumed = chunker(Some(10_000));
        resumed.open_at_watermark(&watermark).unwrap();
        let next = resumed.next().unwrap().unwrap();
        assert_eq!(next.lower, c1.upper);
    }

    #[test]
    fn test_feedback_resizes_toward_target() {
        // Fast chunks grow the next chunk, slow chunks shrink it.
        let c = chunker(Some(1_000_000));
        c.open().unwrap();
        let c1 = c.next().unwrap().unwrap();
        c.feedback(&c1, Duration::from_millis(100));
        let grown = c.next().unwrap().unwrap();
        assert!(grown.chunk_size > c1.chunk_size);

        c.feedback(&grown, Duration::from_secs(10));
        let shrunk = c.next().unwrap().unwrap();
        assert_eq!(shrunk.chunk_size, grown.chunk_size / 2);
    }

    #[test]
    fn test_key_above_high_watermark() {
        let c = chunker(Some(5000));
        assert!(!c.key_above_high_watermark(&Value::Int(1)));

        c.open().unwrap();
        let c1 = c.next().unwrap().unwrap();
        // Chunk covers [0, 1000): anything at or beyond 1000 is above.
        assert!(!c.key_above_high_watermark(&Value::Int(999)));
        assert!(c.key_above_high_watermark(&Value::Int(1000)));
        assert!(c.key_above_high_watermark(&Value::UInt(5000)));
        assert!(!c.key_above_high_watermark(&Value::Int(-3)));
        assert!(!c.key_above_high_watermark(&Value::Bytes(b"zzz".to_vec())));

        // After the final open-ended chunk nothing is above.
        c.feedback(&c1, Duration::from_millis(500));
        while c.next().unwrap().is_some() {}
        assert!(!c.key_above_high_watermark(&Value::Int(u32::MAX as i64)));
    }

    #[test]
    fn test_double_open_fails() {
        let c = chunker(Some(5000));
        c.open().unwrap();
        assert!(c.open().is_err());
    }
}

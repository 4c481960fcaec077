//! Binary log positions.
//!
//! A position is a `(log-file-name, offset)` pair. Positions order by the
//! numeric suffix of the log file name (`binlog.000042`) and then by
//! offset, falling back to a lexicographic file comparison for
//! non-standard names.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A position in the binary log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Log file name, e.g. `binlog.000003`
    pub file: String,
    /// Byte offset within the file
    pub pos: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, pos: u64) -> Self {
        Self {
            file: file.into(),
            pos,
        }
    }

    /// Numeric suffix of the log file name, if it has one.
    fn file_index(&self) -> Option<u64> {
        self.file.rsplit_once('.')?.1.parse().ok()
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_file = match (self.file_index(), other.file_index()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.file.cmp(&other.file),
        };
        by_file.then(self.pos.cmp(&other.pos))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let pos = BinlogPosition::new("binlog.000003", 12345);
        assert_eq!(pos.to_string(), "binlog.000003:12345");
    }

    #[test]
    fn test_ordering_same_file() {
        let a = BinlogPosition::new("binlog.000003", 100);
        let b = BinlogPosition::new("binlog.000003", 200);
        assert!(a < b);
        assert!(b >= a);
    }

    #[test]
    fn test_ordering_across_files() {
        // A later file always wins, even with a smaller offset.
        let a = BinlogPosition::new("binlog.000009", 99999);
        let b = BinlogPosition::new("binlog.000010", 4);
        assert!(a < b);
    }

    #[test]
    fn test_ordering_non_numeric_suffix() {
        let a = BinlogPosition::new("alpha-bin", 10);
        let b = BinlogPosition::new("beta-bin", 10);
        assert!(a < b);
    }

    #[test]
    fn test_serde_round_trip() {
        let pos = BinlogPosition::new("binlog.000042", 1 << 30);
        let json = serde_json::to_string(&pos).unwrap();
        let back: BinlogPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(pos, back);
    }
}

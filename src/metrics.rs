//! Metrics seam.
//!
//! The copier emits three values per chunk. Sink transports live outside
//! this crate; sends are bounded by [`SINK_TIMEOUT`] and failures never
//! affect the copy.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Upper bound on a single sink send.
pub const SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Wall-clock processing time of one chunk, in milliseconds (gauge).
pub const CHUNK_PROCESSING_TIME: &str = "chunk_processing_time";
/// Logical rows (PK slots) covered by one chunk (counter).
pub const CHUNK_LOGICAL_ROWS_COUNT: &str = "chunk_logical_rows_count";
/// DB-reported affected rows of one chunk copy (counter).
pub const CHUNK_AFFECTED_ROWS_COUNT: &str = "chunk_affected_rows_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

#[derive(Debug, Clone)]
pub struct MetricValue {
    pub name: &'static str,
    pub kind: MetricKind,
    pub value: f64,
}

/// A batch of metric values emitted together.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub values: Vec<MetricValue>,
}

/// Destination for metric batches.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn send(&self, metrics: Metrics) -> Result<()>;
}

/// A sink that discards everything.
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    async fn send(&self, _metrics: Metrics) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_sink() {
        let metrics = Metrics {
            values: vec![MetricValue {
                name: CHUNK_PROCESSING_TIME,
                kind: MetricKind::Gauge,
                value: 12.0,
            }],
        };
        NoopSink.send(metrics).await.unwrap();
    }
}

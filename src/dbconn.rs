//! Database execution seam.
//!
//! [`DbExecutor`] is the SQL surface the copier and the binlog tracker
//! run against: retryable transactions for the bulk writes, one-shot
//! statements for the checkpoint-noise write, and the master status/log
//! queries that anchor replication positions. [`MySqlExecutor`] is the
//! production implementation over a `mysql_async` pool; tests substitute
//! in-memory fakes.

use crate::error::{Result, ShiftError};
use crate::position::BinlogPosition;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Pool, Row, TxOpts};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry budget for ordinary transactions.
const MAX_RETRIES: u32 = 5;
/// Retry budget when a final checksum will validate the copy. Stricter:
/// fewer attempts, and only genuine deadlock rollbacks are retried.
const MAX_RETRIES_STRICT: u32 = 2;

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// SQL surface consumed by the copier and the binlog tracker.
#[async_trait]
pub trait DbExecutor: Send + Sync {
    /// Run all statements in one transaction, retrying deadlocks and
    /// transient lock errors with bounded backoff. `strict` selects the
    /// reduced retry mode used when a subsequent checksum pass will
    /// validate the copy. Returns the total affected-row count.
    async fn retryable_transaction(
        &self,
        token: &CancellationToken,
        strict: bool,
        statements: Vec<String>,
    ) -> Result<u64>;

    /// Run a single statement outside any retry policy.
    async fn exec(&self, statement: &str) -> Result<u64>;

    /// The server's current binary log position.
    async fn master_status(&self) -> Result<BinlogPosition>;

    /// The log file names currently available on the server.
    async fn master_logs(&self) -> Result<Vec<String>>;
}

/// Delay before retry number `attempt` (zero-based): the base doubles
/// per attempt up to the cap. The shift exponent stops growing once the
/// cap is unreachable anyway, so large attempt counts cannot overflow.
fn retry_delay(attempt: u32) -> Duration {
    (BACKOFF_BASE * (1u32 << attempt.min(6))).min(BACKOFF_MAX)
}

/// Production executor over a `mysql_async` pool.
pub struct MySqlExecutor {
    pool: Pool,
}

impl MySqlExecutor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn run_transaction(&self, statements: &[String]) -> Result<u64> {
        let mut conn = self.pool.get_conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        let mut affected = 0u64;
        for statement in statements.iter().filter(|s| !s.is_empty()) {
            let result = tx.query_iter(statement.as_str()).await?;
            affected += result.affected_rows();
            drop(result);
        }
        tx.commit().await?;
        Ok(affected)
    }

    fn should_retry(error: &ShiftError, strict: bool) -> bool {
        if strict {
            error.is_deadlock()
        } else {
            error.is_retriable()
        }
    }
}

#[async_trait]
impl DbExecutor for MySqlExecutor {
    async fn retryable_transaction(
        &self,
        token: &CancellationToken,
        strict: bool,
        statements: Vec<String>,
    ) -> Result<u64> {
        let budget = if strict { MAX_RETRIES_STRICT } else { MAX_RETRIES };
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return Err(ShiftError::Cancelled),
                result = self.run_transaction(&statements) => result,
            };
            match result {
                Ok(affected) => return Ok(affected),
                Err(e) if attempt < budget && Self::should_retry(&e, strict) => {
                    let wait = retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "retrying transaction after transient error: {e}"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(ShiftError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exec(&self, statement: &str) -> Result<u64> {
        let mut conn = self.pool.get_conn().await?;
        let result = conn.query_iter(statement).await?;
        let affected = result.affected_rows();
        drop(result);
        Ok(affected)
    }

    async fn master_status(&self) -> Result<BinlogPosition> {
        let mut conn = self.pool.get_conn().await?;
        // MySQL 8.2+ renamed the statement; fall back for older servers.
        let row: Option<Row> = match conn.query_first("SHOW BINARY LOG STATUS").await {
            Ok(row) => row,
            Err(_) => conn.query_first("SHOW MASTER STATUS").await?,
        };
        let row = row.ok_or_else(|| {
            ShiftError::replication(
                "no master status returned, binary logging may be disabled on the server",
            )
        })?;
        let file: String = row.get(0).unwrap_or_default();
        let pos: u64 = row.get(1).unwrap_or(4);
        if file.is_empty() {
            return Err(ShiftError::replication(
                "master status returned an empty log file name",
            ));
        }
        debug!(%file, pos, "current master position");
        Ok(BinlogPosition::new(file, pos))
    }

    async fn master_logs(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = match conn.query("SHOW BINARY LOGS").await {
            Ok(rows) => rows,
            Err(_) => conn.query("SHOW MASTER LOGS").await?,
        };
        // Only the first column (the log name) is read, which tolerates
        // both the 2-column (5.7) and 3-column (8.0, encrypted) layouts.
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>(0).unwrap_or_default())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_millis(50));
        assert_eq!(retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(200));
        assert_eq!(retry_delay(5), Duration::from_millis(1600));
        assert_eq!(retry_delay(6), BACKOFF_MAX);
        assert_eq!(retry_delay(40), BACKOFF_MAX);
    }

    #[test]
    fn test_strict_mode_narrows_retries() {
        let io = ShiftError::MySql(mysql_async::Error::Io(mysql_async::IoError::Io(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        )));
        assert!(MySqlExecutor::should_retry(&io, false));
        assert!(!MySqlExecutor::should_retry(&io, true));

        let config = ShiftError::config("bad");
        assert!(!MySqlExecutor::should_retry(&config, false));
    }
}

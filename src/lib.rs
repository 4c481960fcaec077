//! # tableshift
//!
//! Core engines for online MySQL schema changes: rebuild a large table
//! under a new schema without blocking writes.
//!
//! Rows are bulk-copied from the source table T into a shadow table T'
//! while a binlog subscription captures every concurrent change to T,
//! coalesces it by primary key, and re-applies it to T'. Once the two
//! are in sync an external coordinator performs the atomic rename.
//!
//! ## Architecture
//!
//! ```text
//!               ┌────────────┐   chunks    ┌────────────┐
//!               │  Chunker   │────────────►│   Copier   │── INSERT IGNORE ──┐
//!               │ (PK ranges)│◄────────────│ (parallel) │                   │
//!               └─────┬──────┘  feedback   └────────────┘                   ▼
//!                     │ high watermark                                ┌──────────┐
//!                     ▼                                               │    T'    │
//! ┌─────────┐   ┌──────────────┐  changed keys  ┌───────────┐         │ (shadow) │
//! │  binlog │──►│BinlogTracker │───────────────►│ Changeset │─ flush ─►          │
//! │  stream │   │ (filter+pos) │                │ (coalesce)│ DELETE/ └──────────┘
//! └─────────┘   └──────────────┘                └───────────┘ REPLACE
//! ```
//!
//! The copier's low watermark plus the tracker's synced binlog position
//! form the crash-safe [`Checkpoint`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> tableshift::Result<()> {
//! use std::sync::Arc;
//! use tableshift::{
//!     BinlogTracker, Copier, CopierConfig, KeyAboveWatermark, MySqlExecutor,
//!     MySqlSubscriptionConnector, TableInfo,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let pool = mysql_async::Pool::new("mysql://root@localhost/app");
//! let table = Arc::new(TableInfo::load(&pool, "app", "users").await?);
//! let shadow = Arc::new(TableInfo::load(&pool, "app", "_users_new").await?);
//! let db = Arc::new(MySqlExecutor::new(pool.clone()));
//!
//! let copier = Arc::new(Copier::new(
//!     db.clone(),
//!     table.clone(),
//!     shadow.clone(),
//!     CopierConfig::default(),
//! )?);
//!
//! let opts = mysql_async::Opts::from_url("mysql://repl@localhost")
//!     .map_err(mysql_async::Error::from)?;
//! let connector = Arc::new(MySqlSubscriptionConnector::new(opts, 3306001));
//! let tracker = Arc::new(BinlogTracker::new(db, table, shadow, connector));
//!
//! let token = CancellationToken::new();
//! tracker.start(&token).await?;
//! let view: Arc<dyn KeyAboveWatermark> = copier.clone();
//! tracker.attach_watermark(&view);
//! tracker.set_key_above_watermark_optimization(true);
//!
//! copier.run(&token).await?;
//!
//! tracker.set_key_above_watermark_optimization(false);
//! tracker.flush_until_trivial(&token).await?;
//! // ... cutover is the coordinator's job from here.
//! # Ok(())
//! # }
//! ```

pub mod changeset;
pub mod checkpoint;
pub mod chunk;
pub mod copier;
pub mod dbconn;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod position;
pub mod repl;
pub mod subscription;
pub mod table;
pub mod throttler;

pub use changeset::Changeset;
pub use checkpoint::Checkpoint;
pub use chunk::{new_chunker, AutoIncChunker, Chunk, Chunker, STARTING_CHUNK_SIZE};
pub use copier::{Copier, CopierConfig, COPY_ESTIMATE_INTERVAL, COPY_ETA_INITIAL_WAIT};
pub use dbconn::{DbExecutor, MySqlExecutor};
pub use error::{Result, ShiftError};
pub use fingerprint::{hash_key, unhash_key};
pub use metrics::{MetricKind, MetricValue, Metrics, MetricsSink, NoopSink};
pub use position::BinlogPosition;
pub use repl::{
    BinlogTracker, KeyAboveWatermark, TableChangedCallback, BINLOG_TRIVIAL_THRESHOLD,
    FLUSH_BATCH_SIZE,
};
pub use subscription::{
    BinlogSubscription, MySqlBinlogSubscription, MySqlSubscriptionConnector, ReplEvent, RowAction,
    SubscriptionConnector,
};
pub use table::{intersect_columns, quote_identifier, TableInfo};
pub use throttler::{NoopThrottler, Throttler};

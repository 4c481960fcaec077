//! Binary log subscription.
//!
//! [`BinlogSubscription`] is the replication-stream seam the tracker
//! consumes: a pull interface yielding decoded [`ReplEvent`]s.
//! [`MySqlSubscriptionConnector`] produces the production implementation
//! over `mysql_async`'s binlog stream, registering as a replica and
//! streaming from a given position. Tests feed events through a channel
//! instead.

use crate::error::{Result, ShiftError};
use crate::position::BinlogPosition;
use async_trait::async_trait;
use futures_util::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData};
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Interval at which the server sends heartbeats when the stream is
/// otherwise idle.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

/// Row operation carried by a replication event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

/// A decoded replication event, reduced to what the tracker needs.
#[derive(Debug)]
pub enum ReplEvent {
    /// One or more row images for a single table. For inserts and updates
    /// the after-image is delivered; for deletes the before-image.
    Rows {
        schema: String,
        table: String,
        action: RowAction,
        rows: Vec<Vec<Value>>,
        /// End-of-event offset from the event header. The file name is
        /// tracked separately through rotation events.
        log_pos: u64,
    },
    /// The stream moved to a new log file.
    Rotate { next_log: String },
    /// DDL touched a table.
    TableChanged { schema: String, table: String },
    /// Idle-stream heartbeat.
    Heartbeat,
}

/// A live subscription to the replication stream.
#[async_trait]
pub trait BinlogSubscription: Send {
    /// The next event, or `None` if the stream ended.
    async fn next_event(&mut self) -> Result<Option<ReplEvent>>;
}

/// Opens subscriptions at a given position.
#[async_trait]
pub trait SubscriptionConnector: Send + Sync {
    async fn connect(&self, from: &BinlogPosition) -> Result<Box<dyn BinlogSubscription>>;
}

/// Production connector: registers as a replica on the source server.
pub struct MySqlSubscriptionConnector {
    opts: Opts,
    server_id: u32,
}

impl MySqlSubscriptionConnector {
    /// `server_id` must be unique among all replicas of the server.
    pub fn new(opts: Opts, server_id: u32) -> Self {
        Self { opts, server_id }
    }
}

#[async_trait]
impl SubscriptionConnector for MySqlSubscriptionConnector {
    async fn connect(&self, from: &BinlogPosition) -> Result<Box<dyn BinlogSubscription>> {
        let mut conn = Conn::new(self.opts.clone()).await?;
        // Ask for heartbeats so block-wait can observe an idle stream.
        if let Err(e) = conn
            .query_drop(format!(
                "SET @master_heartbeat_period = {}",
                HEARTBEAT_PERIOD.as_nanos()
            ))
            .await
        {
            debug!("heartbeat negotiation failed: {e}");
        }
        let stream = conn
            .get_binlog_stream(
                BinlogStreamRequest::new(self.server_id)
                    .with_filename(from.file.as_bytes())
                    .with_pos(from.pos),
            )
            .await?;
        debug!(from = %from, server_id = self.server_id, "binlog stream opened");
        Ok(Box::new(MySqlBinlogSubscription { stream }))
    }
}

/// Subscription over a live `mysql_async` binlog stream.
pub struct MySqlBinlogSubscription {
    stream: BinlogStream,
}

#[async_trait]
impl BinlogSubscription for MySqlBinlogSubscription {
    async fn next_event(&mut self) -> Result<Option<ReplEvent>> {
        loop {
            let Some(event) = self.stream.next().await else {
                return Ok(None);
            };
            let event = event.map_err(ShiftError::MySql)?;
            let log_pos = u64::from(event.header().log_pos());
            let data = match event.read_data() {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    return Err(ShiftError::replication(format!(
                        "failed to decode binlog event: {e}"
                    )))
                }
            };
            match data {
                EventData::RotateEvent(rotate) => {
                    return Ok(Some(ReplEvent::Rotate {
                        next_log: rotate.name().to_string(),
                    }));
                }
                EventData::RowsEvent(rows_data) => {
                    let action = match &rows_data {
                        RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                            RowAction::Insert
                        }
                        RowsEventData::UpdateRowsEvent(_)
                        | RowsEventData::UpdateRowsEventV1(_)
                        | RowsEventData::PartialUpdateRowsEvent(_) => RowAction::Update,
                        RowsEventData::DeleteRowsEvent(_)
                        | RowsEventData::DeleteRowsEventV1(_) => RowAction::Delete,
                        _ => continue,
                    };
                    let Some(table_map) = self.stream.get_tme(rows_data.table_id()) else {
                        warn!(table_id = rows_data.table_id(), "no table map for rows event");
                        continue;
                    };
                    let schema = table_map.database_name().to_string();
                    let table = table_map.table_name().to_string();
                    let mut rows = Vec::new();
                    for row in rows_data.rows(table_map) {
                        let (before, after) = row.map_err(|e| {
                            ShiftError::replication(format!("failed to decode row image: {e}"))
                        })?;
                        // Deletes only carry a before-image; for inserts
                        // and updates the after-image is the row's state.
                        let image = match action {
                            RowAction::Delete => before,
                            _ => after,
                        };
                        if let Some(image) = image {
                            let row = mysql_async::Row::try_from(image).map_err(|e| {
                                ShiftError::replication(format!(
                                    "failed to convert row image: {e:?}"
                                ))
                            })?;
                            rows.push(row.unwrap());
                        }
                    }
                    return Ok(Some(ReplEvent::Rows {
                        schema,
                        table,
                        action,
                        rows,
                        log_pos,
                    }));
                }
                EventData::QueryEvent(query) => {
                    let statement = query.query();
                    if let Some((schema, table)) =
                        parse_ddl_target(&statement, &query.schema())
                    {
                        return Ok(Some(ReplEvent::TableChanged { schema, table }));
                    }
                }
                EventData::HeartbeatEvent => return Ok(Some(ReplEvent::Heartbeat)),
                _ => {}
            }
        }
    }
}

/// Best-effort extraction of the table a DDL statement targets.
///
/// Returns `(schema, table)`, with `schema` defaulting to the statement's
/// session schema when the name is unqualified. DDL during a migration is
/// fatal anyway, so a loose parse that errs toward reporting is fine.
pub(crate) fn parse_ddl_target(statement: &str, default_schema: &str) -> Option<(String, String)> {
    let upper = statement.to_uppercase();
    let keyword_at = ["ALTER TABLE", "DROP TABLE", "CREATE TABLE", "TRUNCATE TABLE", "RENAME TABLE"]
        .iter()
        .find_map(|k| upper.find(k).map(|i| i + k.len()))?;

    let mut rest = statement[keyword_at..].trim_start();
    // Skip IF [NOT] EXISTS between the keyword and the name.
    for prefix in ["IF", "NOT", "EXISTS"] {
        let upper_rest = rest.to_uppercase();
        if let Some(stripped) = upper_rest.strip_prefix(prefix) {
            if stripped.starts_with(char::is_whitespace) {
                rest = rest[prefix.len()..].trim_start();
            }
        }
    }

    let name: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '(' && *c != ';' && *c != ',')
        .collect();
    if name.is_empty() {
        return None;
    }
    let name = name.replace('`', "");
    match name.split_once('.') {
        Some((schema, table)) => Some((schema.to_string(), table.to_string())),
        None => Some((default_schema.to_string(), name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_alter_table() {
        assert_eq!(
            parse_ddl_target("ALTER TABLE users ADD COLUMN x INT", "test"),
            Some(("test".into(), "users".into()))
        );
    }

    #[test]
    fn test_parse_qualified_and_quoted() {
        assert_eq!(
            parse_ddl_target("alter table `shop`.`orders` engine=innodb", "ignored"),
            Some(("shop".into(), "orders".into()))
        );
    }

    #[test]
    fn test_parse_drop_if_exists() {
        assert_eq!(
            parse_ddl_target("DROP TABLE IF EXISTS _users_old", "test"),
            Some(("test".into(), "_users_old".into()))
        );
    }

    #[test]
    fn test_parse_truncate() {
        assert_eq!(
            parse_ddl_target("TRUNCATE TABLE audit_log", "test"),
            Some(("test".into(), "audit_log".into()))
        );
    }

    #[test]
    fn test_non_ddl_ignored() {
        assert_eq!(parse_ddl_target("BEGIN", "test"), None);
        assert_eq!(
            parse_ddl_target("INSERT INTO users VALUES (1)", "test"),
            None
        );
    }
}

//! Table descriptors.
//!
//! A [`TableInfo`] describes one side of the migration: the source table T
//! or the shadow table T'. Descriptors are built before the core starts
//! (either by the schema-diff collaborator or via [`TableInfo::load`]) and
//! are read-only for the duration of a run.

use crate::error::{Result, ShiftError};
use mysql_async::prelude::*;
use mysql_async::{Pool, Value};
use tracing::debug;

/// Descriptor of a table taking part in the migration.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Schema (database) name
    pub schema_name: String,
    /// Table name
    pub table_name: String,
    /// Non-generated columns in source order
    pub columns: Vec<String>,
    /// Ordered primary-key column names
    pub primary_key: Vec<String>,
    /// Positions of the primary-key columns inside `columns`. Binlog row
    /// images carry values by ordinal only, so PK extraction needs these.
    pub key_ordinals: Vec<usize>,
    /// Whether the PK is a single auto-increment integer column
    pub key_is_auto_inc: bool,
    /// Maximum PK value at migration start (auto-inc PKs only)
    pub max_value: Option<u64>,
    /// Estimated row count from table statistics
    pub estimated_rows: u64,
}

impl TableInfo {
    /// Build a descriptor from known schema facts.
    ///
    /// `columns` must be the non-generated column list in source order and
    /// must contain every primary-key column.
    pub fn new(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        columns: Vec<String>,
        primary_key: Vec<String>,
    ) -> Result<Self> {
        let schema_name = schema_name.into();
        let table_name = table_name.into();
        if primary_key.is_empty() {
            return Err(ShiftError::table(format!(
                "{schema_name}.{table_name} has no primary key"
            )));
        }
        let key_ordinals = primary_key
            .iter()
            .map(|key| {
                columns.iter().position(|c| c == key).ok_or_else(|| {
                    ShiftError::table(format!(
                        "primary key column {key} not in column list of {schema_name}.{table_name}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema_name,
            table_name,
            columns,
            primary_key,
            key_ordinals,
            key_is_auto_inc: false,
            max_value: None,
            estimated_rows: 0,
        })
    }

    /// Mark the PK as a single auto-increment column with the given
    /// maximum value at migration start.
    pub fn with_auto_inc(mut self, max_value: u64) -> Self {
        self.key_is_auto_inc = true;
        self.max_value = Some(max_value);
        self
    }

    /// Set the estimated row count.
    pub fn with_estimated_rows(mut self, rows: u64) -> Self {
        self.estimated_rows = rows;
        self
    }

    /// Backtick-quoted fully-qualified name.
    pub fn quoted_name(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema_name),
            quote_identifier(&self.table_name)
        )
    }

    /// True if `schema`/`table` name this table.
    pub fn is_named(&self, schema: &str, table: &str) -> bool {
        self.schema_name == schema && self.table_name == table
    }

    /// Comma-joined quoted primary-key column list.
    pub fn quoted_primary_key(&self) -> String {
        self.primary_key
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Extract the primary-key values from a binlog row image.
    ///
    /// Returns `None` if the image is too short to contain every PK
    /// column (e.g. a minimal row image from a misconfigured server).
    pub fn extract_primary_key(&self, row: &[Value]) -> Option<Vec<Value>> {
        self.key_ordinals
            .iter()
            .map(|&i| row.get(i).cloned())
            .collect()
    }

    /// Load a descriptor from `INFORMATION_SCHEMA`.
    pub async fn load(pool: &Pool, schema: &str, table: &str) -> Result<Self> {
        let mut conn = pool.get_conn().await?;

        let rows: Vec<(String, String, String)> = conn
            .exec(
                r"SELECT COLUMN_NAME, COLUMN_KEY, EXTRA
                  FROM INFORMATION_SCHEMA.COLUMNS
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                  ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await?;
        if rows.is_empty() {
            return Err(ShiftError::table(format!(
                "table {schema}.{table} does not exist"
            )));
        }

        let mut columns = Vec::new();
        let mut primary_key = Vec::new();
        let mut pk_auto_inc = false;
        for (name, key, extra) in rows {
            let extra_lower = extra.to_lowercase();
            // Generated columns are excluded from the copy on both sides.
            if extra_lower.contains("generated") {
                continue;
            }
            if key == "PRI" {
                primary_key.push(name.clone());
                if extra_lower.contains("auto_increment") {
                    pk_auto_inc = true;
                }
            }
            columns.push(name);
        }

        let estimated_rows: Option<Option<u64>> = conn
            .exec_first(
                r"SELECT TABLE_ROWS FROM INFORMATION_SCHEMA.TABLES
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (schema, table),
            )
            .await?;

        let mut info = Self::new(schema, table, columns, primary_key)?
            .with_estimated_rows(estimated_rows.flatten().unwrap_or(0));

        if pk_auto_inc && info.primary_key.len() == 1 {
            // MAX() is NULL on an empty table.
            let max_value: Option<Option<u64>> = conn
                .query_first(format!(
                    "SELECT MAX({}) FROM {}",
                    quote_identifier(&info.primary_key[0]),
                    info.quoted_name()
                ))
                .await?;
            info.key_is_auto_inc = true;
            info.max_value = max_value.flatten();
        }

        debug!(
            table = %info.quoted_name(),
            columns = info.columns.len(),
            estimated_rows = info.estimated_rows,
            auto_inc = info.key_is_auto_inc,
            "loaded table descriptor"
        );
        Ok(info)
    }
}

/// Quote an identifier with backticks, escaping embedded backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// The intersected non-generated column set of two tables, quoted and
/// comma-joined in source order. Used identically on both sides of the
/// chunk copy and the flush REPLACE.
pub fn intersect_columns(a: &TableInfo, b: &TableInfo) -> String {
    a.columns
        .iter()
        .filter(|c| b.columns.contains(c))
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableInfo {
        TableInfo::new(
            "test",
            "users",
            vec!["id".into(), "name".into(), "balance".into()],
            vec!["id".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_quoted_name() {
        assert_eq!(users().quoted_name(), "`test`.`users`");
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(quote_identifier("str`ange"), "`str``ange`");
    }

    #[test]
    fn test_missing_primary_key() {
        let err = TableInfo::new("test", "t", vec!["a".into()], vec![]).unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }

    #[test]
    fn test_pk_not_in_columns() {
        let err =
            TableInfo::new("test", "t", vec!["a".into()], vec!["id".into()]).unwrap_err();
        assert!(err.to_string().contains("not in column list"));
    }

    #[test]
    fn test_extract_primary_key() {
        let info = TableInfo::new(
            "test",
            "stock",
            vec!["s_w_id".into(), "s_i_id".into(), "qty".into()],
            vec!["s_i_id".into(), "s_w_id".into()],
        )
        .unwrap();
        let row = vec![Value::Int(10), Value::Int(7), Value::Int(99)];
        // PK order, not column order.
        assert_eq!(
            info.extract_primary_key(&row),
            Some(vec![Value::Int(7), Value::Int(10)])
        );
        // Truncated image.
        assert_eq!(info.extract_primary_key(&[Value::Int(10)]), None);
    }

    #[test]
    fn test_intersect_columns_preserves_source_order() {
        let a = users();
        let b = TableInfo::new(
            "test",
            "_users_new",
            vec!["balance".into(), "id".into()],
            vec!["id".into()],
        )
        .unwrap();
        assert_eq!(intersect_columns(&a, &b), "`id`,`balance`");
    }

    #[test]
    fn test_is_named() {
        let info = users();
        assert!(info.is_named("test", "users"));
        assert!(!info.is_named("test", "_users_new"));
        assert!(!info.is_named("other", "users"));
    }
}

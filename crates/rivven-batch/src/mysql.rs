//! MySQL backend
//!
//! - [`MySqlConnection`]: the scan connection, one `mysql_async` session
//! - [`MySqlSchemaProvider`]: table definitions from INFORMATION_SCHEMA

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::{redact_url, Connection, ConnectionConfig};
use crate::error::{Error, Result};
use crate::schema::SchemaProvider;
use crate::types::{ColumnDefinition, IndexDefinition, Row, TableDefinition, Value};

/// Convert a Value to a MySQL parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::UInt64(n) => mysql_async::Value::UInt(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.clone()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => datetime_to_sql(dt),
        Value::DateTimeTz(dt) => datetime_to_sql(&dt.naive_utc()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

fn datetime_to_sql(dt: &chrono::NaiveDateTime) -> mysql_async::Value {
    let (date, time) = (dt.date(), dt.time());
    mysql_async::Value::Date(
        date.year() as u16,
        date.month() as u8,
        date.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond() / 1000,
    )
}

/// Convert a MySQL value to a Value
fn mysql_value_to_value(val: mysql_async::Value) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => Value::UInt64(n),
        mysql_async::Value::Float(f) => Value::Float64(f64::from(f)),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                return Value::Null;
            };
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                Value::Date(date)
            } else {
                chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                    .map(|time| Value::DateTime(date.and_time(time)))
                    .unwrap_or(Value::Null)
            }
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            if neg || days > 0 {
                let hours = days * 24 + hour as u32;
                let sign = if neg { "-" } else { "" };
                Value::String(format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, min, sec, micro))
            } else {
                chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                    .map(Value::Time)
                    .unwrap_or(Value::Null)
            }
        }
    }
}

fn convert_row(row: mysql_async::Row) -> Row {
    let columns: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values: Vec<Value> = (0..row.len())
        .map(|i| {
            let val: mysql_async::Value = row.get(i).unwrap_or(mysql_async::Value::NULL);
            mysql_value_to_value(val)
        })
        .collect();
    Row::new(columns, values)
}

/// MySQL connection
pub struct MySqlConnection {
    conn: Mutex<Option<Conn>>,
    database: String,
    query_timeout: Option<Duration>,
}

impl MySqlConnection {
    /// Wrap an established session
    pub fn new(conn: Conn, database: String) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            database,
            query_timeout: None,
        }
    }

    /// Connect using a configuration
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let opts = mysql_async::Opts::from_url(&config.url)
            .map_err(|e| Error::config(format!("Invalid MySQL connection string: {}", e)))?;
        let database = config.database().unwrap_or_default();

        let connect = Conn::new(OptsBuilder::from_opts(opts));
        let conn = match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                Error::timeout(format!("connecting to {}", redact_url(&config.url)))
            })?,
            None => connect.await,
        }
        .map_err(|e| Error::connection_with_source("Failed to connect to MySQL", e))?;

        debug!("Connected to MySQL at {}", redact_url(&config.url));
        let mut connection = Self::new(conn, database);
        connection.query_timeout = config.query_timeout;
        Ok(connection)
    }

    /// Database named in the connection URL
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Close the session
    pub async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect()
                .await
                .map_err(|e| Error::connection_with_source("Failed to close connection", e))?;
        }
        Ok(())
    }

    async fn run_query(&self, conn: &mut Conn, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let exec = conn.exec::<mysql_async::Row, _, _>(sql, mysql_params);
        let result = match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, exec)
                .await
                .map_err(|_| Error::timeout(format!("query exceeded {:?}", limit)))?,
            None => exec.await,
        };
        let rows = result.map_err(|e| Error::Query {
            message: format!("Failed to execute query: {}", e),
            sql: Some(sql.to_string()),
            source: Some(Box::new(e)),
        })?;
        Ok(rows.into_iter().map(convert_row).collect())
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::connection("Connection not available"))?;
        self.run_query(conn, sql, params).await
    }
}

/// Schema provider backed by INFORMATION_SCHEMA
pub struct MySqlSchemaProvider {
    conn: Arc<MySqlConnection>,
}

impl MySqlSchemaProvider {
    /// Create a provider sharing a connection
    pub fn new(conn: Arc<MySqlConnection>) -> Self {
        Self { conn }
    }

    async fn unique_indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexDefinition>> {
        let rows = self
            .conn
            .query(
                "SELECT INDEX_NAME, COLUMN_NAME FROM INFORMATION_SCHEMA.STATISTICS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND NON_UNIQUE = 0 \
                 AND INDEX_NAME <> 'PRIMARY' ORDER BY INDEX_NAME, SEQ_IN_INDEX",
                &[Value::from(schema), Value::from(table)],
            )
            .await?;

        let mut indexes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            let name = string_field(&row, "INDEX_NAME");
            let column = string_field(&row, "COLUMN_NAME");
            indexes.entry(name).or_default().push(column);
        }
        Ok(indexes
            .into_iter()
            .map(|(name, columns)| IndexDefinition::unique(name, columns))
            .collect())
    }

    async fn primary_key_ordinals(&self, schema: &str, table: &str) -> Result<BTreeMap<String, u32>> {
        let rows = self
            .conn
            .query(
                "SELECT COLUMN_NAME, SEQ_IN_INDEX FROM INFORMATION_SCHEMA.STATISTICS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND INDEX_NAME = 'PRIMARY' \
                 ORDER BY SEQ_IN_INDEX",
                &[Value::from(schema), Value::from(table)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let ordinal = row
                    .get_by_name("SEQ_IN_INDEX")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                (string_field(row, "COLUMN_NAME"), ordinal as u32)
            })
            .collect())
    }
}

fn string_field(row: &Row, name: &str) -> String {
    row.get_by_name(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl SchemaProvider for MySqlSchemaProvider {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let rows = self
            .conn
            .query(
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
                &[Value::from(schema)],
            )
            .await?;
        Ok(rows.iter().map(|row| string_field(row, "TABLE_NAME")).collect())
    }

    async fn get_table(&self, schema: &str, table: &str) -> Result<Option<TableDefinition>> {
        let rows = self
            .conn
            .query(
                "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
                &[Value::from(schema), Value::from(table)],
            )
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let pk = self.primary_key_ordinals(schema, table).await?;
        let mut definition = TableDefinition::new(schema, table);
        for row in &rows {
            let name = string_field(row, "COLUMN_NAME");
            let mut column = ColumnDefinition::new(name.clone(), string_field(row, "COLUMN_TYPE"));
            if string_field(row, "IS_NULLABLE") == "NO" {
                column = column.not_null();
            }
            if let Some(ordinal) = pk.get(&name) {
                column = column.primary_key(*ordinal);
            }
            definition = definition.with_column(column);
        }
        for index in self.unique_indexes(schema, table).await? {
            definition = definition.with_index(index);
        }
        Ok(Some(definition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_value_conversions() {
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::Bytes(b"abc".to_vec())),
            Value::String("abc".into())
        );
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::UInt(7)),
            Value::UInt64(7)
        );
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::UInt(u64::MAX)),
            Value::UInt64(u64::MAX)
        );
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::Date(2024, 2, 29, 0, 0, 0, 0)),
            Value::Date(date)
        );
        assert_eq!(
            mysql_value_to_value(mysql_async::Value::Date(2024, 2, 29, 10, 30, 0, 0)),
            Value::DateTime(date.and_hms_opt(10, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_value_to_sql() {
        assert_eq!(value_to_sql(&Value::Null), mysql_async::Value::NULL);
        assert_eq!(value_to_sql(&Value::Int64(5)), mysql_async::Value::Int(5));
        assert_eq!(
            value_to_sql(&Value::UInt64(1 << 63)),
            mysql_async::Value::UInt(1 << 63)
        );
        let dt = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(
            value_to_sql(&Value::DateTime(dt)),
            mysql_async::Value::Date(2024, 1, 2, 3, 4, 5, 0)
        );
    }
}

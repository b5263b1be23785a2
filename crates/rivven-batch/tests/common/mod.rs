//! Shared test harness: an in-memory database that understands the queries
//! rivven-batch generates, and a recording downstream consumer.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rivven_batch::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_batch=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Debug, Clone)]
struct MemTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// In-memory tables queried through [`Connection`]
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<HashMap<TableIdentity, MemTable>>,
    log: Mutex<Vec<(String, Vec<Value>)>>,
    fail_tables: Mutex<Vec<TableIdentity>>,
    fail_bounds: Mutex<bool>,
    case_insensitive: bool,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strings filter, sort and aggregate ignoring case, like MySQL's
    /// default collation
    pub fn case_insensitive() -> Self {
        Self {
            case_insensitive: true,
            ..Self::default()
        }
    }

    pub fn create_table(&self, identity: TableIdentity, columns: &[&str]) {
        self.tables.lock().insert(
            identity,
            MemTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn insert(&self, identity: &TableIdentity, values: Vec<Value>) {
        let mut tables = self.tables.lock();
        let table = tables.get_mut(identity).expect("table exists");
        assert_eq!(table.columns.len(), values.len());
        table.rows.push(values);
    }

    /// Delete rows whose `column` equals `value`
    pub fn delete_where(&self, identity: &TableIdentity, column: &str, value: &Value) -> usize {
        let mut tables = self.tables.lock();
        let table = tables.get_mut(identity).expect("table exists");
        let idx = table
            .columns
            .iter()
            .position(|c| c == column)
            .expect("column exists");
        let before = table.rows.len();
        table.rows.retain(|row| &row[idx] != value);
        before - table.rows.len()
    }

    /// Make every row query against `identity` fail
    pub fn fail_table(&self, identity: TableIdentity) {
        self.fail_tables.lock().push(identity);
    }

    /// Make MIN/MAX queries fail
    pub fn fail_bound_queries(&self) {
        *self.fail_bounds.lock() = true;
    }

    /// Every executed query with its arguments
    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.log.lock().clone()
    }

    /// Executed `SELECT *` queries against one table
    pub fn row_queries_for(&self, identity: &TableIdentity) -> usize {
        let needle = format!("FROM {}", identity);
        self.log
            .lock()
            .iter()
            .filter(|(sql, _)| sql.starts_with("SELECT *") && strip(sql).contains(&needle))
            .count()
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = strip(sql);
        if let Some(rest) = sql.strip_prefix("SELECT 1 FROM ") {
            let identity = parse_table(rest.trim_end_matches(" LIMIT 1"))?;
            let table = self.table(&identity)?;
            return Ok(table
                .rows
                .first()
                .map(|_| Row::new(vec!["1".into()], vec![Value::Int64(1)]))
                .into_iter()
                .collect());
        }

        if let Some(rest) = sql.strip_prefix("SELECT MIN(") {
            if *self.fail_bounds.lock() {
                return Err(Error::query("bound query failed"));
            }
            let column = rest.split(')').next().unwrap_or_default().to_string();
            let from = rest
                .split(" FROM ")
                .nth(1)
                .ok_or_else(|| Error::query("missing FROM"))?;
            let table = self.table(&parse_table(from)?)?;
            let idx = column_index(&table, &column)?;
            let values: Vec<&Value> = table
                .rows
                .iter()
                .map(|r| &r[idx])
                .filter(|v| !v.is_null())
                .collect();
            let min = values
                .iter()
                .min_by(|a, b| self.compare(a, b))
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null);
            let max = values
                .iter()
                .max_by(|a, b| self.compare(a, b))
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null);
            return Ok(vec![Row::new(
                vec![format!("MIN({})", column), format!("MAX({})", column)],
                vec![min, max],
            )]);
        }

        if let Some(rest) = sql.strip_prefix("SELECT * FROM ") {
            return self.select(rest, params);
        }

        Err(Error::query_with_sql("unsupported query", sql))
    }

    fn select(&self, rest: &str, params: &[Value]) -> Result<Vec<Row>> {
        let (head, tail) = rest
            .split_once(" ORDER BY ")
            .ok_or_else(|| Error::query("missing ORDER BY"))?;
        let (table_part, where_part) = match head.split_once(" WHERE ") {
            Some((t, w)) => (t, Some(w)),
            None => (head, None),
        };
        let identity = parse_table(table_part)?;
        if self.fail_tables.lock().contains(&identity) {
            return Err(Error::query_with_sql("injected failure", rest));
        }
        let table = self.table(&identity)?;

        let mut args = params.iter();
        let mut conditions = Vec::new();
        if let Some(where_part) = where_part {
            for cond in where_part.split(" AND ") {
                let parts: Vec<&str> = cond.split_whitespace().collect();
                let [column, op, "?"] = parts.as_slice() else {
                    return Err(Error::query(format!("bad condition {}", cond)));
                };
                let arg = args.next().ok_or_else(|| Error::query("missing arg"))?;
                conditions.push((column_index(&table, column)?, op.to_string(), arg.clone()));
            }
        }

        let (order_part, has_offset) = match tail.strip_suffix(" LIMIT ? OFFSET ?") {
            Some(order) => (order, true),
            None => (
                tail.strip_suffix(" LIMIT ?")
                    .ok_or_else(|| Error::query("missing LIMIT"))?,
                false,
            ),
        };
        let order: Vec<usize> = order_part
            .split(", ")
            .map(|c| column_index(&table, c))
            .collect::<Result<_>>()?;
        let limit = args
            .next()
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::query("missing limit arg"))? as usize;
        let offset = if has_offset {
            args.next()
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::query("missing offset arg"))? as usize
        } else {
            0
        };

        let mut rows: Vec<Vec<Value>> = table
            .rows
            .iter()
            .filter(|row| {
                conditions
                    .iter()
                    .all(|(idx, op, arg)| self.matches_condition(&row[*idx], op, arg))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            order
                .iter()
                .map(|&i| self.compare(&a[i], &b[i]))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|values| Row::new(table.columns.clone(), values))
            .collect())
    }

    fn collate(&self, value: &Value) -> Value {
        match value {
            Value::String(s) if self.case_insensitive => Value::String(s.to_lowercase()),
            other => other.clone(),
        }
    }

    fn matches_condition(&self, value: &Value, op: &str, arg: &Value) -> bool {
        matches_condition(&self.collate(value), op, &self.collate(arg))
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        compare(&self.collate(a), &self.collate(b))
    }

    fn table(&self, identity: &TableIdentity) -> Result<MemTable> {
        self.tables
            .lock()
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::TableNotFound {
                table: identity.to_string(),
            })
    }
}

#[async_trait]
impl Connection for MemoryDatabase {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.log.lock().push((sql.to_string(), params.to_vec()));
        self.execute(sql, params)
    }
}

fn strip(sql: &str) -> String {
    sql.replace('`', "")
}

fn parse_table(text: &str) -> Result<TableIdentity> {
    TableIdentity::parse(text.trim())
}

fn column_index(table: &MemTable, column: &str) -> Result<usize> {
    table
        .columns
        .iter()
        .position(|c| c == column)
        .ok_or_else(|| Error::query(format!("unknown column {}", column)))
}

fn matches_condition(value: &Value, op: &str, arg: &Value) -> bool {
    let (Ok(v), Ok(a)) = (ColumnValue::try_from(value), ColumnValue::try_from(arg)) else {
        return false;
    };
    if v.is_null() || a.is_null() {
        return false;
    }
    match (op, v.partial_cmp(&a)) {
        (">", Some(o)) => o == Ordering::Greater,
        (">=", Some(o)) => o != Ordering::Less,
        ("<=", Some(o)) => o != Ordering::Greater,
        ("<", Some(o)) => o == Ordering::Less,
        _ => false,
    }
}

/// Total order used for ORDER BY and MIN/MAX; NULL sorts first
fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Float64(x), Value::Float64(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        _ => match (ColumnValue::try_from(a), ColumnValue::try_from(b)) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => format!("{:?}", a).cmp(&format!("{:?}", b)),
        },
    }
}

/// Downstream consumer that records and commits every message
#[derive(Default)]
pub struct RecordingSubmitter {
    messages: Mutex<Vec<(TableIdentity, Row)>>,
    failing: Mutex<Vec<TableIdentity>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    submitted: AtomicUsize,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve messages for `identity` as failed
    pub fn fail_table(&self, identity: TableIdentity) {
        self.failing.lock().push(identity);
    }

    /// Cancel `token` once `count` messages have been submitted
    pub fn cancel_after(&self, count: usize, token: CancellationToken) {
        *self.cancel_after.lock() = Some((count, token));
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn count_for(&self, identity: &TableIdentity) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _)| t == identity)
            .count()
    }

    /// Values of `column` for every recorded row of `identity`, in emission order
    pub fn values_for(&self, identity: &TableIdentity, column: &str) -> Vec<Value> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _)| t == identity)
            .filter_map(|(_, row)| row.get_by_name(column).cloned())
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

#[async_trait]
impl MessageSubmitter for RecordingSubmitter {
    async fn submit(&self, mut message: ChangeMessage) -> Result<()> {
        assert_eq!(message.kind, MessageKind::RowDump);
        let submitted = self.submitted.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        if let Some((count, token)) = self.cancel_after.lock().as_ref() {
            if submitted >= *count {
                token.cancel();
            }
        }

        if self.failing.lock().contains(&message.table) {
            message.fail("downstream rejected row");
            return Ok(());
        }
        self.messages
            .lock()
            .push((message.table.clone(), message.row.clone()));
        message.commit();
        Ok(())
    }
}

pub fn id(schema: &str, table: &str) -> TableIdentity {
    TableIdentity::new(schema, table)
}

/// `(id bigint primary key, name varchar)` with ids 1..=rows
pub fn int_table(db: &MemoryDatabase, identity: &TableIdentity, rows: i64) -> TableDefinition {
    db.create_table(identity.clone(), &["id", "name"]);
    for i in 1..=rows {
        db.insert(
            identity,
            vec![Value::Int64(i), Value::String(format!("name_{}", i))],
        );
    }
    TableDefinition::new(identity.schema.clone(), identity.table.clone())
        .with_column(ColumnDefinition::new("id", "bigint").primary_key(1))
        .with_column(ColumnDefinition::new("name", "varchar(64)"))
}

/// Work item with scan columns chosen by the key selector
pub fn work_for(table: TableDefinition) -> TableWork {
    let scan_columns = select_scan_columns(&table, None).unwrap();
    let config = TableConfig::new(table.identity.schema.clone(), [table.identity.table.clone()]);
    TableWork::new(table, Arc::new(config), scan_columns)
}

pub async fn memory_store(repo: Arc<MemoryPositionRepo>) -> Arc<PositionStore> {
    PositionStore::open(
        "test-run",
        repo,
        Arc::new(JsonPositionCodec),
        Duration::from_secs(3600),
    )
    .await
    .unwrap()
}

pub fn options(batch_size: usize) -> ScannerOptions {
    ScannerOptions {
        nr_scanner: 4,
        batch_size,
        batches_per_second: 0,
        completion_timeout: Some(Duration::from_secs(5)),
        work_queue_capacity: None,
    }
}

/// Run a scanner to completion over `works`
pub async fn scan(
    db: &Arc<MemoryDatabase>,
    store: &Arc<PositionStore>,
    submitter: &Arc<RecordingSubmitter>,
    works: Vec<TableWork>,
    batch_size: usize,
) -> ScanReport {
    let scanner = TableScanner::new(
        db.clone(),
        Arc::new(MySqlDialect),
        store.clone(),
        submitter.clone(),
        options(batch_size),
    );
    scanner.start(works).join().await
}

//! Scan key selection and table resolution
//!
//! Every table is paginated by an ordered set of scan columns. Selection
//! order:
//! 1. configured `scan_column` override, when every column exists and is usable;
//!    nullable override columns are accepted with a warning, since rows whose
//!    key is NULL never match a range condition
//! 2. the primary key, in key order
//! 3. a single-column unique index over a NOT NULL column
//! 4. [`ScanColumnSet::FullDump`] (offset pagination over all columns)

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TableConfig;
use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::schema::SchemaProvider;
use crate::types::{TableDefinition, TableIdentity};

/// Columns a table is paginated by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "columns", rename_all = "snake_case")]
pub enum ScanColumnSet {
    /// Range pagination over these columns, in order
    Keyed(Vec<String>),
    /// No usable key; page with LIMIT/OFFSET over every column
    FullDump,
}

impl ScanColumnSet {
    /// Create a keyed set; an empty column list is rejected
    pub fn keyed<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(Error::schema("scan column set cannot be empty"));
        }
        Ok(Self::Keyed(columns))
    }

    /// Scan columns; empty for a full dump
    pub fn columns(&self) -> &[String] {
        match self {
            Self::Keyed(columns) => columns,
            Self::FullDump => &[],
        }
    }

    /// Whether this table is paged by offset
    #[inline]
    pub fn is_full_dump(&self) -> bool {
        matches!(self, Self::FullDump)
    }
}

impl std::fmt::Display for ScanColumnSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keyed(columns) => write!(f, "({})", columns.join(", ")),
            Self::FullDump => write!(f, "<full dump>"),
        }
    }
}

/// A table ready to be scanned
#[derive(Debug, Clone)]
pub struct TableWork {
    /// Table definition
    pub table: TableDefinition,
    /// The config entry the table was resolved from
    pub config: Arc<TableConfig>,
    /// Resolved scan columns
    pub scan_columns: ScanColumnSet,
}

impl TableWork {
    /// Create a work item
    pub fn new(table: TableDefinition, config: Arc<TableConfig>, scan_columns: ScanColumnSet) -> Self {
        Self {
            table,
            config,
            scan_columns,
        }
    }

    /// Table identity
    #[inline]
    pub fn identity(&self) -> &TableIdentity {
        &self.table.identity
    }
}

/// Choose the scan columns for a table
pub fn select_scan_columns(
    table: &TableDefinition,
    override_columns: Option<&[String]>,
) -> Result<ScanColumnSet> {
    if let Some(columns) = override_columns {
        match validate_override(table, columns) {
            Ok(columns) => {
                let nullable = nullable_columns(table, &columns);
                if !nullable.is_empty() {
                    warn!(
                        table = %table.identity,
                        columns = ?nullable,
                        "Scan column override is nullable; rows with a NULL key will be skipped"
                    );
                }
                return Ok(ScanColumnSet::Keyed(columns));
            }
            Err(reason) => warn!(
                table = %table.identity,
                columns = ?columns,
                "Ignoring scan column override: {}",
                reason
            ),
        }
    }

    let pk = table.primary_key_columns();
    if !pk.is_empty() && pk.iter().all(|c| c.type_class.is_scannable()) {
        return ScanColumnSet::keyed(pk.iter().map(|c| c.name.clone()));
    }

    for index in table.indexes.iter().filter(|i| i.unique && i.columns.len() == 1) {
        if let Some(column) = table.column(&index.columns[0]) {
            if !column.nullable && column.type_class.is_scannable() {
                debug!(
                    table = %table.identity,
                    index = %index.name,
                    "Using unique index as scan key"
                );
                return Ok(ScanColumnSet::Keyed(vec![column.name.clone()]));
            }
        }
    }

    info!(table = %table.identity, "No usable scan key, falling back to full dump");
    Ok(ScanColumnSet::FullDump)
}

fn validate_override(
    table: &TableDefinition,
    columns: &[String],
) -> std::result::Result<Vec<String>, String> {
    if columns.is_empty() {
        return Err("empty column list".to_string());
    }
    columns
        .iter()
        .map(|name| match table.column(name) {
            None => Err(format!("column '{}' does not exist", name)),
            Some(column) if !column.type_class.is_scannable() => Err(format!(
                "column '{}' has unusable type {}",
                name, column.type_name
            )),
            Some(column) => Ok(column.name.clone()),
        })
        .collect()
}

fn nullable_columns(table: &TableDefinition, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .filter(|name| table.column(name).is_some_and(|c| c.nullable))
        .cloned()
        .collect()
}

/// Drop work items whose table has no rows
pub async fn delete_empty_tables(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    works: Vec<TableWork>,
) -> Result<Vec<TableWork>> {
    let mut kept = Vec::with_capacity(works.len());
    for work in works {
        let sql = dialect.any_row_sql(work.identity());
        if conn.query_one(&sql, &[]).await?.is_some() {
            kept.push(work);
        } else {
            info!(table = %work.identity(), "Skipping empty table");
        }
    }
    Ok(kept)
}

/// Expand configured table names into work items
///
/// Names may contain `*` and `?` wildcards, matched case-insensitively. A
/// table matched by several entries is scanned once, using the first entry.
/// A literal name that does not exist is an error.
pub async fn resolve_tables(
    provider: &dyn SchemaProvider,
    table_configs: &[TableConfig],
) -> Result<Vec<TableWork>> {
    let mut seen = HashSet::new();
    let mut works = Vec::new();

    for config in table_configs {
        let shared = Arc::new(config.clone());
        let mut listed: Option<Vec<String>> = None;

        for pattern in &config.table {
            let names = if is_glob(pattern) {
                if listed.is_none() {
                    listed = Some(provider.list_tables(&config.schema).await?);
                }
                let matcher = glob_matcher(pattern)?;
                let names: Vec<String> = listed
                    .iter()
                    .flatten()
                    .filter(|name| matcher.is_match(name))
                    .cloned()
                    .collect();
                if names.is_empty() {
                    warn!(schema = %config.schema, pattern = %pattern, "Pattern matched no tables");
                }
                names
            } else {
                vec![pattern.clone()]
            };

            for name in names {
                let identity = TableIdentity::new(config.schema.clone(), name.clone());
                if !seen.insert(identity.clone()) {
                    continue;
                }
                let table = provider
                    .get_table(&config.schema, &name)
                    .await?
                    .ok_or_else(|| Error::TableNotFound {
                        table: identity.to_string(),
                    })?;
                let scan_columns = select_scan_columns(&table, config.scan_column.as_deref())?;
                debug!(table = %identity, scan_columns = %scan_columns, "Resolved table");
                works.push(TableWork::new(table, shared.clone(), scan_columns));
            }
        }
    }

    Ok(works)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

fn glob_matcher(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern);
    let translated = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    RegexBuilder::new(&format!("^{}$", translated))
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::config(format!("invalid table pattern '{}': {}", pattern, e)))
}

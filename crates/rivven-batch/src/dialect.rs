//! SQL dialects
//!
//! Range queries bind values with `?`, so only the MySQL family is supported.
//! The dialect owns identifier quoting and the fixed probe statements the
//! scanner issues besides range queries.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::TableIdentity;

/// Dialect-specific SQL text
pub trait SqlDialect: Send + Sync {
    /// Dialect name
    fn name(&self) -> &'static str;

    /// Quote a table or column name
    fn quote_identifier(&self, name: &str) -> String;

    /// Quoted `schema.table`
    fn qualified_table(&self, table: &TableIdentity) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(&table.schema),
            self.quote_identifier(&table.table)
        )
    }

    /// Quote every column name, keeping order
    fn quote_columns(&self, columns: &[String]) -> Vec<String> {
        columns.iter().map(|c| self.quote_identifier(c)).collect()
    }

    /// Statement returning one row when the table has any row
    fn any_row_sql(&self, table: &TableIdentity) -> String {
        format!("SELECT 1 FROM {} LIMIT 1", self.qualified_table(table))
    }

    /// Statement returning `(MIN(column), MAX(column))`
    fn min_max_sql(&self, table: &TableIdentity, column: &str) -> String {
        let quoted = self.quote_identifier(column);
        format!(
            "SELECT MIN({q}), MAX({q}) FROM {}",
            self.qualified_table(table),
            q = quoted
        )
    }
}

/// MySQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }
}

/// MariaDB dialect; quoting matches MySQL
#[derive(Debug, Clone, Copy, Default)]
pub struct MariaDbDialect;

impl SqlDialect for MariaDbDialect {
    fn name(&self) -> &'static str {
        "MariaDB"
    }

    fn quote_identifier(&self, name: &str) -> String {
        MySqlDialect.quote_identifier(name)
    }
}

/// Pick the dialect for a connection URL scheme
pub fn dialect_for(url: &str) -> Result<Arc<dyn SqlDialect>> {
    let scheme = url.split_once("://").map(|(s, _)| s).unwrap_or(url);
    match scheme.to_ascii_lowercase().as_str() {
        "mysql" => Ok(Arc::new(MySqlDialect)),
        "mariadb" => Ok(Arc::new(MariaDbDialect)),
        other => Err(Error::config(format!(
            "unsupported source scheme '{}', expected mysql or mariadb",
            other
        ))),
    }
}

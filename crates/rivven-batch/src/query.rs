//! Range query generation
//!
//! Every batch is a parameterized `SELECT *` over one table:
//!
//! ```text
//! SELECT * FROM a.b WHERE v1 > ? AND v1 <= ? AND v2 > ? AND v2 <= ? ORDER BY v1, v2 LIMIT ?
//! ```
//!
//! Each scan column is bounded independently (a bounding box, not a
//! lexicographic tuple range). Identifiers are used verbatim; callers quote
//! them through a [`SqlDialect`](crate::dialect::SqlDialect) first.

use crate::error::{Error, Result};
use crate::types::{ColumnValue, Value};

/// A generated query with its positional arguments
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    /// SQL text with `?` placeholders
    pub sql: String,
    /// Arguments in placeholder order
    pub args: Vec<Value>,
}

/// Builds batch queries for one table
#[derive(Debug, Clone)]
pub struct RangeQueryBuilder {
    full_table_name: String,
    batch_size: usize,
}

impl RangeQueryBuilder {
    /// Create a builder for `full_table_name` returning at most `batch_size` rows
    pub fn new(full_table_name: impl Into<String>, batch_size: usize) -> Self {
        Self {
            full_table_name: full_table_name.into(),
            batch_size,
        }
    }

    /// Rows strictly after `low` up to and including `high`
    pub fn range(
        &self,
        columns: &[String],
        low: &[ColumnValue],
        high: &[ColumnValue],
    ) -> Result<RangeQuery> {
        self.build(columns, low, high, ">")
    }

    /// Rows from `low` (inclusive) up to and including `high`
    ///
    /// Used for the first batch of a table, when no row has been emitted yet.
    pub fn initial_range(
        &self,
        columns: &[String],
        low: &[ColumnValue],
        high: &[ColumnValue],
    ) -> Result<RangeQuery> {
        self.build(columns, low, high, ">=")
    }

    /// Unbounded page over a table without a usable key
    pub fn full_dump(&self, order_columns: &[String], offset: u64) -> Result<RangeQuery> {
        if order_columns.is_empty() {
            return Err(Error::schema(format!(
                "{} has no columns to order by",
                self.full_table_name
            )));
        }

        let sql = format!(
            "SELECT * FROM {} ORDER BY {} LIMIT ? OFFSET ?",
            self.full_table_name,
            order_columns.join(", ")
        );
        Ok(RangeQuery {
            sql,
            args: vec![Value::from(self.batch_size as u64), Value::from(offset)],
        })
    }

    fn build(
        &self,
        columns: &[String],
        low: &[ColumnValue],
        high: &[ColumnValue],
        low_op: &str,
    ) -> Result<RangeQuery> {
        if columns.is_empty() {
            return Err(Error::internal("range query needs at least one column"));
        }
        if columns.len() != low.len() || columns.len() != high.len() {
            return Err(Error::internal(format!(
                "range query arity mismatch: {} columns, {} low values, {} high values",
                columns.len(),
                low.len(),
                high.len()
            )));
        }

        let mut conditions = Vec::with_capacity(columns.len() * 2);
        let mut args = Vec::with_capacity(columns.len() * 2 + 1);
        for ((column, lo), hi) in columns.iter().zip(low).zip(high) {
            conditions.push(format!("{} {} ?", column, low_op));
            conditions.push(format!("{} <= ?", column));
            args.push(Value::from(lo.clone()));
            args.push(Value::from(hi.clone()));
        }
        args.push(Value::from(self.batch_size as u64));

        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {} LIMIT ?",
            self.full_table_name,
            conditions.join(" AND "),
            columns.join(", ")
        );
        Ok(RangeQuery { sql, args })
    }
}

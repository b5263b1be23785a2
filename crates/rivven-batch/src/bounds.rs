//! Scan boundaries
//!
//! A [`Bound`] holds one value per scan column, in scan-column order. The
//! minimum and maximum of a table are computed per column independently, so
//! together they describe a bounding box rather than the smallest and
//! largest key tuple.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::types::{ColumnValue, Row, TableIdentity};

/// One scan column and its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnBound {
    /// Column name
    pub column: String,
    /// Value
    pub value: ColumnValue,
}

/// Values for every scan column of a table, in scan-column order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bound(Vec<ColumnBound>);

impl Bound {
    /// Create an empty bound
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(column, value)` pairs
    pub fn from_pairs<I, S, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<ColumnValue>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(column, value)| ColumnBound {
                    column: column.into(),
                    value: value.into(),
                })
                .collect(),
        )
    }

    /// Take the scan-column values out of a result row
    pub fn from_row(row: &Row, columns: &[String]) -> Result<Self> {
        let mut pairs = Vec::with_capacity(columns.len());
        for column in columns {
            let value = row.get_by_name(column).ok_or_else(|| {
                Error::schema(format!("scan column '{}' missing from result row", column))
            })?;
            pairs.push((column.clone(), ColumnValue::try_from(value)?));
        }
        Ok(Self::from_pairs(pairs))
    }

    /// Number of columns
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bound has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Column names in order
    pub fn columns(&self) -> Vec<String> {
        self.0.iter().map(|b| b.column.clone()).collect()
    }

    /// Values in order
    pub fn values(&self) -> Vec<ColumnValue> {
        self.0.iter().map(|b| b.value.clone()).collect()
    }

    /// Value for a column
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.0
            .iter()
            .find(|b| b.column == column)
            .map(|b| &b.value)
    }

    /// Whether every value is NULL (an empty bound counts as all-null)
    pub fn is_all_null(&self) -> bool {
        self.0.iter().all(|b| b.value.is_null())
    }

    /// Whether this cursor has reached `max` on every column
    ///
    /// A NULL maximum is always reached. A NULL cursor value never reaches a
    /// non-NULL maximum. Strings are ordered by the source collation, which
    /// may ignore case or accents, so a string column is reached only when
    /// the cursor equals the maximum exactly; otherwise the scan ends on its
    /// first short batch.
    pub fn reached(&self, max: &Bound) -> Result<bool> {
        self.check_shape(max)?;
        for (cur, hi) in self.0.iter().zip(&max.0) {
            let reached = match (&cur.value, &hi.value) {
                (_, ColumnValue::Null) => true,
                (ColumnValue::Null, _) => false,
                (ColumnValue::String(c), ColumnValue::String(h)) => c == h,
                (c, h) => c.try_compare(h)? != Ordering::Less,
            };
            if !reached {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether any column of this cursor is behind `previous`
    ///
    /// NULL and string components are skipped: their order belongs to the
    /// database.
    pub fn regresses_from(&self, previous: &Bound) -> Result<bool> {
        self.check_shape(previous)?;
        for (cur, prev) in self.0.iter().zip(&previous.0) {
            if cur.value.is_null() || prev.value.is_null() {
                continue;
            }
            if matches!(cur.value, ColumnValue::String(_))
                || matches!(prev.value, ColumnValue::String(_))
            {
                continue;
            }
            if cur.value.try_compare(&prev.value)? == Ordering::Less {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn check_shape(&self, other: &Bound) -> Result<()> {
        let same = self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|(a, b)| a.column == b.column);
        if same {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "bound columns differ: {:?} vs {:?}",
                self.columns(),
                other.columns()
            )))
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", b.column, b.value)?;
        }
        write!(f, ")")
    }
}

/// Per-column maximum and minimum of a table, returned as `(max, min)`
///
/// Issues one `MIN`/`MAX` query per column. An all-NULL (or empty) column
/// yields [`ColumnValue::Null`] on both sides.
pub async fn find_max_min_values(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    table: &TableIdentity,
    columns: &[String],
) -> Result<(Bound, Bound)> {
    let mut max = Vec::with_capacity(columns.len());
    let mut min = Vec::with_capacity(columns.len());

    for column in columns {
        let sql = dialect.min_max_sql(table, column);
        let (lo, hi) = match conn.query_one(&sql, &[]).await? {
            Some(row) => (
                row.get(0).map(ColumnValue::try_from).transpose()?,
                row.get(1).map(ColumnValue::try_from).transpose()?,
            ),
            None => (None, None),
        };
        let lo = lo.unwrap_or(ColumnValue::Null);
        let hi = hi.unwrap_or(ColumnValue::Null);
        debug!(table = %table, column = %column, min = %lo, max = %hi, "Found column bounds");
        min.push((column.clone(), lo));
        max.push((column.clone(), hi));
    }

    Ok((Bound::from_pairs(max), Bound::from_pairs(min)))
}

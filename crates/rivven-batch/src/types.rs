//! Value types for rivven-batch
//!
//! Two value models live here:
//! - [`Value`]: the row payload, wide enough to carry any column a source returns
//! - [`ColumnValue`]: the closed set of kinds a scan bound or cursor may hold
//!
//! Plus the table-definition shape supplied by the schema collaborator.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// SQL value type that can hold any database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit unsigned integer (BIGINT UNSIGNED)
    UInt64(u64),
    /// 64-bit floating point (DOUBLE)
    Float64(f64),
    /// Decimal kept in its textual form (DECIMAL, NUMERIC)
    Decimal(String),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (DATETIME)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMP)
    DateTimeTz(DateTime<Utc>),
    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::UInt64(_) => "BIGINT UNSIGNED",
            Self::Float64(_) => "DOUBLE",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BLOB",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "DATETIME",
            Self::DateTimeTz(_) => "TIMESTAMP",
            Self::Json(_) => "JSON",
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::UInt64(n) => i64::try_from(*n).ok(),
            Self::String(s) | Self::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// A bound or cursor value for one scan column.
///
/// Ordering is only defined between values of the same kind. `Null` equals
/// `Null`; comparing different kinds is invalid and yields `None` from
/// [`PartialOrd::partial_cmp`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    /// SQL NULL (all-null column or missing value)
    Null,
    /// Any integer that fits `i64`
    Integer(i64),
    /// Unsigned integer above `i64::MAX`
    Unsigned(u64),
    /// Character data
    String(String),
    /// Date or timestamp, normalized to a naive UTC timestamp
    Time(NaiveDateTime),
}

impl ColumnValue {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Kind name, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) | Self::Unsigned(_) => "integer",
            Self::String(_) => "string",
            Self::Time(_) => "time",
        }
    }

    /// Compare two values, failing on a cross-kind comparison
    pub fn try_compare(&self, other: &Self) -> Result<Ordering> {
        self.partial_cmp(other).ok_or_else(|| {
            Error::type_conversion(format!(
                "cannot compare {} value with {} value",
                self.kind(),
                other.kind()
            ))
        })
    }
}

impl PartialOrd for ColumnValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Unsigned(a), Self::Unsigned(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Unsigned(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Self::Unsigned(a), Self::Integer(b)) => Some(i128::from(*a).cmp(&i128::from(*b))),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Unsigned(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "'{}'", s),
            Self::Time(t) => write!(f, "{}", t),
        }
    }
}

impl TryFrom<&Value> for ColumnValue {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Int32(n) => Ok(Self::Integer(i64::from(*n))),
            Value::Int64(n) => Ok(Self::Integer(*n)),
            Value::UInt64(n) => Ok(Self::from(*n)),
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Date(d) => Ok(Self::Time(d.and_time(NaiveTime::MIN))),
            Value::DateTime(dt) => Ok(Self::Time(*dt)),
            Value::DateTimeTz(dt) => Ok(Self::Time(dt.naive_utc())),
            other => Err(Error::type_conversion(format!(
                "{} is not a usable scan column value",
                other.sql_type()
            ))),
        }
    }
}

impl From<ColumnValue> for Value {
    fn from(v: ColumnValue) -> Self {
        match v {
            ColumnValue::Null => Self::Null,
            ColumnValue::Integer(n) => Self::Int64(n),
            ColumnValue::Unsigned(n) => Self::UInt64(n),
            ColumnValue::String(s) => Self::String(s),
            ColumnValue::Time(t) => Self::DateTime(t),
        }
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u64> for ColumnValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(n) => Self::Integer(n),
            Err(_) => Self::Unsigned(v),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<NaiveDateTime> for ColumnValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::Time(v)
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }
}

/// Schema + table name, the stable key for a table everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdentity {
    /// Schema (database for MySQL)
    pub schema: String,
    /// Table name
    pub table: String,
}

impl TableIdentity {
    /// Create a new identity
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse a `schema.table` name
    pub fn parse(qualified: &str) -> Result<Self> {
        match qualified.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(schema, table))
            }
            _ => Err(Error::config(format!(
                "expected schema.table, got '{}'",
                qualified
            ))),
        }
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Coarse type class of a column, used to decide scan-column eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeClass {
    /// Integer types of any width
    Integer,
    /// Character types
    String,
    /// Date and timestamp types
    Time,
    /// Everything else (floats, decimals, blobs, json, ...)
    Other,
}

impl TypeClass {
    /// Derive the class from a vendor SQL type name
    pub fn from_type_name(type_name: &str) -> Self {
        let base = type_name
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match base.as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "serial"
            | "bigserial" => Self::Integer,
            "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum" => {
                Self::String
            }
            "date" | "datetime" | "timestamp" => Self::Time,
            _ => Self::Other,
        }
    }

    /// Whether values of this class can bound a range scan
    #[inline]
    pub const fn is_scannable(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,
    /// SQL type name (vendor-specific)
    pub type_name: String,
    /// Type class derived from the type name
    pub type_class: TypeClass,
    /// Whether column is nullable
    pub nullable: bool,
    /// Primary key ordinal (1-based, None if not PK)
    pub primary_key_ordinal: Option<u32>,
}

impl ColumnDefinition {
    /// Create a nullable, non-key column
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            type_class: TypeClass::from_type_name(&type_name),
            type_name,
            nullable: true,
            primary_key_ordinal: None,
        }
    }

    /// Mark as primary key column at the given 1-based ordinal
    pub fn primary_key(mut self, ordinal: u32) -> Self {
        self.primary_key_ordinal = Some(ordinal);
        self.nullable = false;
        self
    }

    /// Mark as NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Check if this column is part of the primary key
    #[inline]
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_ordinal.is_some()
    }
}

/// Index definition
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    /// Index name
    pub name: String,
    /// Column names (in order)
    pub columns: Vec<String>,
    /// Whether the index is unique
    pub unique: bool,
}

impl IndexDefinition {
    /// Create a unique index
    pub fn unique(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: true,
        }
    }
}

/// Table definition as supplied by the schema collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    /// Table identity
    pub identity: TableIdentity,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDefinition>,
    /// Secondary indexes
    pub indexes: Vec<IndexDefinition>,
}

impl TableDefinition {
    /// Create an empty definition
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            identity: TableIdentity::new(schema, table),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column
    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    /// Add an index
    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Get column by name (case-insensitive)
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Get primary key columns in key order
    pub fn primary_key_columns(&self) -> Vec<&ColumnDefinition> {
        let mut pk_cols: Vec<_> = self.columns.iter().filter(|c| c.is_primary_key()).collect();
        pk_cols.sort_by_key(|c| c.primary_key_ordinal);
        pk_cols
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

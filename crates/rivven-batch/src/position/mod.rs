//! Resumable scan checkpoints
//!
//! The checkpoint of a run is one [`BatchPositionValueV1`]: the run start time
//! plus a [`TableScanState`] per table, keyed by `schema.table`. The
//! [`PositionStore`] holds it in memory, updates it after every completed
//! batch, and flushes it to a [`PositionRepo`] on a timer through a
//! [`PositionCodec`].
//!
//! | Repo | Use Case |
//! |------|----------|
//! | `MemoryPositionRepo` | Testing, ephemeral runs |
//! | `FilePositionRepo` | Single-node production |
//! | `MySqlPositionRepo` | Checkpoints kept in the source database |

mod codec;
mod init;
mod repo;
mod store;

pub use codec::{JsonPositionCodec, PositionCodec, POSITION_VERSION_V1};
pub use init::{init_table_position, seed_table_positions, setup_initial_position};
pub use repo::{
    FilePositionRepo, MemoryPositionRepo, MySqlPositionRepo, PositionRepo, StoredPosition,
    DEFAULT_POSITION_TABLE,
};
pub use store::PositionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bounds::Bound;
use crate::error::Result;
use crate::key_selector::ScanColumnSet;
use crate::types::TableIdentity;

/// Scan progress of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableScanState {
    /// Table identity
    pub identity: TableIdentity,
    /// Columns the table is paginated by
    pub scan_columns: ScanColumnSet,
    /// Per-column maximum at seeding time
    pub max: Bound,
    /// Per-column minimum at seeding time
    pub min: Bound,
    /// Scan-column values of the last emitted row
    pub current: Option<Bound>,
    /// Whether the table is finished
    pub done: bool,
    /// Rows emitted so far; the offset cursor of a full dump
    pub rows_scanned: u64,
}

impl TableScanState {
    /// Fresh state for a table that has not been scanned yet
    pub fn new(identity: TableIdentity, scan_columns: ScanColumnSet, max: Bound, min: Bound) -> Self {
        Self {
            identity,
            scan_columns,
            max,
            min,
            current: None,
            done: false,
            rows_scanned: 0,
        }
    }

    /// Whether there is nothing left to scan
    ///
    /// A keyed table is exhausted when its maximum is all-NULL or its cursor
    /// has reached the maximum on every column; a full dump only when done.
    pub fn is_exhausted(&self) -> Result<bool> {
        if self.done {
            return Ok(true);
        }
        if self.scan_columns.is_full_dump() {
            return Ok(false);
        }
        if self.max.is_all_null() {
            return Ok(true);
        }
        match &self.current {
            Some(current) => current.reached(&self.max),
            None => Ok(false),
        }
    }
}

/// Version 1 of the persisted checkpoint value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPositionValueV1 {
    /// When the run first started
    pub start: DateTime<Utc>,
    /// Per-table state keyed by `schema.table`
    #[serde(default)]
    pub table_states: BTreeMap<String, TableScanState>,
}

impl BatchPositionValueV1 {
    /// Empty value for a run starting at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            table_states: BTreeMap::new(),
        }
    }
}

/// A named checkpoint as seen by callers
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    /// Checkpoint name
    pub name: String,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Checkpoint value
    pub value: BatchPositionValueV1,
}

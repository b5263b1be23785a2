//! Seeding checkpoint state

use chrono::Utc;
use tracing::{info, warn};

use super::{PositionStore, TableScanState};
use crate::bounds::{find_max_min_values, Bound};
use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::key_selector::{ScanColumnSet, TableWork};

/// Record an empty checkpoint for a fresh run and flush it
///
/// Does nothing when a position already exists.
pub async fn setup_initial_position(store: &PositionStore) -> Result<()> {
    if store.get().is_some() {
        return Ok(());
    }
    let start = Utc::now();
    store.record_start(start);
    store.flush().await?;
    info!("Initialized position {} at {}", store.name(), start);
    Ok(())
}

/// Seed every table's scan state before any worker starts
///
/// Bounds of all tables are taken back to back, then the checkpoint is
/// flushed. A table whose bound queries fail is left unseeded and retried by
/// its worker, which reports the failure. Returns the number of seeded or
/// already stored tables.
pub async fn seed_table_positions(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    store: &PositionStore,
    works: &[TableWork],
) -> Result<usize> {
    let mut seeded = 0;
    for work in works {
        match init_table_position(conn, dialect, store, work).await {
            Ok(_) => seeded += 1,
            Err(e) => warn!(table = %work.identity(), "Failed to seed table position: {}", e),
        }
    }
    store.flush().await?;
    info!(seeded, tables = works.len(), "Seeded table positions");
    Ok(seeded)
}

/// Load or seed the scan state of one table
///
/// A stored state is returned as-is, including its scan columns. Otherwise
/// the table's bounds are computed and a fresh state is stored. When the
/// bound queries fail nothing is stored.
pub async fn init_table_position(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    store: &PositionStore,
    work: &TableWork,
) -> Result<TableScanState> {
    let identity = work.identity();

    if let Some(state) = store.table_state(identity) {
        if state.scan_columns != work.scan_columns {
            warn!(
                table = %identity,
                stored = %state.scan_columns,
                selected = %work.scan_columns,
                "Scan columns differ from the stored position, keeping stored columns"
            );
        }
        return Ok(state);
    }

    let (max, min) = match &work.scan_columns {
        ScanColumnSet::Keyed(columns) => {
            find_max_min_values(conn, dialect, identity, columns).await?
        }
        ScanColumnSet::FullDump => (Bound::new(), Bound::new()),
    };

    info!(table = %identity, max = %max, min = %min, "Seeded table position");
    let state = TableScanState::new(identity.clone(), work.scan_columns.clone(), max, min);
    store.put(state.clone())?;
    Ok(state)
}

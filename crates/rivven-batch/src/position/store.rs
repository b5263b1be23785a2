//! In-memory checkpoint with periodic durable flush

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BatchPositionValueV1, PositionCodec, PositionRepo, PositionSnapshot, StoredPosition, TableScanState};
use crate::error::{Error, Result};
use crate::types::TableIdentity;

#[derive(Debug, Clone, Copy)]
struct Header {
    start: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Checkpoint of one batch run
///
/// `put` only touches memory; durability comes from [`flush`](Self::flush),
/// driven by the task started with [`start_flush_task`](Self::start_flush_task)
/// and by [`close`](Self::close).
pub struct PositionStore {
    name: String,
    repo: Arc<dyn PositionRepo>,
    codec: Arc<dyn PositionCodec>,
    flush_interval: Duration,
    header: RwLock<Option<Header>>,
    states: DashMap<TableIdentity, TableScanState>,
    flush_lock: tokio::sync::Mutex<()>,
    flush_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PositionStore {
    /// Open the checkpoint `name`, loading any persisted state
    ///
    /// A payload that cannot be decoded fails with
    /// [`Error::CorruptedPosition`]; it is never silently reset.
    pub async fn open(
        name: impl Into<String>,
        repo: Arc<dyn PositionRepo>,
        codec: Arc<dyn PositionCodec>,
        flush_interval: Duration,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let store = Self {
            name: name.clone(),
            repo,
            codec,
            flush_interval,
            header: RwLock::new(None),
            states: DashMap::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_task: Mutex::new(None),
        };

        if let Some(stored) = store.repo.get(&name).await? {
            let value = store
                .codec
                .decode(&stored.payload)
                .map_err(|e| Error::corrupted(&name, e.to_string()))?;
            *store.header.write() = Some(Header {
                start: value.start,
                updated_at: stored.updated_at,
            });
            for state in value.table_states.into_values() {
                store.states.insert(state.identity.clone(), state);
            }
            info!(
                "Loaded position {} ({} tables, started {})",
                name,
                store.states.len(),
                value.start
            );
        }

        Ok(Arc::new(store))
    }

    /// Checkpoint name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current checkpoint, or `None` when no position exists yet
    pub fn get(&self) -> Option<PositionSnapshot> {
        let header = (*self.header.read())?;
        Some(PositionSnapshot {
            name: self.name.clone(),
            updated_at: header.updated_at,
            value: self.value(header.start),
        })
    }

    /// Record the run start; a no-op when a position already exists
    pub fn record_start(&self, start: DateTime<Utc>) {
        let mut header = self.header.write();
        if header.is_none() {
            *header = Some(Header {
                start,
                updated_at: start,
            });
        }
    }

    /// State of one table
    pub fn table_state(&self, identity: &TableIdentity) -> Option<TableScanState> {
        self.states.get(identity).map(|s| s.value().clone())
    }

    /// Replace the state of one table
    ///
    /// Rejects a cursor that moves backwards, a shrinking row count and a
    /// change of scan columns.
    pub fn put(&self, state: TableScanState) -> Result<()> {
        match self.states.entry(state.identity.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                check_progress(entry.get(), &state)?;
                entry.insert(state);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(state);
            }
        }

        let now = Utc::now();
        let mut header = self.header.write();
        match header.as_mut() {
            Some(h) => h.updated_at = now,
            None => {
                *header = Some(Header {
                    start: now,
                    updated_at: now,
                })
            }
        }
        Ok(())
    }

    /// Whether every known table is done
    pub fn all_done(&self) -> bool {
        self.states.iter().all(|s| s.done)
    }

    /// Write the latest snapshot to the repo
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let Some(snapshot) = self.get() else {
            return Ok(());
        };

        let payload = self.codec.encode(&snapshot.value)?;
        let stored = StoredPosition {
            name: self.name.clone(),
            updated_at: snapshot.updated_at,
            payload,
        };
        self.repo.put(&self.name, &stored).await?;
        debug!(
            "Flushed position {} ({} tables)",
            self.name,
            snapshot.value.table_states.len()
        );
        Ok(())
    }

    /// Start flushing every `flush_interval`
    ///
    /// Failed flushes are logged and retried on the next tick. Calling this
    /// again while a task is running does nothing.
    pub fn start_flush_task(self: &Arc<Self>) {
        let mut slot = self.flush_task.lock();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let weak = Arc::downgrade(self);
        let interval = self.flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = weak.upgrade() else { break };
                        if let Err(e) = store.flush().await {
                            warn!("Position flush failed for {}: {}", store.name, e);
                        }
                    }
                }
            }
        });
        *slot = Some((token, handle));
    }

    /// Stop the flush task and write a final snapshot
    pub async fn close(&self) -> Result<()> {
        let task = self.flush_task.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Position flush task for {} ended abnormally: {}", self.name, e);
            }
        }
        self.flush().await
    }

    /// Remove the whole checkpoint, in memory and durably
    ///
    /// Refused while any table is not done.
    pub async fn purge(&self) -> Result<()> {
        let pending: Vec<String> = self
            .states
            .iter()
            .filter(|s| !s.done)
            .map(|s| s.key().to_string())
            .collect();
        if !pending.is_empty() {
            return Err(Error::position(format!(
                "cannot purge {}: {} table(s) not done ({})",
                self.name,
                pending.len(),
                pending.join(", ")
            )));
        }

        let _guard = self.flush_lock.lock().await;
        self.repo.delete(&self.name).await?;
        self.states.clear();
        *self.header.write() = None;
        info!("Purged position {}", self.name);
        Ok(())
    }

    fn value(&self, start: DateTime<Utc>) -> BatchPositionValueV1 {
        let table_states: BTreeMap<String, TableScanState> = self
            .states
            .iter()
            .map(|s| (s.key().to_string(), s.value().clone()))
            .collect();
        BatchPositionValueV1 {
            start,
            table_states,
        }
    }
}

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStore")
            .field("name", &self.name)
            .field("tables", &self.states.len())
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

fn check_progress(previous: &TableScanState, next: &TableScanState) -> Result<()> {
    if previous.scan_columns != next.scan_columns {
        return Err(Error::position(format!(
            "scan columns of {} changed from {} to {}",
            next.identity, previous.scan_columns, next.scan_columns
        )));
    }
    if next.rows_scanned < previous.rows_scanned {
        return Err(Error::position(format!(
            "row count of {} moved backwards ({} -> {})",
            next.identity, previous.rows_scanned, next.rows_scanned
        )));
    }
    match (&previous.current, &next.current) {
        (Some(_), None) => Err(Error::position(format!(
            "cursor of {} was cleared",
            next.identity
        ))),
        (Some(prev), Some(cur)) if cur.regresses_from(prev)? => Err(Error::position(format!(
            "cursor of {} moved backwards ({} -> {})",
            next.identity, prev, cur
        ))),
        _ => Ok(()),
    }
}

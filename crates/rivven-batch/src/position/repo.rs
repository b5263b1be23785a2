//! Durable checkpoint backends
//!
//! A repo stores opaque encoded payloads by name. The file repo writes one
//! JSON document per name with temp-file + rename so a crash never leaves a
//! half-written checkpoint behind. The MySQL repo keeps checkpoints in a
//! table of the source database, one row per name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::dialect::{MySqlDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::types::Value;

/// A persisted checkpoint payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPosition {
    /// Checkpoint name
    pub name: String,
    /// Write time
    pub updated_at: DateTime<Utc>,
    /// Codec output
    pub payload: String,
}

/// Backing store for checkpoints
#[async_trait]
pub trait PositionRepo: Send + Sync {
    /// Load a checkpoint
    async fn get(&self, name: &str) -> Result<Option<StoredPosition>>;

    /// Store a checkpoint, replacing any previous one
    async fn put(&self, name: &str, position: &StoredPosition) -> Result<()>;

    /// Delete a checkpoint; deleting a missing one is not an error
    async fn delete(&self, name: &str) -> Result<()>;
}

/// In-memory repo (for testing or ephemeral runs)
#[derive(Debug, Default)]
pub struct MemoryPositionRepo {
    positions: Mutex<HashMap<String, StoredPosition>>,
    writes: AtomicU64,
}

impl MemoryPositionRepo {
    /// Create an empty repo
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PositionRepo for MemoryPositionRepo {
    async fn get(&self, name: &str) -> Result<Option<StoredPosition>> {
        Ok(self.positions.lock().get(name).cloned())
    }

    async fn put(&self, name: &str, position: &StoredPosition) -> Result<()> {
        self.positions
            .lock()
            .insert(name.to_string(), position.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.positions.lock().remove(name);
        Ok(())
    }
}

/// File-based repo: `<dir>/<name>.json`
#[derive(Debug, Clone)]
pub struct FilePositionRepo {
    base_dir: PathBuf,
    fsync: bool,
}

impl FilePositionRepo {
    /// Create a repo under `base_dir`, creating the directory if needed
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create a repo with explicit fsync behavior
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir, fsync })
    }

    fn file_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(Error::config(format!("invalid position name '{}'", name)));
        }
        Ok(self.base_dir.join(format!("{}.json", name)))
    }
}

#[async_trait]
impl PositionRepo for FilePositionRepo {
    async fn get(&self, name: &str) -> Result<Option<StoredPosition>> {
        let path = self.file_path(name)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| Error::corrupted(name, e.to_string()))
    }

    async fn put(&self, name: &str, position: &StoredPosition) -> Result<()> {
        let path = self.file_path(name)?;
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(position)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &path).await?;
        debug!("Saved position {} to {}", name, path.display());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.file_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted position {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Default checkpoint table of [`MySqlPositionRepo`]
pub const DEFAULT_POSITION_TABLE: &str = "_rivven_batch_positions";

/// MySQL-backed repo
///
/// Stores one row per checkpoint name:
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS _rivven_batch_positions (
///     name VARCHAR(255) NOT NULL PRIMARY KEY,
///     payload LONGTEXT NOT NULL,
///     updated_at BIGINT NOT NULL
/// )
/// ```
///
/// `updated_at` holds milliseconds since the Unix epoch. Any [`Connection`]
/// that speaks MySQL works, usually the scan's own `MySqlConnection`.
pub struct MySqlPositionRepo {
    conn: Arc<dyn Connection>,
    table: String,
}

impl MySqlPositionRepo {
    /// Create a repo, creating its table if it does not exist
    pub async fn new(conn: Arc<dyn Connection>, table_name: Option<&str>) -> Result<Self> {
        let table_name = table_name.unwrap_or(DEFAULT_POSITION_TABLE);
        if table_name.is_empty() {
            return Err(Error::config("position table name is empty"));
        }
        let repo = Self {
            conn,
            table: MySqlDialect.quote_identifier(table_name),
        };
        repo.ensure_table().await?;
        Ok(repo)
    }

    async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                name VARCHAR(255) NOT NULL PRIMARY KEY, \
                payload LONGTEXT NOT NULL, \
                updated_at BIGINT NOT NULL\
            )",
            self.table
        );
        self.conn
            .query(&sql, &[])
            .await
            .map_err(|e| Error::config(format!("Failed to create position table: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl PositionRepo for MySqlPositionRepo {
    async fn get(&self, name: &str) -> Result<Option<StoredPosition>> {
        let sql = format!(
            "SELECT payload, updated_at FROM {} WHERE name = ?",
            self.table
        );
        let row = self
            .conn
            .query_one(&sql, &[Value::from(name)])
            .await
            .map_err(|e| Error::position(format!("Failed to load position '{}': {}", name, e)))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let payload = row
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::corrupted(name, "payload is not text"))?
            .to_string();
        let updated_at = row
            .get(1)
            .and_then(Value::as_i64)
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| Error::corrupted(name, "updated_at is not a timestamp"))?;

        Ok(Some(StoredPosition {
            name: name.to_string(),
            updated_at,
            payload,
        }))
    }

    async fn put(&self, name: &str, position: &StoredPosition) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (name, payload, updated_at) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE payload = VALUES(payload), updated_at = VALUES(updated_at)",
            self.table
        );
        let params = [
            Value::from(name),
            Value::from(position.payload.as_str()),
            Value::Int64(position.updated_at.timestamp_millis()),
        ];
        self.conn
            .query(&sql, &params)
            .await
            .map_err(|e| Error::position(format!("Failed to save position '{}': {}", name, e)))?;
        debug!("Saved position {} to table {}", name, self.table);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE name = ?", self.table);
        self.conn
            .query(&sql, &[Value::from(name)])
            .await
            .map_err(|e| Error::position(format!("Failed to delete position '{}': {}", name, e)))?;
        info!("Deleted position {}", name);
        Ok(())
    }
}

//! End-to-end batch run
//!
//! Wires the pieces together in order: resolve tables, drop empty ones, open
//! the checkpoint, seed the run and every table's bounds, scan, close the
//! checkpoint.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BatchConfig;
use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::emitter::MessageSubmitter;
use crate::error::Result;
use crate::key_selector::{delete_empty_tables, resolve_tables};
use crate::position::{
    seed_table_positions, setup_initial_position, PositionCodec, PositionRepo, PositionStore,
};
use crate::schema::SchemaProvider;
use crate::scanner::{ScanReport, ScannerOptions, TableScanner};

/// Runs one full batch extraction
pub struct BatchRunner {
    config: BatchConfig,
    conn: Arc<dyn Connection>,
    dialect: Arc<dyn SqlDialect>,
    schema: Arc<dyn SchemaProvider>,
    repo: Arc<dyn PositionRepo>,
    codec: Arc<dyn PositionCodec>,
    submitter: Arc<dyn MessageSubmitter>,
    cancel: CancellationToken,
}

impl BatchRunner {
    /// Create a runner; the config is validated and defaulted here
    pub fn new(
        mut config: BatchConfig,
        conn: Arc<dyn Connection>,
        dialect: Arc<dyn SqlDialect>,
        schema: Arc<dyn SchemaProvider>,
        repo: Arc<dyn PositionRepo>,
        codec: Arc<dyn PositionCodec>,
        submitter: Arc<dyn MessageSubmitter>,
    ) -> Result<Self> {
        config.validate_and_set_default()?;
        Ok(Self {
            config,
            conn,
            dialect,
            schema,
            repo,
            codec,
            submitter,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the run when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Effective configuration
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Scan every configured table to completion
    ///
    /// The checkpoint is flushed on close whatever the outcome, so a failed
    /// or cancelled run resumes where it stopped.
    pub async fn run(self) -> Result<ScanReport> {
        let works = resolve_tables(self.schema.as_ref(), &self.config.table_configs).await?;
        let works = delete_empty_tables(self.conn.as_ref(), self.dialect.as_ref(), works).await?;
        info!(
            source = ?self.config.source,
            tables = works.len(),
            "Resolved tables for batch scan"
        );

        let store = PositionStore::open(
            self.config.position_name.clone(),
            self.repo.clone(),
            self.codec.clone(),
            self.config.position_flush_interval(),
        )
        .await?;
        setup_initial_position(&store).await?;
        seed_table_positions(self.conn.as_ref(), self.dialect.as_ref(), &store, &works).await?;
        store.start_flush_task();

        let scanner = TableScanner::new(
            self.conn.clone(),
            self.dialect.clone(),
            store.clone(),
            self.submitter.clone(),
            ScannerOptions::from(&self.config),
        );
        let scanner_cancel = scanner.cancel_token();
        let run_cancel = self.cancel.clone();
        let forward = tokio::spawn(async move {
            run_cancel.cancelled().await;
            scanner_cancel.cancel();
        });

        let report = scanner.start(works).join().await;
        forward.abort();

        if let Err(e) = store.close().await {
            warn!("Final position flush failed: {}", e);
            return Err(e);
        }
        report.into_result()
    }
}

//! Row emission and the completion handshake
//!
//! Every row becomes a [`ChangeMessage`] handed to a [`MessageSubmitter`].
//! The consumer resolves each message exactly once, usually through
//! [`ChangeMessage::commit`], which runs the after-commit callback and then
//! completes the signal. The scanner only advances its checkpoint after every
//! message of a batch has been completed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Row, TableIdentity};

/// Kind of change a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A row read by a full-table scan
    RowDump,
}

/// Runs once the consumer has committed the message
pub type AfterCommitCallback = Box<dyn FnOnce() + Send + 'static>;

type Outcome = std::result::Result<(), String>;

/// Producer side of the completion handshake, resolved at most once
#[derive(Debug)]
pub struct CompletionSignal {
    tx: oneshot::Sender<Outcome>,
}

impl CompletionSignal {
    /// Create a connected signal and completion
    pub fn pair(table: TableIdentity) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, Completion { table, rx })
    }

    /// Mark the message as processed
    pub fn complete(self) {
        let _ = self.tx.send(Ok(()));
    }

    /// Mark the message as failed
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(reason.into()));
    }
}

/// Waiting side of the completion handshake
#[derive(Debug)]
pub struct Completion {
    table: TableIdentity,
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    /// Wait for the consumer to resolve the message
    ///
    /// A signal dropped unresolved or a failed message is an
    /// [`Error::Emit`]; running past `timeout` is an [`Error::Timeout`].
    pub async fn wait(self, timeout: Option<Duration>) -> Result<()> {
        let table = self.table;
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx)
                .await
                .map_err(|_| {
                    Error::timeout(format!(
                        "message for {} not completed within {:?}",
                        table, limit
                    ))
                })?,
            None => self.rx.await,
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(Error::emit(format!(
                "message for {} failed: {}",
                table, reason
            ))),
            Err(_) => Err(Error::emit(format!(
                "completion signal for {} dropped",
                table
            ))),
        }
    }
}

/// One emitted row
pub struct ChangeMessage {
    /// Source table
    pub table: TableIdentity,
    /// Change kind
    pub kind: MessageKind,
    /// Row payload
    pub row: Row,
    /// Creation time
    pub created_at: DateTime<Utc>,
    after_commit: Option<AfterCommitCallback>,
    signal: Option<CompletionSignal>,
}

impl ChangeMessage {
    /// Create a row-dump message and the completion to wait on
    pub fn row_dump(table: TableIdentity, row: Row) -> (Self, Completion) {
        let (signal, completion) = CompletionSignal::pair(table.clone());
        let message = Self {
            table,
            kind: MessageKind::RowDump,
            row,
            created_at: Utc::now(),
            after_commit: None,
            signal: Some(signal),
        };
        (message, completion)
    }

    /// Attach an after-commit callback
    pub fn with_after_commit(mut self, callback: AfterCommitCallback) -> Self {
        self.after_commit = Some(callback);
        self
    }

    /// Run the after-commit callback, if any; returns whether one ran
    pub fn run_after_commit(&mut self) -> bool {
        match self.after_commit.take() {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Resolve the message as processed; later calls do nothing
    pub fn complete(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.complete();
        }
    }

    /// Resolve the message as failed; later calls do nothing
    pub fn fail(&mut self, reason: impl Into<String>) {
        if let Some(signal) = self.signal.take() {
            signal.fail(reason);
        }
    }

    /// Run the after-commit callback, then complete
    pub fn commit(mut self) {
        self.run_after_commit();
        self.complete();
    }
}

impl std::fmt::Debug for ChangeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeMessage")
            .field("table", &self.table)
            .field("kind", &self.kind)
            .field("row", &self.row)
            .field("created_at", &self.created_at)
            .field("after_commit", &self.after_commit.is_some())
            .field("resolved", &self.signal.is_none())
            .finish()
    }
}

/// Downstream consumer of change messages
#[async_trait]
pub trait MessageSubmitter: Send + Sync {
    /// Accept a message; the consumer must resolve it exactly once
    async fn submit(&self, message: ChangeMessage) -> Result<()>;
}

/// Submits batches and waits for their completion
pub struct Emitter {
    submitter: Arc<dyn MessageSubmitter>,
    completion_timeout: Option<Duration>,
    rows_committed: Arc<AtomicU64>,
}

impl Emitter {
    /// Create an emitter
    pub fn new(submitter: Arc<dyn MessageSubmitter>, completion_timeout: Option<Duration>) -> Self {
        Self {
            submitter,
            completion_timeout,
            rows_committed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Rows whose after-commit callback has run
    pub fn rows_committed(&self) -> u64 {
        self.rows_committed.load(Ordering::Relaxed)
    }

    /// Submit every row of a batch, then wait until all are completed
    pub async fn emit_batch(&self, table: &TableIdentity, rows: Vec<Row>) -> Result<()> {
        let count = rows.len();
        let mut completions = Vec::with_capacity(count);
        for row in rows {
            let committed = self.rows_committed.clone();
            let (message, completion) = ChangeMessage::row_dump(table.clone(), row);
            let message = message.with_after_commit(Box::new(move || {
                committed.fetch_add(1, Ordering::Relaxed);
            }));
            self.submitter.submit(message).await?;
            completions.push(completion.wait(self.completion_timeout));
        }

        try_join_all(completions).await?;
        debug!(table = %table, rows = count, "Batch completed downstream");
        Ok(())
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("completion_timeout", &self.completion_timeout)
            .field("rows_committed", &self.rows_committed())
            .finish()
    }
}

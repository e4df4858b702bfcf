//! The operation manager (spec.md §4.7): named long-running operations with
//! status, progress, structured log lines, cancellation, timeout, and
//! retention. Grounded on the teacher's `ImportStatus`/`ImportOperationStatus`
//! state machine in `bae-core/src/db/models.rs`, generalised with an
//! explicit `CancellationToken` parameter per SPEC_FULL.md §9 "Cancellation
//! discipline" rather than pulling cancellation from ambient state.

use crate::models::{LogLevel, Operation, OperationLogLine, OperationStatus, OperationType};
use crate::store::{Store, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("operation not found: {0}")]
    NotFound(String),
    #[error("operation is already terminal")]
    AlreadyTerminal,
}

/// A handle returned by `start`, pairing the Operation id with the
/// cancellation token workers must poll between units of work.
pub struct OperationHandle {
    pub id: String,
    pub cancellation: CancellationToken,
}

/// Owns operation lifecycle, persistence, and retention (spec.md §4.7).
pub struct OperationManager {
    store: Arc<dyn Store>,
    tokens: std::sync::Mutex<std::collections::HashMap<String, CancellationToken>>,
    timeout_minutes: u32,
    retention_hours: u32,
}

impl OperationManager {
    pub fn new(store: Arc<dyn Store>, timeout_minutes: u32, retention_hours: u32) -> Self {
        OperationManager {
            store,
            tokens: std::sync::Mutex::new(std::collections::HashMap::new()),
            timeout_minutes,
            retention_hours,
        }
    }

    /// Creates a new operation in `pending` state and registers its
    /// cancellation token. The worker is expected to call `mark_running`
    /// once it actually starts.
    pub async fn start(
        &self,
        operation_type: OperationType,
        folder_path: Option<String>,
    ) -> Result<OperationHandle, OperationError> {
        let operation = Operation::new(operation_type, folder_path);
        let id = operation.id.clone();
        self.store.put_operation(operation).await?;

        let token = CancellationToken::new();
        self.tokens.lock().unwrap().insert(id.clone(), token.clone());

        // Deadline enforcement: force-fail after timeout_minutes if the
        // worker never finalises (spec.md §4.7 "Timeout").
        let store = self.store.clone();
        let timeout_id = id.clone();
        let timeout_token = token.clone();
        let timeout = self.timeout_minutes;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(u64::from(timeout) * 60)).await;
            timeout_token.cancel();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            if let Ok(Some(op)) = store.get_operation(&timeout_id).await {
                if !op.status.is_terminal() {
                    let mut op = op;
                    op.status = OperationStatus::Failed;
                    op.error = Some("operation timed out".to_string());
                    op.updated_at = chrono::Utc::now();
                    warn!("operation {timeout_id} force-failed after timeout");
                    let _ = store.put_operation(op).await;
                }
            }
        });

        Ok(OperationHandle { id, cancellation: token })
    }

    pub async fn get(&self, id: &str) -> Result<Operation, OperationError> {
        self.store
            .get_operation(id)
            .await?
            .ok_or_else(|| OperationError::NotFound(id.to_string()))
    }

    pub async fn list_active(&self) -> Result<Vec<Operation>, OperationError> {
        Ok(self
            .store
            .list_operations()
            .await?
            .into_iter()
            .filter(|op| !op.status.is_terminal())
            .collect())
    }

    pub async fn list_all(&self) -> Result<Vec<Operation>, OperationError> {
        Ok(self.store.list_operations().await?)
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<Operation, OperationError>
    where
        F: FnOnce(&mut Operation),
    {
        let mut op = self.get(id).await?;
        if op.status.is_terminal() {
            return Err(OperationError::AlreadyTerminal);
        }
        f(&mut op);
        op.updated_at = chrono::Utc::now();
        self.store.put_operation(op.clone()).await?;
        Ok(op)
    }

    pub async fn mark_running(&self, id: &str) -> Result<Operation, OperationError> {
        self.mutate(id, |op| op.status = OperationStatus::Running).await
    }

    /// Updates `progress`/`total`, enforcing `progress <= total` (spec.md
    /// §3 invariant).
    pub async fn report_progress(&self, id: &str, progress: u64, total: u64) -> Result<Operation, OperationError> {
        self.mutate(id, |op| {
            op.total = total;
            op.progress = progress.min(total).max(op.progress);
        })
        .await
    }

    pub async fn log(&self, id: &str, level: LogLevel, message: impl Into<String>) -> Result<Operation, OperationError> {
        let message = message.into();
        match level {
            LogLevel::Error => warn!("operation {id}: {message}"),
            LogLevel::Warn => warn!("operation {id}: {message}"),
            LogLevel::Info => info!("operation {id}: {message}"),
        }
        self.mutate(id, |op| {
            op.log_lines.push(OperationLogLine {
                level,
                message,
                at: chrono::Utc::now(),
            });
        })
        .await
    }

    pub async fn complete(&self, id: &str, message: Option<String>) -> Result<Operation, OperationError> {
        let result = self.mutate(id, |op| {
            op.status = OperationStatus::Completed;
            op.message = message;
        })
        .await;
        self.tokens.lock().unwrap().remove(id);
        result
    }

    pub async fn fail(&self, id: &str, error: impl Into<String>) -> Result<Operation, OperationError> {
        let error = error.into();
        let result = self.mutate(id, |op| {
            op.status = OperationStatus::Failed;
            op.error = Some(error);
        })
        .await;
        self.tokens.lock().unwrap().remove(id);
        result
    }

    /// `Cancel(id)`: flips the per-operation flag; the worker is required
    /// to poll between work units. Idempotent -- an already-terminal
    /// operation ignores further cancel requests (spec.md §4.7, §5).
    pub async fn cancel(&self, id: &str) -> Result<(), OperationError> {
        let op = self.get(id).await?;
        if op.status.is_terminal() {
            return Ok(());
        }
        if let Some(token) = self.tokens.lock().unwrap().get(id) {
            token.cancel();
        }
        Ok(())
    }

    /// Called by a worker once it has observed cancellation and stopped
    /// starting new work units.
    pub async fn finalize_cancelled(&self, id: &str) -> Result<Operation, OperationError> {
        let result = self.mutate(id, |op| op.status = OperationStatus::Cancelled).await;
        self.tokens.lock().unwrap().remove(id);
        result
    }

    /// Evicts completed operations older than the retention window
    /// (spec.md §4.7 "Retention"). Log lines share their parent's lifetime
    /// and are deleted along with the Operation row.
    pub async fn evict_expired(&self) -> Result<u64, OperationError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(i64::from(self.retention_hours));
        let mut evicted = 0;
        for op in self.store.list_operations().await? {
            if op.status.is_terminal() && op.updated_at < cutoff {
                self.store.delete_operation(&op.id).await?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

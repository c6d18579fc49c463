//! The batch upsert loop shared by every adapter. Adapters supply only an open
//! transaction that knows its dialect's upsert statement.

use std::future::Future;

use async_trait::async_trait;
use mgnrega_core::CanonicalRecord;
use tracing::{debug, warn};

use crate::{Backend, StorageError, UpsertOutcome};

#[async_trait]
pub(crate) trait BatchTransaction: Send + Sized {
    async fn apply(&mut self, record: &CanonicalRecord) -> Result<(), sqlx::Error>;

    async fn commit(self) -> Result<(), sqlx::Error>;

    async fn rollback(self) -> Result<(), sqlx::Error>;
}

/// Applies `records` in input order inside one transaction. The first failing
/// row rolls everything back.
pub(crate) async fn upsert_batch<T, F, Fut>(
    backend: Backend,
    records: &[CanonicalRecord],
    begin: F,
) -> Result<UpsertOutcome, StorageError>
where
    T: BatchTransaction,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, sqlx::Error>> + Send,
{
    if records.is_empty() {
        return Ok(UpsertOutcome::default());
    }

    let mut tx = begin().await.map_err(StorageError::Unavailable)?;
    for (index, record) in records.iter().enumerate() {
        if let Err(source) = tx.apply(record).await {
            if let Err(err) = tx.rollback().await {
                debug!(backend = backend.as_str(), error = %err, "rollback after failed row");
            }
            return Err(row_failure(backend, index, source));
        }
    }
    tx.commit().await.map_err(StorageError::Unavailable)?;

    debug!(backend = backend.as_str(), written = records.len(), "upsert batch committed");
    Ok(UpsertOutcome {
        written: records.len(),
    })
}

/// Only errors raised by the database itself blame the row; lost connections
/// and pool timeouts mean storage is unavailable.
fn row_failure(backend: Backend, index: usize, source: sqlx::Error) -> StorageError {
    match source {
        sqlx::Error::Database(_) => {
            warn!(backend = backend.as_str(), index, error = %source, "upsert row rejected; batch rolled back");
            StorageError::RowRejected { index, source }
        }
        other => {
            warn!(backend = backend.as_str(), index, error = %other, "storage lost mid-batch; batch rolled back");
            StorageError::Unavailable(other)
        }
    }
}

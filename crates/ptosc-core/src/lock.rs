//! Migration lock coordination.
//!
//! The lock is a single row with an `is_locked` flag. Acquisition opens a
//! transaction, reads the row `FOR UPDATE` and flips the flag 0 to 1 with a
//! compare-and-set. The transaction stays open until release, so a second
//! acquirer blocks on the row lock in the database rather than polling, and
//! a committed flag of 1 can only come from an actor outside this protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::db::{quote_identifier, Database, Transaction};
use crate::error::{DbError, LockError};
use crate::options::{
    ValidatedOptions, DEFAULT_LOCK_TIMEOUT, DEFAULT_MIGRATIONS_LOCK_TABLE, DEFAULT_MIGRATIONS_TABLE,
};

/// Lock configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Change-log table; must exist.
    pub migrations_table: String,
    /// Table holding the lock row.
    pub lock_table: String,
    /// Deadline for the whole acquisition attempt.
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            lock_table: DEFAULT_MIGRATIONS_LOCK_TABLE.to_string(),
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl LockConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<&ValidatedOptions> for LockConfig {
    fn from(options: &ValidatedOptions) -> Self {
        Self {
            migrations_table: options.migrations_table.clone(),
            lock_table: options.migrations_lock_table.clone(),
            timeout: options.lock_timeout,
        }
    }
}

/// Acquires the migration lock.
pub struct LockCoordinator {
    db: Arc<dyn Database>,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(db: Arc<dyn Database>, config: LockConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire the lock.
    ///
    /// Fails at once with [`LockError::MissingTable`] if either table is
    /// absent. On timeout the transaction is rolled back, leaving the flag
    /// as it was.
    pub async fn acquire(&self) -> Result<LockHandle, LockError> {
        let lock_table = &self.config.lock_table;
        let (migrations, lock) = tokio::join!(
            self.db.table_exists(&self.config.migrations_table),
            self.db.table_exists(lock_table),
        );
        let (migrations, lock) = (
            migrations.map_err(|e| self.db_error(e))?,
            lock.map_err(|e| self.db_error(e))?,
        );
        if !migrations || !lock {
            return Err(LockError::MissingTable {
                migrations_table: self.config.migrations_table.clone(),
                lock_table: lock_table.clone(),
            });
        }

        let deadline = Instant::now() + self.config.timeout;
        let mut trx = match timeout_at(deadline, self.db.begin()).await {
            Ok(trx) => trx.map_err(|e| self.db_error(e))?,
            Err(_) => return Err(self.timeout_error()),
        };

        let quoted = quote_identifier(lock_table);
        let outcome = timeout_at(deadline, claim(&mut *trx, &quoted, lock_table)).await;
        match outcome {
            Ok(Ok(())) => {
                info!(table = %lock_table, "migration lock acquired");
                Ok(LockHandle {
                    table: lock_table.clone(),
                    quoted,
                    trx: Some(trx),
                })
            }
            Ok(Err(e)) => {
                rollback_logged(trx, lock_table).await;
                Err(e)
            }
            Err(_) => {
                warn!(table = %lock_table, timeout_ms = self.config.timeout.as_millis() as u64, "timed out acquiring migration lock");
                rollback_logged(trx, lock_table).await;
                Err(self.timeout_error())
            }
        }
    }

    fn db_error(&self, source: DbError) -> LockError {
        LockError::UnderlyingDb {
            table: self.config.lock_table.clone(),
            source,
        }
    }

    fn timeout_error(&self) -> LockError {
        LockError::Timeout {
            table: self.config.lock_table.clone(),
            timeout_ms: self.config.timeout.as_millis() as u64,
        }
    }
}

async fn claim(trx: &mut dyn Transaction, quoted: &str, table: &str) -> Result<(), LockError> {
    let db_error = |source| LockError::UnderlyingDb {
        table: table.to_string(),
        source,
    };

    let rows = trx
        .query(&format!("SELECT is_locked FROM {quoted} LIMIT 1 FOR UPDATE"), &[])
        .await
        .map_err(db_error)?;
    let row = rows.first().ok_or_else(|| LockError::MissingRow {
        table: table.to_string(),
    })?;
    let held = row
        .get("is_locked")
        .and_then(|v| v.as_flag())
        .unwrap_or(false);
    if held {
        return Err(LockError::AlreadyHeld {
            table: table.to_string(),
        });
    }

    let updated = trx
        .execute(&format!("UPDATE {quoted} SET is_locked = 1 WHERE is_locked = 0"), &[])
        .await
        .map_err(db_error)?;
    if updated == 0 {
        return Err(db_error(DbError::new("lock row changed while held FOR UPDATE")));
    }
    debug!(table, "lock flag set");
    Ok(())
}

async fn rollback_logged(trx: Box<dyn Transaction>, table: &str) {
    if let Err(e) = trx.rollback().await {
        error!(table, error = %e, "failed to roll back migration lock transaction");
    }
}

/// A held migration lock.
///
/// Release explicitly with [`release`](Self::release) or
/// [`release_with_rollback`](Self::release_with_rollback). Both are
/// idempotent. Dropping a held handle drops the transaction, which the
/// backend rolls back.
pub struct LockHandle {
    table: String,
    quoted: String,
    trx: Option<Box<dyn Transaction>>,
}

impl LockHandle {
    /// Whether the lock is still held by this handle.
    pub fn is_held(&self) -> bool {
        self.trx.is_some()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Clear the flag and commit.
    ///
    /// If the update fails the transaction is rolled back, which also
    /// restores the flag, and the error is returned.
    pub async fn release(&mut self) -> Result<(), LockError> {
        let Some(mut trx) = self.trx.take() else {
            return Ok(());
        };

        let sql = format!("UPDATE {} SET is_locked = 0", self.quoted);
        if let Err(source) = trx.execute(&sql, &[]).await {
            error!(table = %self.table, error = %source, "failed to clear migration lock flag, rolling back");
            rollback_logged(trx, &self.table).await;
            return Err(LockError::UnderlyingDb {
                table: self.table.clone(),
                source,
            });
        }

        // A failed commit is rolled back by the backend, restoring the flag.
        trx.commit().await.map_err(|source| {
            error!(table = %self.table, error = %source, "failed to commit migration lock release, rolled back");
            LockError::UnderlyingDb {
                table: self.table.clone(),
                source,
            }
        })?;
        info!(table = %self.table, "migration lock released");
        Ok(())
    }

    /// Roll the lock transaction back without touching the flag.
    pub async fn release_with_rollback(&mut self) -> Result<(), LockError> {
        let Some(trx) = self.trx.take() else {
            return Ok(());
        };
        trx.rollback().await.map_err(|source| {
            error!(table = %self.table, error = %source, "failed to roll back migration lock");
            LockError::UnderlyingDb {
                table: self.table.clone(),
                source,
            }
        })?;
        info!(table = %self.table, "migration lock rolled back");
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.trx.is_some() {
            warn!(table = %self.table, "migration lock handle dropped while held");
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("table", &self.table)
            .field("held", &self.is_held())
            .finish()
    }
}

//! In-memory database backend.
//!
//! Understands exactly the statements the engine issues: the migration lock
//! reads and writes, the version and row-estimate lookups, and `ALTER TABLE`.
//! The lock row is guarded by an async mutex so `FOR UPDATE` blocks like a
//! real row lock, and flag writes only become visible on commit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use super::{ConnectionId, ConnectionInfo, Database, Row, SqlValue, Transaction};
use crate::error::DbError;

/// Default change-log table provisioned by [`MemoryDatabase::new`].
const MIGRATIONS_TABLE: &str = "knex_migrations";
/// Default lock table provisioned by [`MemoryDatabase::new`].
const MIGRATIONS_LOCK_TABLE: &str = "knex_migrations_lock";

struct Inner {
    id: ConnectionId,
    info: ConnectionInfo,
    tables: Mutex<HashSet<String>>,
    /// Committed lock flag. `None` means the lock table has no row.
    lock_flag: Mutex<Option<bool>>,
    row_lock: Arc<tokio::sync::Mutex<()>>,
    version: Mutex<Option<String>>,
    row_estimates: Mutex<HashMap<String, u64>>,
    row_estimate_error: Mutex<Option<DbError>>,
    alter_failures: Mutex<Vec<(String, DbError)>>,
    release_failure: Mutex<Option<DbError>>,
    commit_failure: Mutex<Option<DbError>>,
    claim_misses: Mutex<bool>,
    statements: Mutex<Vec<String>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// A shareable in-memory database.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl MemoryDatabase {
    /// Create a database with the default migration tables and an unlocked lock row.
    pub fn new(info: ConnectionInfo) -> Self {
        let db = Self::empty(info);
        db.add_table(MIGRATIONS_TABLE);
        db.add_table(MIGRATIONS_LOCK_TABLE);
        *db.inner.lock_flag.lock() = Some(false);
        db
    }

    /// Create a database with no tables and no lock row.
    pub fn empty(info: ConnectionInfo) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                info,
                tables: Mutex::new(HashSet::new()),
                lock_flag: Mutex::new(None),
                row_lock: Arc::new(tokio::sync::Mutex::new(())),
                version: Mutex::new(Some("8.0.36".to_string())),
                row_estimates: Mutex::new(HashMap::new()),
                row_estimate_error: Mutex::new(None),
                alter_failures: Mutex::new(Vec::new()),
                release_failure: Mutex::new(None),
                commit_failure: Mutex::new(None),
                claim_misses: Mutex::new(false),
                statements: Mutex::new(Vec::new()),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a table.
    pub fn add_table(&self, name: &str) {
        self.inner.tables.lock().insert(name.to_string());
    }

    /// Drop a table.
    pub fn remove_table(&self, name: &str) {
        self.inner.tables.lock().remove(name);
    }

    /// Overwrite the committed lock flag, as a non-cooperating actor would.
    pub fn set_lock_flag(&self, held: bool) {
        *self.inner.lock_flag.lock() = Some(held);
    }

    /// Delete the lock row.
    pub fn remove_lock_row(&self) {
        *self.inner.lock_flag.lock() = None;
    }

    /// The committed lock flag.
    pub fn lock_flag(&self) -> Option<bool> {
        *self.inner.lock_flag.lock()
    }

    /// Set the string returned by `SELECT VERSION()`. `None` makes the query fail.
    pub fn set_version(&self, version: Option<&str>) {
        *self.inner.version.lock() = version.map(str::to_string);
    }

    /// Set the catalog row estimate for a table.
    pub fn set_row_estimate(&self, table: &str, rows: u64) {
        self.inner.row_estimates.lock().insert(table.to_string(), rows);
    }

    /// Make row-estimate lookups fail.
    pub fn fail_row_estimate_with(&self, error: DbError) {
        *self.inner.row_estimate_error.lock() = Some(error);
    }

    /// Make every `ALTER TABLE` containing `fragment` fail with `error`.
    pub fn fail_alter_when(&self, fragment: &str, error: DbError) {
        self.inner
            .alter_failures
            .lock()
            .push((fragment.to_string(), error));
    }

    /// Make the next lock release update fail.
    pub fn fail_release_with(&self, error: DbError) {
        *self.inner.release_failure.lock() = Some(error);
    }

    /// Make the next commit fail.
    pub fn fail_commit_with(&self, error: DbError) {
        *self.inner.commit_failure.lock() = Some(error);
    }

    /// Make the next lock claim update zero rows, as if another session
    /// changed the row between the read and the write.
    pub fn fail_claim_with_zero_rows(&self) {
        *self.inner.claim_misses.lock() = true;
    }

    /// Every statement seen so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.inner.statements.lock().clone()
    }

    /// `ALTER TABLE` statements that completed successfully.
    pub fn executed_alters(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter_map(|s| s.strip_prefix("ok: ").map(str::to_string))
            .collect()
    }

    /// Number of `SELECT VERSION()` queries issued.
    pub fn version_queries(&self) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.starts_with("SELECT VERSION()"))
            .count()
    }

    /// Number of committed transactions.
    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Number of rolled back transactions.
    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    fn record(&self, sql: &str) {
        self.inner.statements.lock().push(sql.to_string());
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn connection_id(&self) -> ConnectionId {
        self.inner.id
    }

    fn connection_info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    async fn table_exists(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.inner.tables.lock().contains(name))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        Ok(Box::new(MemoryTransaction {
            db: self.clone(),
            row_guard: None,
            pending_flag: None,
            finished: false,
        }))
    }

    async fn raw_execute(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        self.record(sql);

        if sql.starts_with("SELECT VERSION()") {
            let version = self
                .inner
                .version
                .lock()
                .clone()
                .ok_or_else(|| DbError::new("version unavailable"))?;
            let mut row = Row::new();
            row.insert("version".to_string(), SqlValue::Text(version));
            return Ok(vec![row]);
        }

        if sql.starts_with("SELECT TABLE_ROWS FROM information_schema.tables") {
            if let Some(err) = self.inner.row_estimate_error.lock().clone() {
                return Err(err);
            }
            let table = params.get(1).and_then(SqlValue::as_str).unwrap_or_default();
            return Ok(self
                .inner
                .row_estimates
                .lock()
                .get(table)
                .map(|rows| {
                    let mut row = Row::new();
                    row.insert("TABLE_ROWS".to_string(), SqlValue::UInt(*rows));
                    vec![row]
                })
                .unwrap_or_default());
        }

        if sql.starts_with("ALTER TABLE") {
            let failure = self
                .inner
                .alter_failures
                .lock()
                .iter()
                .find(|(fragment, _)| sql.contains(fragment.as_str()))
                .map(|(_, err)| err.clone());
            if let Some(err) = failure {
                return Err(err);
            }
            self.record(&format!("ok: {sql}"));
            return Ok(Vec::new());
        }

        Err(DbError::new(format!("unsupported statement: {sql}")))
    }
}

struct MemoryTransaction {
    db: MemoryDatabase,
    row_guard: Option<OwnedMutexGuard<()>>,
    pending_flag: Option<bool>,
    finished: bool,
}

impl MemoryTransaction {
    fn current_flag(&self) -> Option<bool> {
        let committed = *self.db.inner.lock_flag.lock();
        committed.map(|flag| self.pending_flag.unwrap_or(flag))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn query(&mut self, sql: &str, _params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        self.db.record(sql);

        if !sql.starts_with("SELECT is_locked FROM") {
            return Err(DbError::new(format!("unsupported query: {sql}")));
        }
        if sql.ends_with("FOR UPDATE") && self.row_guard.is_none() {
            let lock = Arc::clone(&self.db.inner.row_lock);
            self.row_guard = Some(lock.lock_owned().await);
        }

        Ok(self
            .current_flag()
            .map(|flag| {
                let mut row = Row::new();
                row.insert("is_locked".to_string(), SqlValue::Int(flag as i64));
                vec![row]
            })
            .unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str, _params: &[SqlValue]) -> Result<u64, DbError> {
        self.db.record(sql);

        if sql.contains("SET is_locked = 1 WHERE is_locked = 0") {
            if std::mem::take(&mut *self.db.inner.claim_misses.lock()) {
                return Ok(0);
            }
            return Ok(match self.current_flag() {
                Some(false) => {
                    self.pending_flag = Some(true);
                    1
                }
                _ => 0,
            });
        }

        if sql.contains("SET is_locked = 0") {
            if let Some(err) = self.db.inner.release_failure.lock().take() {
                return Err(err);
            }
            return Ok(match self.current_flag() {
                Some(_) => {
                    self.pending_flag = Some(false);
                    1
                }
                None => 0,
            });
        }

        Err(DbError::new(format!("unsupported statement: {sql}")))
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        // a failed commit leaves `finished` unset, so the drop rolls back
        if let Some(err) = self.db.inner.commit_failure.lock().take() {
            return Err(err);
        }
        self.finished = true;
        if let Some(flag) = self.pending_flag {
            let mut committed = self.db.inner.lock_flag.lock();
            if committed.is_some() {
                *committed = Some(flag);
            }
        }
        self.db.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DbError> {
        self.finished = true;
        self.db.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.db.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> MemoryDatabase {
        MemoryDatabase::new(ConnectionInfo::new("testdb"))
    }

    #[tokio::test]
    async fn test_default_tables_exist() {
        let db = db();
        assert!(db.table_exists("knex_migrations").await.unwrap());
        assert!(db.table_exists("knex_migrations_lock").await.unwrap());
        assert!(!db.table_exists("widgets").await.unwrap());
        assert_eq!(db.lock_flag(), Some(false));
    }

    #[tokio::test]
    async fn test_flag_write_visible_only_after_commit() {
        let db = db();
        let mut trx = db.begin().await.unwrap();
        let updated = trx
            .execute("UPDATE `t` SET is_locked = 1 WHERE is_locked = 0", &[])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(db.lock_flag(), Some(false));
        trx.commit().await.unwrap();
        assert_eq!(db.lock_flag(), Some(true));
    }

    #[tokio::test]
    async fn test_rollback_discards_flag_write() {
        let db = db();
        let mut trx = db.begin().await.unwrap();
        trx.execute("UPDATE `t` SET is_locked = 1 WHERE is_locked = 0", &[])
            .await
            .unwrap();
        trx.rollback().await.unwrap();
        assert_eq!(db.lock_flag(), Some(false));
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_dropped_or_failed_commit_rolls_back() {
        let db = db();
        let mut trx = db.begin().await.unwrap();
        trx.execute("UPDATE `t` SET is_locked = 1 WHERE is_locked = 0", &[])
            .await
            .unwrap();
        db.fail_commit_with(DbError::new("commit failed"));
        assert!(trx.commit().await.is_err());
        assert_eq!(db.lock_flag(), Some(false));
        assert_eq!(db.rollbacks(), 1);

        drop(db.begin().await.unwrap());
        assert_eq!(db.rollbacks(), 2);
        assert_eq!(db.commits(), 0);
    }

    #[tokio::test]
    async fn test_for_update_blocks_second_reader() {
        let db = db();
        let mut first = db.begin().await.unwrap();
        first
            .query("SELECT is_locked FROM `t` LIMIT 1 FOR UPDATE", &[])
            .await
            .unwrap();

        let mut second = db.begin().await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            second.query("SELECT is_locked FROM `t` LIMIT 1 FOR UPDATE", &[]),
        )
        .await;
        assert!(blocked.is_err());

        first.commit().await.unwrap();
        let rows = second
            .query("SELECT is_locked FROM `t` LIMIT 1 FOR UPDATE", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_alter_failures_match_fragment() {
        let db = db();
        db.fail_alter_when("ALGORITHM=INSTANT", DbError::with_code(1846, "unsupported"));
        let err = db
            .raw_execute("ALTER TABLE `w` ADD COLUMN a INT, ALGORITHM=INSTANT", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(1846));
        db.raw_execute("ALTER TABLE `w` ADD COLUMN a INT", &[])
            .await
            .unwrap();
        assert_eq!(db.executed_alters(), vec!["ALTER TABLE `w` ADD COLUMN a INT"]);
    }
}

//! Execution path selection for ALTER clauses.
//!
//! Each clause is classified on its own, cheapest path first:
//!
//! 1. index-only clauses run directly, the storage engine builds them online
//! 2. tables below `ptoscMinRows` run directly
//! 3. `ALGORITHM=INSTANT` is attempted unless forced off or the server is too old
//! 4. everything else goes to pt-online-schema-change, dry run first
//!
//! An instant attempt that fails with a known "not supported in place"
//! signal falls through to the tool. Any other failure is fatal.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{EngineVersion, VersionCache};
use crate::db::{bare_table_name, quote_identifier, Database, SqlValue};
use crate::error::{DbError, Error, NativeAlterError};
use crate::options::ValidatedOptions;
use crate::process::{build_tool_args, Phase, ProcessSupervisor, Statistics, ToolInvocation, ToolTarget};
use crate::statement::is_index_only;

/// Errors from an instant ALTER that mean "use the copy tool instead".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FallbackSignals {
    /// Engine error numbers.
    pub codes: Vec<u32>,
    /// Case-insensitive message substrings.
    pub message_fragments: Vec<String>,
}

impl Default for FallbackSignals {
    fn default() -> Self {
        Self {
            // ER_ALTER_OPERATION_NOT_SUPPORTED, ..._REASON, and the 8.0.29+
            // instant row-version limit.
            codes: vec![1845, 1846, 4092],
            message_fragments: vec!["ALGORITHM=INSTANT is not supported".to_string()],
        }
    }
}

impl FallbackSignals {
    /// Whether a database error is a known in-place limitation.
    pub fn matches(&self, err: &DbError) -> bool {
        if err.code.is_some_and(|code| self.codes.contains(&code)) {
            return true;
        }
        let message = err.message.to_lowercase();
        self.message_fragments
            .iter()
            .any(|fragment| message.contains(&fragment.to_lowercase()))
    }
}

/// The execution path chosen for a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    NativeIndex,
    NativeSmallTable,
    NativeInstant,
    ExternalTool,
}

/// A clause to plan, with the table it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseTarget {
    /// Table identifier, possibly quoted or schema-qualified.
    pub table: String,
    pub clause: String,
}

impl ClauseTarget {
    pub fn new(table: impl Into<String>, clause: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            clause: clause.into(),
        }
    }
}

/// One planned step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub kind: StepKind,
    pub target: ClauseTarget,
}

/// Classifies and executes ALTER clauses for one request.
pub struct AlterPlanner {
    db: Arc<dyn Database>,
    supervisor: ProcessSupervisor,
    versions: Arc<VersionCache>,
    options: Arc<ValidatedOptions>,
}

impl AlterPlanner {
    pub fn new(
        db: Arc<dyn Database>,
        supervisor: ProcessSupervisor,
        versions: Arc<VersionCache>,
        options: Arc<ValidatedOptions>,
    ) -> Self {
        Self {
            db,
            supervisor,
            versions,
            options,
        }
    }

    /// Choose the execution path for a clause.
    pub async fn classify(&self, target: &ClauseTarget) -> Result<PlanStep, Error> {
        let kind = self.choose(target).await;
        debug!(table = %target.table, clause = %target.clause, kind = ?kind, "classified clause");
        Ok(PlanStep {
            kind,
            target: target.clone(),
        })
    }

    async fn choose(&self, target: &ClauseTarget) -> StepKind {
        if is_index_only(&target.clause) {
            return StepKind::NativeIndex;
        }

        if let Some(min_rows) = self.options.ptosc_min_rows {
            match self.estimate_rows(&target.table).await {
                Ok(Some(rows)) if rows < min_rows => return StepKind::NativeSmallTable,
                Ok(_) => {}
                Err(e) => debug!(table = %target.table, error = %e, "row estimate unavailable"),
            }
        }

        if self.options.force_ptosc {
            return StepKind::ExternalTool;
        }

        match self.engine_version().await {
            Ok(version) if !version.supports_instant() => {
                debug!(%version, "server has no instant ALTER");
                StepKind::ExternalTool
            }
            Ok(_) => StepKind::NativeInstant,
            Err(e) => {
                warn!(error = %e, "could not determine server version, attempting instant ALTER");
                StepKind::NativeInstant
            }
        }
    }

    /// Run a planned step. Returns the execute phase's statistics when the
    /// tool ran with statistics enabled and reported any.
    pub async fn execute(&self, step: PlanStep) -> Result<Option<Statistics>, Error> {
        let PlanStep { kind, target } = step;
        match kind {
            StepKind::NativeIndex | StepKind::NativeSmallTable => {
                info!(table = %target.table, kind = ?kind, "running ALTER directly");
                let sql = native_sql(&target, false);
                self.db
                    .raw_execute(&sql, &[])
                    .await
                    .map_err(|source| native_error(&target, sql, source))?;
                Ok(None)
            }
            StepKind::NativeInstant => {
                let sql = native_sql(&target, true);
                match self.db.raw_execute(&sql, &[]).await {
                    Ok(_) => {
                        info!(table = %target.table, "instant ALTER succeeded");
                        Ok(None)
                    }
                    Err(e) if self.options.fallback_signals.matches(&e) => {
                        info!(table = %target.table, error = %e, "instant ALTER not supported, using pt-online-schema-change");
                        self.run_tool(&target).await
                    }
                    Err(e) => Err(native_error(&target, sql, e).into()),
                }
            }
            StepKind::ExternalTool => self.run_tool(&target).await,
        }
    }

    /// Dry run, then execute.
    async fn run_tool(&self, target: &ClauseTarget) -> Result<Option<Statistics>, Error> {
        let program = self.supervisor.resolve_binary(&self.options.ptosc_path)?;
        let conn = self.db.connection_info();
        let table = bare_table_name(&target.table);
        let tool_target = ToolTarget {
            table: &table,
            clause: &target.clause,
        };
        let password = self
            .options
            .password
            .clone()
            .or_else(|| conn.password.clone());

        let invocation = |phase| {
            ToolInvocation::new(
                program.clone(),
                build_tool_args(tool_target, &self.options, conn, phase),
            )
            .with_password(password.clone())
            .with_max_buffer(self.options.max_buffer)
            .with_callbacks(self.options.on_progress.clone(), self.options.on_statistics.clone())
        };

        info!(table = %table, clause = %target.clause, "starting pt-online-schema-change dry run");
        self.supervisor.run(&invocation(Phase::DryRun)).await?;
        info!(table = %table, "dry run succeeded, executing");
        let result = self.supervisor.run(&invocation(Phase::Execute)).await?;

        Ok((self.options.statistics && !result.statistics.is_empty()).then_some(result.statistics))
    }

    async fn engine_version(&self) -> Result<EngineVersion, DbError> {
        let db = &self.db;
        self.versions
            .get_or_try_insert_async(db.connection_id(), || async move {
                let rows = db.raw_execute("SELECT VERSION() AS version", &[]).await?;
                let raw = rows
                    .first()
                    .and_then(|row| row.get("version"))
                    .and_then(SqlValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                EngineVersion::parse(&raw)
                    .ok_or_else(|| DbError::new(format!("unrecognized server version '{raw}'")))
            })
            .await
    }

    async fn estimate_rows(&self, table: &str) -> Result<Option<u64>, DbError> {
        let schema = self.db.connection_info().database.clone();
        let rows = self
            .db
            .raw_execute(
                "SELECT TABLE_ROWS FROM information_schema.tables WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                &[SqlValue::Text(schema), SqlValue::Text(bare_table_name(table))],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("TABLE_ROWS"))
            .and_then(SqlValue::as_u64))
    }
}

fn native_sql(target: &ClauseTarget, instant: bool) -> String {
    let table = quote_identifier(&target.table);
    if instant {
        format!("ALTER TABLE {table} {}, ALGORITHM=INSTANT", target.clause)
    } else {
        format!("ALTER TABLE {table} {}", target.clause)
    }
}

fn native_error(target: &ClauseTarget, statement: String, source: DbError) -> NativeAlterError {
    NativeAlterError {
        table: target.table.clone(),
        statement,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BinaryCache;
    use crate::db::{ConnectionInfo, MemoryDatabase};
    use crate::options::RawOptions;

    fn planner(db: &MemoryDatabase, options: RawOptions) -> AlterPlanner {
        AlterPlanner::new(
            Arc::new(db.clone()),
            ProcessSupervisor::new(
                Arc::new(crate::process::TokioSpawner),
                Arc::new(BinaryCache::new()),
            ),
            Arc::new(VersionCache::new()),
            Arc::new(options.normalize().unwrap()),
        )
    }

    fn db() -> MemoryDatabase {
        MemoryDatabase::new(ConnectionInfo::new("app"))
    }

    #[test]
    fn test_default_signals() {
        let signals = FallbackSignals::default();
        assert!(signals.matches(&DbError::with_code(1846, "ALGORITHM=INSTANT is not supported. Reason: ...")));
        assert!(signals.matches(&DbError::with_code(4092, "Maximum row versions reached")));
        assert!(signals.matches(&DbError::new("algorithm=instant is NOT supported for this operation")));
        assert!(!signals.matches(&DbError::with_code(1064, "syntax error near 'ALGORITHM=INSTANT'")));
        assert!(!signals.matches(&DbError::with_code(1146, "Table 'app.users' doesn't exist")));
    }

    #[tokio::test]
    async fn test_index_clause_is_native() {
        let db = db();
        let p = planner(&db, RawOptions::new());
        let step = p.classify(&ClauseTarget::new("users", "ADD INDEX idx (a)")).await.unwrap();
        assert_eq!(step.kind, StepKind::NativeIndex);
        assert_eq!(db.version_queries(), 0);
        assert_eq!(p.execute(step).await.unwrap(), None);
        assert_eq!(db.executed_alters(), vec!["ALTER TABLE `users` ADD INDEX idx (a)"]);
    }

    #[tokio::test]
    async fn test_small_table_runs_directly() {
        let db = db();
        db.set_row_estimate("users", 10);
        let p = planner(&db, RawOptions::new().with_ptosc_min_rows(1000));
        let step = p.classify(&ClauseTarget::new("users", "ADD COLUMN a INT")).await.unwrap();
        assert_eq!(step.kind, StepKind::NativeSmallTable);
    }

    #[tokio::test]
    async fn test_row_estimate_failure_falls_through() {
        let db = db();
        db.fail_row_estimate_with(DbError::new("denied"));
        let p = planner(&db, RawOptions::new().with_ptosc_min_rows(1000));
        let step = p.classify(&ClauseTarget::new("users", "ADD COLUMN a INT")).await.unwrap();
        assert_eq!(step.kind, StepKind::NativeInstant);
    }

    #[tokio::test]
    async fn test_old_server_skips_instant_and_version_is_cached() {
        let db = db();
        db.set_version(Some("5.7.42-log"));
        let p = planner(&db, RawOptions::new());
        for _ in 0..3 {
            let step = p.classify(&ClauseTarget::new("users", "ADD COLUMN a INT")).await.unwrap();
            assert_eq!(step.kind, StepKind::ExternalTool);
        }
        assert_eq!(db.version_queries(), 1);
    }

    #[tokio::test]
    async fn test_force_ptosc_skips_instant() {
        let db = db();
        let p = planner(&db, RawOptions::new().with_force_ptosc(true));
        let step = p.classify(&ClauseTarget::new("users", "ADD COLUMN a INT")).await.unwrap();
        assert_eq!(step.kind, StepKind::ExternalTool);
        assert_eq!(db.version_queries(), 0);
    }

    #[tokio::test]
    async fn test_unknown_version_attempts_instant() {
        let db = db();
        db.set_version(None);
        let p = planner(&db, RawOptions::new());
        let step = p.classify(&ClauseTarget::new("users", "ADD COLUMN a INT")).await.unwrap();
        assert_eq!(step.kind, StepKind::NativeInstant);
    }

    #[tokio::test]
    async fn test_instant_success_and_fatal_error() {
        let db = db();
        let p = planner(&db, RawOptions::new());
        let step = PlanStep {
            kind: StepKind::NativeInstant,
            target: ClauseTarget::new("users", "ADD COLUMN a INT"),
        };
        assert_eq!(p.execute(step.clone()).await.unwrap(), None);
        assert_eq!(
            db.executed_alters(),
            vec!["ALTER TABLE `users` ADD COLUMN a INT, ALGORITHM=INSTANT"]
        );

        db.fail_alter_when("ADD COLUMN b", DbError::with_code(1054, "Unknown column"));
        let err = p
            .execute(PlanStep {
                kind: StepKind::NativeInstant,
                target: ClauseTarget::new("users", "ADD COLUMN b INT AFTER nope"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NativeAlter(NativeAlterError { .. })));
    }

    #[tokio::test]
    async fn test_missing_binary_surfaces_on_fallback() {
        let db = db();
        db.fail_alter_when("ALGORITHM=INSTANT", DbError::with_code(1846, "not supported"));
        let p = planner(
            &db,
            RawOptions::new().with_ptosc_path("definitely-missing-pt-online-schema-change"),
        );
        let err = p
            .execute(PlanStep {
                kind: StepKind::NativeInstant,
                target: ClauseTarget::new("users", "MODIFY c BIGINT"),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalTool(crate::error::ExternalToolError::BinaryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_configured_signals_replace_defaults() {
        let db = db();
        db.fail_alter_when("ALGORITHM=INSTANT", DbError::with_code(1215, "cannot add foreign key"));
        let signals = FallbackSignals {
            codes: vec![1215],
            message_fragments: Vec::new(),
        };
        let p = planner(
            &db,
            RawOptions::new()
                .with_fallback_signals(signals)
                .with_ptosc_path("definitely-missing-pt-online-schema-change"),
        );
        let err = p
            .execute(PlanStep {
                kind: StepKind::NativeInstant,
                target: ClauseTarget::new("users", "ADD CONSTRAINT fk FOREIGN KEY (a) REFERENCES t (id)"),
            })
            .await
            .unwrap_err();
        // reaching the tool means the configured code was treated as a fallback signal
        assert!(matches!(
            err,
            Error::ExternalTool(crate::error::ExternalToolError::BinaryNotFound { .. })
        ));
    }
}

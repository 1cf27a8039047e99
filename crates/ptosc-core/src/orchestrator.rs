//! Request orchestration.
//!
//! Every request goes through the same sequence: validate options, prepare
//! the statements, resolve the tool binary if it may be needed, take the
//! migration lock, run the clauses in order, release the lock. Everything
//! before the lock is side-effect free, and the lock is released on every
//! path once taken.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::cache::{BinaryCache, VersionCache};
use crate::db::{bare_table_name, Database};
use crate::error::{PlanningError, Result};
use crate::lock::{LockConfig, LockCoordinator};
use crate::options::{RawOptions, ValidatedOptions};
use crate::planner::{AlterPlanner, ClauseTarget};
use crate::process::{ProcessSpawner, ProcessSupervisor, Statistics, TokioSpawner};
use crate::statement::{is_alter_table, is_index_only, parse_alter, CompiledStatement};

/// Entry point for online schema changes against one database.
pub struct Orchestrator {
    db: Arc<dyn Database>,
    spawner: Arc<dyn ProcessSpawner>,
    binaries: Arc<BinaryCache>,
    versions: Arc<VersionCache>,
}

impl Orchestrator {
    /// Create an orchestrator using real processes and the process-wide caches.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            spawner: Arc::new(TokioSpawner),
            binaries: BinaryCache::global(),
            versions: VersionCache::global(),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_binary_cache(mut self, cache: Arc<BinaryCache>) -> Self {
        self.binaries = cache;
        self
    }

    pub fn with_version_cache(mut self, cache: Arc<VersionCache>) -> Self {
        self.versions = cache;
        self
    }

    /// Run compiled statements for `table`.
    ///
    /// Bindings are inlined and statements other than `ALTER TABLE` are
    /// skipped; if none remain the call fails before taking the lock.
    /// Returns the statistics of every clause that reported any, or `None`.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn run_builder_alters(
        &self,
        table: &str,
        statements: &[CompiledStatement],
        options: RawOptions,
    ) -> Result<Option<Vec<Statistics>>> {
        let options = options.normalize()?;

        let mut targets = Vec::new();
        for statement in statements {
            let sql = statement.resolve()?;
            if !is_alter_table(&sql) {
                continue;
            }
            let parsed = parse_alter(&sql)?;
            targets.push(ClauseTarget::new(table, parsed.clause));
        }
        if targets.is_empty() {
            return Err(PlanningError::NoAlterStatements {
                table: table.to_string(),
            }
            .into());
        }

        self.run(targets, options).await
    }

    /// Run raw `ALTER TABLE` statements for `table`.
    ///
    /// Every statement must be an `ALTER TABLE` on `table`; anything else
    /// fails before the lock is taken.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn run_raw_alters<S: AsRef<str>>(
        &self,
        table: &str,
        statements: &[S],
        options: RawOptions,
    ) -> Result<Option<Vec<Statistics>>> {
        let options = options.normalize()?;
        if statements.is_empty() {
            return Err(PlanningError::NoStatements.into());
        }

        let expected = bare_table_name(table);
        let mut targets = Vec::with_capacity(statements.len());
        for statement in statements {
            let sql = statement.as_ref().trim();
            if !is_alter_table(sql) {
                return Err(PlanningError::NotAlterStatement {
                    statement: sql.to_string(),
                }
                .into());
            }
            let parsed = parse_alter(sql)?;
            let found = parsed.bare_table();
            if found != expected {
                return Err(PlanningError::TableMismatch { expected, found }.into());
            }
            targets.push(ClauseTarget::new(table, parsed.clause));
        }

        self.run(targets, options).await
    }

    async fn run(
        &self,
        targets: Vec<ClauseTarget>,
        options: ValidatedOptions,
    ) -> Result<Option<Vec<Statistics>>> {
        let options = Arc::new(options);
        let supervisor = ProcessSupervisor::new(Arc::clone(&self.spawner), Arc::clone(&self.binaries));

        if targets.iter().any(|t| !is_index_only(&t.clause)) {
            supervisor.resolve_binary(&options.ptosc_path)?;
        }

        let coordinator = LockCoordinator::new(Arc::clone(&self.db), LockConfig::from(&*options));
        let mut lock = coordinator.acquire().await?;
        info!(clauses = targets.len(), "migration lock held, running clauses");

        let planner = AlterPlanner::new(
            Arc::clone(&self.db),
            supervisor,
            Arc::clone(&self.versions),
            options,
        );
        let outcome = run_clauses(&planner, targets).await;
        let released = lock.release().await;

        match (outcome, released) {
            (Ok(stats), Ok(())) => Ok((!stats.is_empty()).then_some(stats)),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                error!(error = %release_err, "failed to release migration lock after clause failure");
                Err(e)
            }
        }
    }
}

/// Run clauses strictly in order; the first failure stops the rest.
async fn run_clauses(planner: &AlterPlanner, targets: Vec<ClauseTarget>) -> Result<Vec<Statistics>> {
    let mut collected = Vec::new();
    for target in targets {
        let step = planner.classify(&target).await?;
        if let Some(stats) = planner.execute(step).await? {
            collected.push(stats);
        }
    }
    Ok(collected)
}

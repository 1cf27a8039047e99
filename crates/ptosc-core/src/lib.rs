//! Online schema changes for MySQL driven by pt-online-schema-change.
//!
//! The [`Orchestrator`] is the entry point. For each request it validates
//! options, takes the migration lock, and runs every ALTER clause through
//! the cheapest safe path the [`AlterPlanner`] can find: a direct statement
//! for index changes and small tables, `ALGORITHM=INSTANT` where the server
//! supports it, and pt-online-schema-change otherwise.
//!
//! The database is reached through the [`Database`] trait and the external
//! tool through [`ProcessSpawner`], so both can be swapped out.

pub mod cache;
pub mod db;
pub mod error;
pub mod lock;
pub mod options;
pub mod orchestrator;
pub mod planner;
pub mod process;
pub mod statement;

pub use cache::{BinaryCache, EngineVersion, OnceCache, VersionCache};
pub use db::{ConnectionId, ConnectionInfo, Database, MemoryDatabase, Row, SqlValue, Transaction};
pub use error::{
    DbError, Error, ExternalToolError, LockError, NativeAlterError, PlanningError, Result,
    ValidationError,
};
pub use lock::{LockConfig, LockCoordinator, LockHandle};
pub use options::{ForeignKeysMethod, RawOptions, ValidatedOptions};
pub use orchestrator::Orchestrator;
pub use planner::{AlterPlanner, ClauseTarget, FallbackSignals, PlanStep, StepKind};
pub use process::{
    ProcessResult, ProcessSpawner, ProcessSupervisor, Statistics, TokioSpawner, ToolInvocation,
};
pub use statement::CompiledStatement;

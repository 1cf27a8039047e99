//! Error types for the online schema change engine.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error returned by the public entry points.
#[derive(Debug, Error)]
pub enum Error {
    /// An option failed validation. Nothing has been touched yet.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The migration lock could not be acquired or released.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A statement or clause could not be understood.
    #[error(transparent)]
    Planning(#[from] PlanningError),

    /// The external row-copy tool failed.
    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),

    /// A direct ALTER failed with an error that does not allow falling back.
    #[error(transparent)]
    NativeAlter(#[from] NativeAlterError),

    /// A database call outside the lock and the native ALTER paths failed.
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

/// A database driver error, reduced to the fields the engine inspects.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}{}", .code.map(|c| format!(" (errno {c})")).unwrap_or_default())]
pub struct DbError {
    /// Engine-specific error number (e.g. MySQL `errno`).
    pub code: Option<u32>,
    /// SQLSTATE, if the driver reports one.
    pub sql_state: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl DbError {
    /// Create an error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            sql_state: None,
            message: message.into(),
        }
    }

    /// Create an error carrying an engine error number.
    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            sql_state: None,
            message: message.into(),
        }
    }

    /// Attach a SQLSTATE.
    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }
}

/// Option validation failures. Each names the first offending field.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} must be a positive integer, got {value}")]
    NotPositiveInteger { field: &'static str, value: String },

    #[error("{field} must be a positive number, got {value}")]
    NotPositiveNumber { field: &'static str, value: String },

    #[error("{field} must be a non-empty string")]
    EmptyString { field: &'static str },

    #[error("{field} must be a {expected}, got {value}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{field} must be one of {allowed}; got '{value}'")]
    NotInEnum {
        field: &'static str,
        allowed: String,
        value: String,
    },
}

impl ValidationError {
    /// The option field this error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::NotPositiveInteger { field, .. }
            | ValidationError::NotPositiveNumber { field, .. }
            | ValidationError::EmptyString { field }
            | ValidationError::WrongType { field, .. }
            | ValidationError::NotInEnum { field, .. } => field,
        }
    }
}

/// Migration lock failures.
#[derive(Debug, Error)]
pub enum LockError {
    /// The change-log table or the lock table does not exist.
    #[error(
        "required migration tables do not exist; ensure {migrations_table} and {lock_table} are created before running online schema changes"
    )]
    MissingTable {
        migrations_table: String,
        lock_table: String,
    },

    /// The lock table exists but holds no row.
    #[error("missing row in {table}")]
    MissingRow { table: String },

    /// The flag is set by an actor outside the transactional protocol.
    #[error("migration lock already held in {table}")]
    AlreadyHeld { table: String },

    /// The acquisition deadline passed.
    #[error("timeout acquiring {table} after {timeout_ms}ms")]
    Timeout { table: String, timeout_ms: u64 },

    /// A database call failed during acquisition or release.
    #[error("migration lock database error on {table}: {source}")]
    UnderlyingDb {
        table: String,
        #[source]
        source: DbError,
    },
}

/// Statement and clause planning failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanningError {
    #[error("no SQL statements provided")]
    NoStatements,

    #[error(
        "no ALTER TABLE statements generated for \"{table}\"; only ALTER operations are supported"
    )]
    NoAlterStatements { table: String },

    #[error("only ALTER TABLE statements are supported: {statement}")]
    NotAlterStatement { statement: String },

    #[error("cannot parse ALTER TABLE statement: {statement}")]
    UnparsableStatement { statement: String },

    #[error("statement targets table {found}, expected {expected}")]
    TableMismatch { expected: String, found: String },

    #[error("statement has {found} placeholders but {expected} bindings were supplied")]
    BindingCount { expected: usize, found: usize },
}

/// Failures of the external row-copy tool.
#[derive(Debug, Error)]
pub enum ExternalToolError {
    /// The executable could not be located.
    #[error(
        "pt-online-schema-change binary not found: {name}. Install Percona Toolkit and ensure pt-online-schema-change is in your PATH."
    )]
    BinaryNotFound { name: String },

    /// The OS refused to start the process.
    #[error("failed to spawn {}: {source}", .path.display())]
    SpawnFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the child's output failed.
    #[error("failed to read output of {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process exited unsuccessfully. `code` is `None` when it was killed by a signal.
    #[error("pt-online-schema-change failed with code {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    NonZeroExit {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Combined output exceeded the configured ceiling and the process was terminated.
    #[error("pt-online-schema-change maxBuffer exceeded ({limit} bytes)")]
    BufferExceeded {
        limit: usize,
        stdout: String,
        stderr: String,
    },
}

impl ExternalToolError {
    /// Captured stdout, when the variant carries output.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            ExternalToolError::NonZeroExit { stdout, .. }
            | ExternalToolError::BufferExceeded { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    /// Captured stderr, when the variant carries output.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExternalToolError::NonZeroExit { stderr, .. }
            | ExternalToolError::BufferExceeded { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// A direct ALTER failed with an error that is not a known in-place limitation.
#[derive(Debug, Error)]
#[error("native ALTER on {table} failed: {source}")]
pub struct NativeAlterError {
    pub table: String,
    pub statement: String,
    #[source]
    pub source: DbError,
}

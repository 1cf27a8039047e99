//! Database capability interface.
//!
//! The engine never talks to a driver directly. Everything it needs from
//! the database is expressed by [`Database`] and [`Transaction`], so a
//! backend can be swapped per target engine:
//!
//! - `table_exists` for the lock preconditions
//! - `begin` for the transactional migration lock (row-level `FOR UPDATE`)
//! - `raw_execute` for native ALTERs and catalog lookups

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::DbError;

pub use memory::MemoryDatabase;

/// A scalar value moving between the engine and the database.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Interpret the value as a non-negative integer, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SqlValue::Int(v) if *v >= 0 => Some(*v as u64),
            SqlValue::UInt(v) => Some(*v),
            SqlValue::Float(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as u64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as a truth flag (`is_locked` style columns).
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Int(v) => Some(*v != 0),
            SqlValue::UInt(v) => Some(*v != 0),
            SqlValue::Text(s) => s.trim().parse::<i64>().ok().map(|v| v != 0),
            _ => None,
        }
    }

    /// Borrow the value as text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value as a SQL literal.
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(true) => "TRUE".to_string(),
            SqlValue::Bool(false) => "FALSE".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::UInt(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('\'');
                for ch in s.chars() {
                    match ch {
                        '\'' => out.push_str("''"),
                        '\\' => out.push_str("\\\\"),
                        '\0' => out.push_str("\\0"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\u{1a}' => out.push_str("\\Z"),
                        c => out.push(c),
                    }
                }
                out.push('\'');
                out
            }
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

/// A result row keyed by column name.
pub type Row = BTreeMap<String, SqlValue>;

/// Identity of a database handle, used as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh process-unique identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection parameters forwarded to the external tool.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Schema the tables live in.
    pub database: String,
    /// Server host. `None` means `localhost`.
    pub host: Option<String>,
    /// Login user.
    pub user: Option<String>,
    /// TCP port.
    pub port: Option<u16>,
    /// Unix socket path.
    pub socket_path: Option<String>,
    /// Password. Never placed on a command line.
    pub password: Option<String>,
}

impl ConnectionInfo {
    /// Create connection info for a schema.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Default::default()
        }
    }

    /// Set the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the socket path.
    pub fn with_socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// Set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Host to hand to the external tool.
    pub fn host_or_default(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("socket_path", &self.socket_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// An open database transaction.
///
/// `commit` and `rollback` consume the transaction; dropping it without
/// either must roll back.
#[async_trait]
pub trait Transaction: Send {
    /// Run a statement that returns rows.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError>;

    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    /// Commit the transaction. If the commit fails the transaction is
    /// rolled back before the error is returned.
    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    /// Roll the transaction back.
    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// The database capability consumed by the engine.
#[async_trait]
pub trait Database: Send + Sync {
    /// Stable identity of this handle, for per-connection caches.
    fn connection_id(&self) -> ConnectionId;

    /// Connection parameters for the external tool.
    fn connection_info(&self) -> &ConnectionInfo;

    /// Check whether a table exists in the current schema.
    async fn table_exists(&self, name: &str) -> Result<bool, DbError>;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError>;

    /// Run a statement outside any transaction and return its rows.
    async fn raw_execute(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError>;
}

/// Quote a possibly schema-qualified identifier with backticks.
///
/// Parts that are already quoted are kept as they are.
pub fn quote_identifier(name: &str) -> String {
    split_identifier(name)
        .iter()
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Split `schema.table`, `` `schema`.`table` `` or `table` into unquoted parts.
pub fn split_identifier(name: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = name.trim().chars().peekable();
    let mut quoted = false;

    while let Some(ch) = chars.next() {
        match ch {
            '`' if quoted && chars.peek() == Some(&'`') => {
                chars.next();
                current.push('`');
            }
            '`' => quoted = !quoted,
            '.' if !quoted => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// The unqualified table name of an identifier.
pub fn bare_table_name(name: &str) -> String {
    split_identifier(name).pop().unwrap_or_default()
}

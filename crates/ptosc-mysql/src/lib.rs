//! MySQL backend for ptosc.
//!
//! Implements [`ptosc_core::Database`] on a `sqlx` MySQL pool. Each lock
//! transaction pins one pool connection for its lifetime; native ALTERs and
//! catalog lookups run on any other connection.

use std::borrow::Cow;

use async_trait::async_trait;
use sqlx::mysql::{
    MySql, MySqlArguments, MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions,
    MySqlRow,
};
use sqlx::query::Query;
use sqlx::{Column, Row as _, TypeInfo};
use thiserror::Error;
use tracing::{debug, info};

use ptosc_core::db::split_identifier;
use ptosc_core::{ConnectionId, ConnectionInfo, Database, DbError, Row, SqlValue, Transaction};

/// Default pool size. The lock pins one connection and ALTERs use another.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Errors creating the backend.
#[derive(Debug, Error)]
pub enum MySqlBackendError {
    /// The pool could not open its first connection.
    #[error("failed to connect to MySQL at {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: sqlx::Error,
    },
}

/// A MySQL database reached through a sqlx pool.
#[derive(Debug, Clone)]
pub struct MySqlDatabase {
    pool: MySqlPool,
    id: ConnectionId,
    info: ConnectionInfo,
}

impl MySqlDatabase {
    /// Connect a new pool for the given connection parameters.
    pub async fn connect(info: ConnectionInfo) -> Result<Self, MySqlBackendError> {
        Self::connect_with(info, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with an explicit pool size (at least 2).
    pub async fn connect_with(info: ConnectionInfo, max_connections: u32) -> Result<Self, MySqlBackendError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect_with(connect_options(&info))
            .await
            .map_err(|source| MySqlBackendError::Connect {
                host: info.host_or_default().to_string(),
                source,
            })?;
        info!(host = %info.host_or_default(), database = %info.database, "connected to MySQL");
        Ok(Self::from_pool(pool, info))
    }

    /// Wrap an existing pool. `info` must describe the same server; it is
    /// what the external tool connects with.
    pub fn from_pool(pool: MySqlPool, info: ConnectionInfo) -> Self {
        Self {
            pool,
            id: ConnectionId::next(),
            info,
        }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

/// sqlx connect options for connection parameters.
pub fn connect_options(info: &ConnectionInfo) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(info.host_or_default())
        .database(&info.database);
    if let Some(port) = info.port {
        options = options.port(port);
    }
    if let Some(user) = &info.user {
        options = options.username(user);
    }
    if let Some(password) = &info.password {
        options = options.password(password);
    }
    if let Some(socket) = &info.socket_path {
        options = options.socket(socket);
    }
    options
}

#[async_trait]
impl Database for MySqlDatabase {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn table_exists(&self, name: &str) -> Result<bool, DbError> {
        let mut parts = split_identifier(name);
        let table = parts.pop().unwrap_or_default();
        let count: i64 = match parts.pop() {
            Some(schema) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
                )
                .bind(schema)
                .bind(table)
                .fetch_one(&self.pool)
                .await
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?",
                )
                .bind(table)
                .fetch_one(&self.pool)
                .await
            }
        }
        .map_err(to_db_error)?;
        Ok(count > 0)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        let tx = self.pool.begin().await.map_err(to_db_error)?;
        Ok(Box::new(MySqlTransaction { tx }))
    }

    async fn raw_execute(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        debug!(sql, params = params.len(), "raw execute");
        // DDL goes over the text protocol; only parameterised lookups are prepared.
        let rows = if params.is_empty() {
            sqlx::raw_sql(sql).fetch_all(&self.pool).await
        } else {
            bind_all(sqlx::query(sql), params).fetch_all(&self.pool).await
        }
        .map_err(to_db_error)?;
        rows.iter().map(decode_row).collect()
    }
}

struct MySqlTransaction {
    tx: sqlx::Transaction<'static, MySql>,
}

#[async_trait]
impl Transaction for MySqlTransaction {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(to_db_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let result = bind_all(sqlx::query(sql), params)
            .execute(&mut *self.tx)
            .await
            .map_err(to_db_error)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        // sqlx rolls back a transaction dropped after a failed commit
        self.tx.commit().await.map_err(to_db_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await.map_err(to_db_error)
    }
}

fn bind_all<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [SqlValue],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::UInt(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

/// Convert a driver error, keeping the MySQL error number and SQLSTATE.
pub fn to_db_error(err: sqlx::Error) -> DbError {
    match &err {
        sqlx::Error::Database(db_err) => DbError {
            code: db_err
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(|e| u32::from(e.number())),
            sql_state: db_err.code().map(Cow::into_owned),
            message: db_err.message().to_string(),
        },
        other => DbError::new(other.to_string()),
    }
}

fn decode_row(row: &MySqlRow) -> Result<Row, DbError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_value(row, idx, column.type_info().name()).map_err(to_db_error)?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode_value(row: &MySqlRow, idx: usize, type_name: &str) -> Result<SqlValue, sqlx::Error> {
    let upper = type_name.to_ascii_uppercase();
    let value = match upper.as_str() {
        "NULL" => None,
        "BOOLEAN" => row.try_get::<Option<bool>, _>(idx)?.map(SqlValue::Bool),
        t if t.ends_with("UNSIGNED") => row.try_get::<Option<u64>, _>(idx)?.map(SqlValue::UInt),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            row.try_get::<Option<i64>, _>(idx)?.map(SqlValue::Int)
        }
        "FLOAT" | "DOUBLE" => row.try_get::<Option<f64>, _>(idx)?.map(SqlValue::Float),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => row
            .try_get::<Option<Vec<u8>>, _>(idx)?
            .map(|bytes| SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())),
        _ => row
            .try_get_unchecked::<Option<String>, _>(idx)?
            .map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_from_info() {
        let info = ConnectionInfo::new("app")
            .with_host("db1")
            .with_port(3307)
            .with_user("migrator");
        let options = connect_options(&info);
        assert_eq!(options.get_host(), "db1");
        assert_eq!(options.get_port(), 3307);
        assert_eq!(options.get_username(), "migrator");
        assert_eq!(options.get_database(), Some("app"));
    }

    #[test]
    fn test_connect_options_default_host() {
        let options = connect_options(&ConnectionInfo::new("app"));
        assert_eq!(options.get_host(), "localhost");
        assert_eq!(options.get_port(), 3306);
    }

    #[test]
    fn test_non_database_errors_keep_message() {
        let err = to_db_error(sqlx::Error::RowNotFound);
        assert_eq!(err.code, None);
        assert!(!err.message.is_empty());
    }
}

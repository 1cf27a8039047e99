//! ptosc - online MySQL schema changes with pt-online-schema-change.
//!
//! Runs ALTER TABLE statements under a migration lock, choosing per clause
//! between a direct statement, `ALGORITHM=INSTANT`, and a
//! pt-online-schema-change dry run followed by the real run.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use ptosc::{ConnectionInfo, MySqlDatabase, Orchestrator, RawOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let info = ConnectionInfo::new("app")
//!         .with_host("db.internal")
//!         .with_user("migrator")
//!         .with_password(std::env::var("MYSQL_PASSWORD")?);
//!     let db = MySqlDatabase::connect(info).await?;
//!
//!     let stats = Orchestrator::new(Arc::new(db))
//!         .run_raw_alters(
//!             "users",
//!             &["ALTER TABLE users ADD COLUMN last_seen DATETIME NULL"],
//!             RawOptions::new()
//!                 .with_ptosc_min_rows(10_000)
//!                 .with_statistics(true)
//!                 .on_progress(|pct, eta| println!("{pct}% {}", eta.unwrap_or("-"))),
//!         )
//!         .await?;
//!     println!("{stats:?}");
//!     Ok(())
//! }
//! ```

pub use ptosc_core::*;

/// The sqlx MySQL backend.
#[cfg(feature = "mysql")]
pub use ptosc_mysql as mysql;

#[cfg(feature = "mysql")]
pub use ptosc_mysql::{MySqlBackendError, MySqlDatabase};

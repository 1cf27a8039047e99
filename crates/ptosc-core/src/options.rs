//! Option normalization and validation.
//!
//! [`RawOptions`] is what callers hand in: every field optional, numbers in
//! wide signed types so out-of-range values can be reported instead of
//! silently clamped. [`RawOptions::normalize`] turns it into
//! [`ValidatedOptions`] or fails on the first offending field. It runs before
//! the lock is taken or any process is spawned.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::planner::FallbackSignals;
use crate::process::Statistics;

/// Default external tool binary.
pub const DEFAULT_PTOSC_PATH: &str = "pt-online-schema-change";

/// Default status variable for `--max-load` and `--critical-load`.
pub const DEFAULT_LOAD_METRIC: &str = "Threads_running";

/// Default change-log table.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "knex_migrations";

/// Default lock table.
pub const DEFAULT_MIGRATIONS_LOCK_TABLE: &str = "knex_migrations_lock";

/// Default lock acquisition deadline.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ceiling on buffered tool output (10 MB).
pub const DEFAULT_MAX_BUFFER: usize = 10 * 1024 * 1024;

/// Progress callback: percent complete and the remaining-time token, if printed.
pub type ProgressCallback = Arc<dyn Fn(f64, Option<&str>) + Send + Sync>;

/// Statistics callback, fired with the running map each time a statistic is parsed.
pub type StatisticsCallback = Arc<dyn Fn(&Statistics) + Send + Sync>;

/// How the tool rewires foreign keys that reference the altered table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeysMethod {
    #[default]
    Auto,
    RebuildConstraints,
    DropSwap,
    None,
}

impl ForeignKeysMethod {
    /// All accepted values, in the order they are documented.
    pub const ALL: [ForeignKeysMethod; 4] = [
        ForeignKeysMethod::Auto,
        ForeignKeysMethod::RebuildConstraints,
        ForeignKeysMethod::DropSwap,
        ForeignKeysMethod::None,
    ];

    /// The value passed to `--alter-foreign-keys-method`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ForeignKeysMethod::Auto => "auto",
            ForeignKeysMethod::RebuildConstraints => "rebuild_constraints",
            ForeignKeysMethod::DropSwap => "drop_swap",
            ForeignKeysMethod::None => "none",
        }
    }
}

impl fmt::Display for ForeignKeysMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForeignKeysMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ValidationError::NotInEnum {
                field: "alterForeignKeysMethod",
                allowed: Self::ALL.map(|m| m.as_str()).join(", "),
                value: s.to_string(),
            })
    }
}

/// Unvalidated options as supplied by the caller.
#[derive(Clone, Default)]
pub struct RawOptions {
    pub password: Option<String>,
    pub max_load: Option<i64>,
    pub max_load_metric: Option<String>,
    pub critical_load: Option<i64>,
    pub critical_load_metric: Option<String>,
    pub alter_foreign_keys_method: Option<String>,
    pub ptosc_path: Option<String>,
    pub analyze_before_swap: Option<bool>,
    pub check_alter: Option<bool>,
    pub check_foreign_keys: Option<bool>,
    pub check_interval: Option<i64>,
    pub check_plan: Option<bool>,
    pub check_replication_filters: Option<bool>,
    pub check_replica_lag: Option<bool>,
    pub chunk_index: Option<String>,
    pub chunk_index_columns: Option<i64>,
    pub chunk_size: Option<i64>,
    pub chunk_size_limit: Option<f64>,
    pub chunk_time: Option<f64>,
    pub drop_new_table: Option<bool>,
    pub drop_old_table: Option<bool>,
    pub drop_triggers: Option<bool>,
    pub check_unique_key_change: Option<bool>,
    pub max_lag: Option<i64>,
    pub max_buffer: Option<i64>,
    pub statistics: Option<bool>,
    pub force_ptosc: Option<bool>,
    pub ptosc_min_rows: Option<i64>,
    pub migrations_table: Option<String>,
    pub migrations_lock_table: Option<String>,
    pub lock_timeout_ms: Option<i64>,
    pub fallback_signals: Option<FallbackSignals>,
    pub on_progress: Option<ProgressCallback>,
    pub on_statistics: Option<StatisticsCallback>,
}

impl RawOptions {
    /// Create an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the password handed to the tool through `MYSQL_PWD`.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the external tool binary name or path.
    pub fn with_ptosc_path(mut self, path: impl Into<String>) -> Self {
        self.ptosc_path = Some(path.into());
        self
    }

    /// Always use the external tool, skipping the instant attempt.
    pub fn with_force_ptosc(mut self, force: bool) -> Self {
        self.force_ptosc = Some(force);
        self
    }

    /// Run tables with fewer estimated rows than this with a plain ALTER.
    pub fn with_ptosc_min_rows(mut self, rows: i64) -> Self {
        self.ptosc_min_rows = Some(rows);
        self
    }

    /// Request and surface tool statistics.
    pub fn with_statistics(mut self, statistics: bool) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Set the output ceiling in bytes.
    pub fn with_max_buffer(mut self, bytes: i64) -> Self {
        self.max_buffer = Some(bytes);
        self
    }

    /// Set the lock acquisition deadline in milliseconds.
    pub fn with_lock_timeout_ms(mut self, ms: i64) -> Self {
        self.lock_timeout_ms = Some(ms);
        self
    }

    /// Replace the in-place fallback signal table.
    pub fn with_fallback_signals(mut self, signals: FallbackSignals) -> Self {
        self.fallback_signals = Some(signals);
        self
    }

    /// Set the progress callback.
    pub fn on_progress(mut self, f: impl Fn(f64, Option<&str>) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Set the statistics callback.
    pub fn on_statistics(mut self, f: impl Fn(&Statistics) + Send + Sync + 'static) -> Self {
        self.on_statistics = Some(Arc::new(f));
        self
    }

    /// Read options from a JSON configuration bag with camelCase keys.
    ///
    /// Values of the wrong JSON type fail with a field-named error; `null`
    /// means unset. Callbacks cannot come from JSON. Unknown keys are ignored.
    pub fn from_json(bag: &Value) -> Result<Self, ValidationError> {
        let obj = bag.as_object().ok_or_else(|| ValidationError::WrongType {
            field: "options",
            expected: "object",
            value: bag.to_string(),
        })?;

        let fallback_signals = match obj.get("fallbackSignals") {
            None | Some(Value::Null) => None,
            Some(v) => Some(serde_json::from_value(v.clone()).map_err(|_| {
                ValidationError::WrongType {
                    field: "fallbackSignals",
                    expected: "object with codes and messageFragments",
                    value: v.to_string(),
                }
            })?),
        };

        Ok(Self {
            password: string_field(obj, "password")?,
            max_load: integer_field(obj, "maxLoad")?,
            max_load_metric: string_field(obj, "maxLoadMetric")?,
            critical_load: integer_field(obj, "criticalLoad")?,
            critical_load_metric: string_field(obj, "criticalLoadMetric")?,
            alter_foreign_keys_method: string_field(obj, "alterForeignKeysMethod")?,
            ptosc_path: string_field(obj, "ptoscPath")?,
            analyze_before_swap: bool_field(obj, "analyzeBeforeSwap")?,
            check_alter: bool_field(obj, "checkAlter")?,
            check_foreign_keys: bool_field(obj, "checkForeignKeys")?,
            check_interval: integer_field(obj, "checkInterval")?,
            check_plan: bool_field(obj, "checkPlan")?,
            check_replication_filters: bool_field(obj, "checkReplicationFilters")?,
            check_replica_lag: bool_field(obj, "checkReplicaLag")?,
            chunk_index: string_field(obj, "chunkIndex")?,
            chunk_index_columns: integer_field(obj, "chunkIndexColumns")?,
            chunk_size: integer_field(obj, "chunkSize")?,
            chunk_size_limit: number_field(obj, "chunkSizeLimit")?,
            chunk_time: number_field(obj, "chunkTime")?,
            drop_new_table: bool_field(obj, "dropNewTable")?,
            drop_old_table: bool_field(obj, "dropOldTable")?,
            drop_triggers: bool_field(obj, "dropTriggers")?,
            check_unique_key_change: bool_field(obj, "checkUniqueKeyChange")?,
            max_lag: integer_field(obj, "maxLag")?,
            max_buffer: integer_field(obj, "maxBuffer")?,
            statistics: bool_field(obj, "statistics")?,
            force_ptosc: bool_field(obj, "forcePtosc")?,
            ptosc_min_rows: integer_field(obj, "ptoscMinRows")?,
            migrations_table: string_field(obj, "migrationsTable")?,
            migrations_lock_table: string_field(obj, "migrationsLockTable")?,
            lock_timeout_ms: integer_field(obj, "lockTimeoutMs")?,
            fallback_signals,
            on_progress: None,
            on_statistics: None,
        })
    }

    /// Validate and default every option.
    pub fn normalize(self) -> Result<ValidatedOptions, ValidationError> {
        let max_load = positive_integer("maxLoad", self.max_load)?;
        let critical_load = positive_integer("criticalLoad", self.critical_load)?;
        let check_interval = positive_integer("checkInterval", self.check_interval)?;
        let chunk_index_columns = positive_integer("chunkIndexColumns", self.chunk_index_columns)?;
        let chunk_size = positive_integer("chunkSize", self.chunk_size)?;
        let chunk_size_limit = positive_number("chunkSizeLimit", self.chunk_size_limit)?;
        let chunk_time = positive_number("chunkTime", self.chunk_time)?;
        let max_lag = positive_integer("maxLag", self.max_lag)?;
        let max_buffer = positive_integer("maxBuffer", self.max_buffer)?;
        let ptosc_min_rows = positive_integer("ptoscMinRows", self.ptosc_min_rows)?;
        let lock_timeout_ms = positive_integer("lockTimeoutMs", self.lock_timeout_ms)?;

        let alter_foreign_keys_method = match self.alter_foreign_keys_method.as_deref() {
            Some(s) => s.parse()?,
            None => ForeignKeysMethod::default(),
        };

        let password = non_empty("password", self.password)?;
        let max_load_metric = non_blank("maxLoadMetric", self.max_load_metric)?;
        let critical_load_metric = non_blank("criticalLoadMetric", self.critical_load_metric)?;
        let ptosc_path = non_blank("ptoscPath", self.ptosc_path)?;
        let chunk_index = non_blank("chunkIndex", self.chunk_index)?;
        let migrations_table = non_blank("migrationsTable", self.migrations_table)?;
        let migrations_lock_table = non_blank("migrationsLockTable", self.migrations_lock_table)?;

        Ok(ValidatedOptions {
            password,
            max_load,
            max_load_metric: max_load_metric.unwrap_or_else(|| DEFAULT_LOAD_METRIC.to_string()),
            critical_load,
            critical_load_metric: critical_load_metric
                .unwrap_or_else(|| DEFAULT_LOAD_METRIC.to_string()),
            alter_foreign_keys_method,
            ptosc_path: ptosc_path.unwrap_or_else(|| DEFAULT_PTOSC_PATH.to_string()),
            analyze_before_swap: self.analyze_before_swap.unwrap_or(true),
            check_alter: self.check_alter.unwrap_or(true),
            check_foreign_keys: self.check_foreign_keys.unwrap_or(true),
            check_interval,
            check_plan: self.check_plan.unwrap_or(true),
            check_replication_filters: self.check_replication_filters.unwrap_or(true),
            check_replica_lag: self.check_replica_lag.unwrap_or(false),
            chunk_index,
            chunk_index_columns,
            chunk_size: chunk_size.unwrap_or(1000),
            chunk_size_limit: chunk_size_limit.unwrap_or(4.0),
            chunk_time: chunk_time.unwrap_or(0.5),
            drop_new_table: self.drop_new_table.unwrap_or(true),
            drop_old_table: self.drop_old_table.unwrap_or(true),
            drop_triggers: self.drop_triggers.unwrap_or(true),
            check_unique_key_change: self.check_unique_key_change.unwrap_or(true),
            max_lag: max_lag.unwrap_or(25),
            max_buffer: max_buffer
                .map(|b| usize::try_from(b).unwrap_or(usize::MAX))
                .unwrap_or(DEFAULT_MAX_BUFFER),
            statistics: self.statistics.unwrap_or(false),
            force_ptosc: self.force_ptosc.unwrap_or(false),
            ptosc_min_rows,
            migrations_table: migrations_table
                .unwrap_or_else(|| DEFAULT_MIGRATIONS_TABLE.to_string()),
            migrations_lock_table: migrations_lock_table
                .unwrap_or_else(|| DEFAULT_MIGRATIONS_LOCK_TABLE.to_string()),
            lock_timeout: lock_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_LOCK_TIMEOUT),
            fallback_signals: self.fallback_signals.unwrap_or_default(),
            on_progress: self.on_progress,
            on_statistics: self.on_statistics,
        })
    }
}

impl fmt::Debug for RawOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawOptions")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_load", &self.max_load)
            .field("critical_load", &self.critical_load)
            .field("alter_foreign_keys_method", &self.alter_foreign_keys_method)
            .field("ptosc_path", &self.ptosc_path)
            .field("chunk_size", &self.chunk_size)
            .field("statistics", &self.statistics)
            .field("force_ptosc", &self.force_ptosc)
            .field("ptosc_min_rows", &self.ptosc_min_rows)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_statistics", &self.on_statistics.is_some())
            .finish_non_exhaustive()
    }
}

/// Fully defaulted, validated options shared by every clause of a request.
#[derive(Clone)]
pub struct ValidatedOptions {
    pub password: Option<String>,
    pub max_load: Option<u64>,
    pub max_load_metric: String,
    pub critical_load: Option<u64>,
    pub critical_load_metric: String,
    pub alter_foreign_keys_method: ForeignKeysMethod,
    pub ptosc_path: String,
    pub analyze_before_swap: bool,
    pub check_alter: bool,
    pub check_foreign_keys: bool,
    pub check_interval: Option<u64>,
    pub check_plan: bool,
    pub check_replication_filters: bool,
    pub check_replica_lag: bool,
    pub chunk_index: Option<String>,
    pub chunk_index_columns: Option<u64>,
    pub chunk_size: u64,
    pub chunk_size_limit: f64,
    pub chunk_time: f64,
    pub drop_new_table: bool,
    pub drop_old_table: bool,
    pub drop_triggers: bool,
    pub check_unique_key_change: bool,
    pub max_lag: u64,
    pub max_buffer: usize,
    pub statistics: bool,
    pub force_ptosc: bool,
    pub ptosc_min_rows: Option<u64>,
    pub migrations_table: String,
    pub migrations_lock_table: String,
    pub lock_timeout: Duration,
    pub fallback_signals: FallbackSignals,
    pub on_progress: Option<ProgressCallback>,
    pub on_statistics: Option<StatisticsCallback>,
}

impl Default for ValidatedOptions {
    fn default() -> Self {
        match RawOptions::default().normalize() {
            Ok(options) => options,
            Err(err) => unreachable!("default options are valid: {err}"),
        }
    }
}

impl fmt::Debug for ValidatedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedOptions")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("alter_foreign_keys_method", &self.alter_foreign_keys_method)
            .field("ptosc_path", &self.ptosc_path)
            .field("chunk_size", &self.chunk_size)
            .field("max_buffer", &self.max_buffer)
            .field("statistics", &self.statistics)
            .field("force_ptosc", &self.force_ptosc)
            .field("ptosc_min_rows", &self.ptosc_min_rows)
            .field("migrations_lock_table", &self.migrations_lock_table)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

fn positive_integer(field: &'static str, value: Option<i64>) -> Result<Option<u64>, ValidationError> {
    match value {
        None => Ok(None),
        Some(v) if v > 0 => Ok(Some(v as u64)),
        Some(v) => Err(ValidationError::NotPositiveInteger {
            field,
            value: v.to_string(),
        }),
    }
}

fn positive_number(field: &'static str, value: Option<f64>) -> Result<Option<f64>, ValidationError> {
    match value {
        None => Ok(None),
        Some(v) if v.is_finite() && v > 0.0 => Ok(Some(v)),
        Some(v) => Err(ValidationError::NotPositiveNumber {
            field,
            value: v.to_string(),
        }),
    }
}

/// Passwords may be any non-empty string, whitespace included.
fn non_empty(field: &'static str, value: Option<String>) -> Result<Option<String>, ValidationError> {
    match value {
        Some(s) if s.is_empty() => Err(ValidationError::EmptyString { field }),
        other => Ok(other),
    }
}

/// Names, paths and metrics must contain something besides whitespace.
fn non_blank(field: &'static str, value: Option<String>) -> Result<Option<String>, ValidationError> {
    match value {
        Some(s) if s.trim().is_empty() => Err(ValidationError::EmptyString { field }),
        other => Ok(other),
    }
}

fn integer_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) if n.as_i64().is_some() => Ok(n.as_i64()),
        // 1000.0 is an integer
        Some(Value::Number(n)) if n.as_f64().is_some_and(is_integral) => Ok(n.as_f64().map(|f| f as i64)),
        Some(v) => Err(ValidationError::NotPositiveInteger {
            field,
            value: v.to_string(),
        }),
    }
}

fn is_integral(f: f64) -> bool {
    f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
}

fn number_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(v) => Err(ValidationError::NotPositiveNumber {
            field,
            value: v.to_string(),
        }),
    }
}

fn bool_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<bool>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(v) => Err(ValidationError::WrongType {
            field,
            expected: "boolean",
            value: v.to_string(),
        }),
    }
}

fn string_field(obj: &Map<String, Value>, field: &'static str) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(v) => Err(ValidationError::WrongType {
            field,
            expected: "string",
            value: v.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let opts = RawOptions::new().normalize().unwrap();
        assert_eq!(opts.alter_foreign_keys_method, ForeignKeysMethod::Auto);
        assert_eq!(opts.ptosc_path, DEFAULT_PTOSC_PATH);
        assert_eq!(opts.chunk_size, 1000);
        assert_eq!(opts.chunk_size_limit, 4.0);
        assert_eq!(opts.chunk_time, 0.5);
        assert_eq!(opts.max_lag, 25);
        assert_eq!(opts.max_buffer, DEFAULT_MAX_BUFFER);
        assert_eq!(opts.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(opts.migrations_lock_table, DEFAULT_MIGRATIONS_LOCK_TABLE);
        assert!(opts.analyze_before_swap);
        assert!(!opts.check_replica_lag);
        assert!(!opts.force_ptosc);
        assert!(opts.max_load.is_none());
    }

    #[test]
    fn test_rejects_non_positive_integers() {
        for (field, opts) in [
            ("maxLoad", RawOptions { max_load: Some(0), ..Default::default() }),
            ("criticalLoad", RawOptions { critical_load: Some(-3), ..Default::default() }),
            ("checkInterval", RawOptions { check_interval: Some(0), ..Default::default() }),
            ("chunkSize", RawOptions { chunk_size: Some(-1), ..Default::default() }),
            ("maxLag", RawOptions { max_lag: Some(0), ..Default::default() }),
            ("maxBuffer", RawOptions { max_buffer: Some(0), ..Default::default() }),
            ("ptoscMinRows", RawOptions { ptosc_min_rows: Some(-1), ..Default::default() }),
            ("lockTimeoutMs", RawOptions { lock_timeout_ms: Some(0), ..Default::default() }),
        ] {
            let err = opts.normalize().unwrap_err();
            assert_eq!(err.field(), field);
            assert!(matches!(err, ValidationError::NotPositiveInteger { .. }));
        }
    }

    #[test]
    fn test_rejects_non_positive_numbers() {
        let err = RawOptions { chunk_size_limit: Some(0.0), ..Default::default() }
            .normalize()
            .unwrap_err();
        assert_eq!(err.field(), "chunkSizeLimit");

        let err = RawOptions { chunk_time: Some(f64::NAN), ..Default::default() }
            .normalize()
            .unwrap_err();
        assert_eq!(err.field(), "chunkTime");
    }

    #[test]
    fn test_rejects_unknown_foreign_keys_method() {
        let err = RawOptions {
            alter_foreign_keys_method: Some("bogus".to_string()),
            ..Default::default()
        }
        .normalize()
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "alterForeignKeysMethod must be one of auto, rebuild_constraints, drop_swap, none; got 'bogus'"
        );
    }

    #[test]
    fn test_rejects_empty_strings() {
        let err = RawOptions { ptosc_path: Some("  ".to_string()), ..Default::default() }
            .normalize()
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptyString { field: "ptoscPath" });
    }

    #[test]
    fn test_whitespace_password_is_kept() {
        let opts = RawOptions::new().with_password("  ").normalize().unwrap();
        assert_eq!(opts.password.as_deref(), Some("  "));

        let err = RawOptions::new().with_password("").normalize().unwrap_err();
        assert_eq!(err, ValidationError::EmptyString { field: "password" });
    }

    #[test]
    fn test_first_violation_wins() {
        let err = RawOptions {
            max_load: Some(0),
            chunk_time: Some(-1.0),
            ..Default::default()
        }
        .normalize()
        .unwrap_err();
        assert_eq!(err.field(), "maxLoad");
    }

    #[test]
    fn test_from_json_reads_camel_case() {
        let opts = RawOptions::from_json(&json!({
            "maxLoad": 100,
            "alterForeignKeysMethod": "drop_swap",
            "chunkSizeLimit": 3.5,
            "checkReplicaLag": true,
            "chunkIndex": "id",
            "logger": "ignored",
        }))
        .unwrap()
        .normalize()
        .unwrap();
        assert_eq!(opts.max_load, Some(100));
        assert_eq!(opts.alter_foreign_keys_method, ForeignKeysMethod::DropSwap);
        assert_eq!(opts.chunk_size_limit, 3.5);
        assert!(opts.check_replica_lag);
        assert_eq!(opts.chunk_index.as_deref(), Some("id"));
    }

    #[test]
    fn test_from_json_type_errors_name_field() {
        let err = RawOptions::from_json(&json!({ "chunkSize": 1.2 })).unwrap_err();
        assert_eq!(err.field(), "chunkSize");

        let err = RawOptions::from_json(&json!({ "chunkSizeLimit": "foo" })).unwrap_err();
        assert!(matches!(err, ValidationError::NotPositiveNumber { field: "chunkSizeLimit", .. }));

        let err = RawOptions::from_json(&json!({ "dropTriggers": "yes" })).unwrap_err();
        assert!(matches!(err, ValidationError::WrongType { field: "dropTriggers", .. }));

        let err = RawOptions::from_json(&json!({ "ptoscPath": 7 })).unwrap_err();
        assert_eq!(err.field(), "ptoscPath");

        let err = RawOptions::from_json(&json!([1, 2])).unwrap_err();
        assert_eq!(err.field(), "options");
    }

    #[test]
    fn test_from_json_accepts_integral_floats() {
        let opts = RawOptions::from_json(&json!({ "chunkSize": 1000.0, "maxLag": 5.0 }))
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(opts.chunk_size, 1000);
        assert_eq!(opts.max_lag, 5);

        let err = RawOptions::from_json(&json!({ "chunkSize": 1000.5 })).unwrap_err();
        assert!(matches!(err, ValidationError::NotPositiveInteger { field: "chunkSize", .. }));
        let err = RawOptions::from_json(&json!({ "maxLag": 1e30 })).unwrap_err();
        assert_eq!(err.field(), "maxLag");
    }

    #[test]
    fn test_from_json_fallback_signals() {
        let opts = RawOptions::from_json(&json!({
            "fallbackSignals": { "codes": [1846], "messageFragments": ["nope"] }
        }))
        .unwrap()
        .normalize()
        .unwrap();
        assert_eq!(opts.fallback_signals.codes, vec![1846]);
        assert_eq!(opts.fallback_signals.message_fragments, vec!["nope".to_string()]);
    }

    #[test]
    fn test_debug_redacts_password() {
        let opts = RawOptions::new().with_password("hunter2");
        assert!(!format!("{opts:?}").contains("hunter2"));
        let validated = opts.normalize().unwrap();
        assert!(!format!("{validated:?}").contains("hunter2"));
    }
}

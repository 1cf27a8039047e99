//! Argument vector for pt-online-schema-change.

use crate::db::ConnectionInfo;
use crate::options::ValidatedOptions;

/// Which of the two tool invocations is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DryRun,
    Execute,
}

impl Phase {
    /// The mode flag passed to the tool.
    pub fn flag(&self) -> &'static str {
        match self {
            Phase::DryRun => "--dry-run",
            Phase::Execute => "--execute",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::DryRun => "dry-run",
            Phase::Execute => "execute",
        })
    }
}

/// The table and clause one invocation works on.
#[derive(Debug, Clone, Copy)]
pub struct ToolTarget<'a> {
    /// Unqualified table name.
    pub table: &'a str,
    /// ALTER clause, without the `ALTER TABLE <name>` prefix.
    pub clause: &'a str,
}

/// Build the argument vector for one invocation.
///
/// Each value is its own element; nothing is ever joined into a shell string.
/// The password is deliberately absent.
pub fn build_tool_args(
    target: ToolTarget<'_>,
    options: &ValidatedOptions,
    conn: &ConnectionInfo,
    phase: Phase,
) -> Vec<String> {
    let mut args = vec![
        "--alter".to_string(),
        target.clause.to_string(),
        format!("--alter-foreign-keys-method={}", options.alter_foreign_keys_method),
        format!("D={},t={}", conn.database, target.table),
        phase.flag().to_string(),
        format!("--host={}", conn.host_or_default()),
    ];
    if let Some(user) = &conn.user {
        args.push(format!("--user={user}"));
    }

    if let Some(port) = conn.port {
        push_pair(&mut args, "--port", port);
    }
    if let Some(socket) = &conn.socket_path {
        push_pair(&mut args, "--socket", socket);
    }
    if let Some(max_load) = options.max_load {
        push_pair(
            &mut args,
            "--max-load",
            format!("{}={}", options.max_load_metric, max_load),
        );
    }
    if let Some(critical_load) = options.critical_load {
        push_pair(
            &mut args,
            "--critical-load",
            format!("{}={}", options.critical_load_metric, critical_load),
        );
    }

    push_toggle(&mut args, "analyze-before-swap", options.analyze_before_swap);
    push_toggle(&mut args, "check-alter", options.check_alter);
    push_toggle(&mut args, "check-foreign-keys", options.check_foreign_keys);
    if let Some(interval) = options.check_interval {
        push_pair(&mut args, "--check-interval", interval);
    }
    push_toggle(&mut args, "check-plan", options.check_plan);
    push_toggle(&mut args, "check-replication-filters", options.check_replication_filters);
    if options.check_replica_lag {
        args.push("--check-replica-lag".to_string());
    }

    if let Some(index) = &options.chunk_index {
        push_pair(&mut args, "--chunk-index", index);
    }
    if let Some(columns) = options.chunk_index_columns {
        push_pair(&mut args, "--chunk-index-columns", columns);
    }
    push_pair(&mut args, "--chunk-size", options.chunk_size);
    // f64 Display renders 4.0 as `4`.
    push_pair(&mut args, "--chunk-size-limit", options.chunk_size_limit);
    push_pair(&mut args, "--chunk-time", options.chunk_time);

    push_toggle(&mut args, "drop-new-table", options.drop_new_table);
    push_toggle(&mut args, "drop-old-table", options.drop_old_table);
    push_toggle(&mut args, "drop-triggers", options.drop_triggers);
    push_toggle(&mut args, "check-unique-key-change", options.check_unique_key_change);
    push_pair(&mut args, "--max-lag", options.max_lag);

    if options.statistics {
        args.push("--statistics".to_string());
    }
    args
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: impl ToString) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

fn push_toggle(args: &mut Vec<String>, name: &str, enabled: bool) {
    args.push(if enabled {
        format!("--{name}")
    } else {
        format!("--no{name}")
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ForeignKeysMethod, RawOptions};

    fn target() -> ToolTarget<'static> {
        ToolTarget {
            table: "users",
            clause: "ADD COLUMN age INT",
        }
    }

    fn conn() -> ConnectionInfo {
        ConnectionInfo::new("app").with_user("root")
    }

    #[test]
    fn test_default_argument_vector() {
        let args = build_tool_args(target(), &ValidatedOptions::default(), &conn(), Phase::Execute);
        assert_eq!(
            args,
            vec![
                "--alter",
                "ADD COLUMN age INT",
                "--alter-foreign-keys-method=auto",
                "D=app,t=users",
                "--execute",
                "--host=localhost",
                "--user=root",
                "--analyze-before-swap",
                "--check-alter",
                "--check-foreign-keys",
                "--check-plan",
                "--check-replication-filters",
                "--chunk-size",
                "1000",
                "--chunk-size-limit",
                "4",
                "--chunk-time",
                "0.5",
                "--drop-new-table",
                "--drop-old-table",
                "--drop-triggers",
                "--check-unique-key-change",
                "--max-lag",
                "25",
            ]
        );
    }

    #[test]
    fn test_phases_differ_only_in_mode_flag() {
        let opts = ValidatedOptions::default();
        let dry = build_tool_args(target(), &opts, &conn(), Phase::DryRun);
        let exec = build_tool_args(target(), &opts, &conn(), Phase::Execute);
        let diff: Vec<_> = dry.iter().zip(&exec).filter(|(a, b)| a != b).collect();
        assert_eq!(diff, vec![(&"--dry-run".to_string(), &"--execute".to_string())]);
    }

    #[test]
    fn test_conditional_and_negated_flags() {
        let mut opts = RawOptions {
            max_load: Some(50),
            critical_load: Some(200),
            critical_load_metric: Some("Threads_connected".to_string()),
            check_interval: Some(2),
            check_replica_lag: Some(true),
            chunk_index: Some("idx_created".to_string()),
            chunk_index_columns: Some(1),
            chunk_size_limit: Some(3.5),
            drop_triggers: Some(false),
            check_alter: Some(false),
            statistics: Some(true),
            ..Default::default()
        }
        .normalize()
        .unwrap();
        opts.alter_foreign_keys_method = ForeignKeysMethod::RebuildConstraints;

        let info = conn().with_host("db1").with_port(3307).with_socket_path("/tmp/mysql.sock");
        let args = build_tool_args(target(), &opts, &info, Phase::DryRun);
        let joined = args.join(" ");

        assert!(joined.contains("--alter-foreign-keys-method=rebuild_constraints"));
        assert!(joined.contains("--host=db1 --user=root --port 3307 --socket /tmp/mysql.sock"));
        assert!(joined.contains("--max-load Threads_running=50"));
        assert!(joined.contains("--critical-load Threads_connected=200"));
        assert!(joined.contains("--nocheck-alter"));
        assert!(joined.contains("--check-foreign-keys --check-interval 2 --check-plan"));
        assert!(joined.contains("--check-replication-filters --check-replica-lag"));
        assert!(joined.contains("--chunk-index idx_created --chunk-index-columns 1"));
        assert!(joined.contains("--chunk-size-limit 3.5"));
        assert!(joined.contains("--nodrop-triggers"));
        assert_eq!(args.last().map(String::as_str), Some("--statistics"));
    }

    #[test]
    fn test_password_never_in_arguments() {
        let opts = RawOptions::new().with_password("s3cret").normalize().unwrap();
        let info = conn().with_password("other");
        let args = build_tool_args(target(), &opts, &info, Phase::Execute);
        assert!(args.iter().all(|a| !a.contains("s3cret") && !a.contains("other")));
    }

    #[test]
    fn test_clause_with_quotes_stays_one_argument() {
        let t = ToolTarget {
            table: "users",
            clause: "ADD COLUMN note VARCHAR(20) DEFAULT 'a b; rm -rf /'",
        };
        let args = build_tool_args(t, &ValidatedOptions::default(), &conn(), Phase::Execute);
        assert_eq!(args[1], "ADD COLUMN note VARCHAR(20) DEFAULT 'a b; rm -rf /'");
    }
}

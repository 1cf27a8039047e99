//! Statement preparation.
//!
//! Turns compiled statements into ALTER clauses: bindings are inlined as
//! literals, non-ALTER statements are dropped (builder path) or rejected
//! (raw path), and the clause after the table name is split off.

use std::sync::LazyLock;

use regex::Regex;

use crate::db::{bare_table_name, SqlValue};
use crate::error::PlanningError;

static ALTER_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*ALTER\s+TABLE\s").expect("valid alter prefix regex"));

static ALTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*ALTER\s+TABLE\s+((?:`(?:[^`]|``)+`|[^\s`.]+)(?:\.(?:`(?:[^`]|``)+`|[^\s`.]+))?)\s+(.*?)\s*;?\s*$",
    )
    .expect("valid alter regex")
});

// `ADD [CONSTRAINT [sym]] UNIQUE [INDEX|KEY]` takes the keyword as optional.
static INDEX_OP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:ADD|DROP)\s+(?:INDEX|KEY)\b|ADD\s+(?:CONSTRAINT(?:\s+(?:`(?:[^`]|``)+`|[^\s`(]+))?\s+)?UNIQUE\b)",
    )
    .expect("valid index regex")
});

/// A statement as emitted by a statement compiler: SQL text with `?`
/// placeholders and their values.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub bindings: Vec<SqlValue>,
}

impl CompiledStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: Vec::new(),
        }
    }

    pub fn with_bindings(mut self, bindings: Vec<SqlValue>) -> Self {
        self.bindings = bindings;
        self
    }

    /// The statement with every placeholder replaced by its literal.
    pub fn resolve(&self) -> Result<String, PlanningError> {
        resolve_bindings(&self.sql, &self.bindings)
    }
}

/// A parsed `ALTER TABLE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterStatement {
    /// Table identifier as written, possibly quoted and schema-qualified.
    pub table: String,
    /// Everything after the table name.
    pub clause: String,
}

impl AlterStatement {
    /// Unquoted, unqualified table name.
    pub fn bare_table(&self) -> String {
        bare_table_name(&self.table)
    }
}

/// Replace `?` placeholders outside quotes with SQL literals.
pub fn resolve_bindings(sql: &str, bindings: &[SqlValue]) -> Result<String, PlanningError> {
    let mut out = String::with_capacity(sql.len());
    let mut values = bindings.iter();
    let mut placeholders = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(q), '\\') if q != '`' => {
                out.push(ch);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            (Some(q), c) if c == q => {
                out.push(c);
                if chars.peek() == Some(&q) {
                    out.push(q);
                    chars.next();
                } else {
                    quote = None;
                }
            }
            (Some(_), c) => out.push(c),
            (None, c @ ('\'' | '"' | '`')) => {
                quote = Some(c);
                out.push(c);
            }
            (None, '?') => {
                placeholders += 1;
                if let Some(value) = values.next() {
                    out.push_str(&value.to_literal());
                }
            }
            (None, c) => out.push(c),
        }
    }

    if placeholders != bindings.len() {
        return Err(PlanningError::BindingCount {
            expected: bindings.len(),
            found: placeholders,
        });
    }
    Ok(out)
}

/// Whether a statement is an `ALTER TABLE`.
pub fn is_alter_table(sql: &str) -> bool {
    ALTER_PREFIX_RE.is_match(sql)
}

/// Split an `ALTER TABLE` statement into table and clause.
pub fn parse_alter(sql: &str) -> Result<AlterStatement, PlanningError> {
    let caps = ALTER_RE
        .captures(sql)
        .ok_or_else(|| PlanningError::UnparsableStatement {
            statement: sql.trim().to_string(),
        })?;
    let clause = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
    if clause.is_empty() {
        return Err(PlanningError::UnparsableStatement {
            statement: sql.trim().to_string(),
        });
    }
    Ok(AlterStatement {
        table: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        clause: clause.to_string(),
    })
}

/// Whether every top-level operation of a clause adds or drops an index or key.
pub fn is_index_only(clause: &str) -> bool {
    let parts = split_top_level(clause);
    !parts.is_empty() && parts.iter().all(|part| INDEX_OP_RE.is_match(part))
}

/// Split on commas that are outside parentheses and quotes.
fn split_top_level(clause: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut escaped = false;

    for (i, ch) in clause.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' && q != '`' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(clause[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(clause[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_skip_quoted_question_marks() {
        let sql = resolve_bindings(
            "ALTER TABLE `t` ADD COLUMN c VARCHAR(10) DEFAULT ? COMMENT 'why?'",
            &[SqlValue::from("it's")],
        )
        .unwrap();
        assert_eq!(
            sql,
            "ALTER TABLE `t` ADD COLUMN c VARCHAR(10) DEFAULT 'it''s' COMMENT 'why?'"
        );
    }

    #[test]
    fn test_binding_count_mismatch() {
        let err = resolve_bindings("ALTER TABLE t ALTER c SET DEFAULT ?", &[]).unwrap_err();
        assert_eq!(err, PlanningError::BindingCount { expected: 0, found: 1 });
    }

    #[test]
    fn test_escaped_quotes_inside_literals() {
        let sql = resolve_bindings(
            r"ALTER TABLE t MODIFY c INT COMMENT 'a\'?' DEFAULT ?",
            &[SqlValue::Int(3)],
        )
        .unwrap();
        assert!(sql.ends_with("DEFAULT 3"));
        assert!(sql.contains(r"'a\'?'"));
    }

    #[test]
    fn test_parse_alter_variants() {
        let stmt = parse_alter("alter table `users` add `age` int").unwrap();
        assert_eq!(stmt.table, "`users`");
        assert_eq!(stmt.bare_table(), "users");
        assert_eq!(stmt.clause, "add `age` int");

        let stmt = parse_alter("ALTER TABLE `app`.`users`\n  DROP COLUMN legacy;").unwrap();
        assert_eq!(stmt.bare_table(), "users");
        assert_eq!(stmt.clause, "DROP COLUMN legacy");

        let stmt = parse_alter("ALTER TABLE app.users ADD INDEX idx (a)").unwrap();
        assert_eq!(stmt.table, "app.users");

        assert!(parse_alter("ALTER TABLE users").is_err());
        assert!(parse_alter("CREATE TABLE users (id INT)").is_err());
    }

    #[test]
    fn test_alter_filter() {
        assert!(is_alter_table("  alter TABLE x add y int"));
        assert!(!is_alter_table("CREATE INDEX i ON t (c)"));
        assert!(!is_alter_table("ALTER VIEW v AS SELECT 1"));
    }

    #[test]
    fn test_index_only_detection() {
        assert!(is_index_only("ADD INDEX idx_email (email)"));
        assert!(is_index_only("add unique key uq (a, b)"));
        assert!(is_index_only("DROP INDEX idx_email"));
        assert!(is_index_only("DROP KEY k, ADD INDEX k2 (a, b)"));
        assert!(is_index_only("add unique `users_email_unique`(`email`)"));
        assert!(is_index_only("ADD UNIQUE uq_email (email)"));
        assert!(is_index_only("ADD UNIQUE (email)"));
        assert!(is_index_only("ADD CONSTRAINT uq UNIQUE KEY (email)"));
        assert!(is_index_only("ADD CONSTRAINT `uq email` UNIQUE (email)"));
        assert!(is_index_only("ADD CONSTRAINT UNIQUE INDEX (email)"));
        assert!(!is_index_only("ADD CONSTRAINT fk FOREIGN KEY (a) REFERENCES b (id)"));
        assert!(!is_index_only("ADD CONSTRAINT chk CHECK (a > 0)"));
        assert!(!is_index_only("ADD COLUMN `unique` INT"));
        assert!(!is_index_only("ADD COLUMN age INT"));
        assert!(!is_index_only("ADD INDEX i (a), ADD COLUMN b INT"));
        assert!(!is_index_only("ADD PRIMARY KEY (id)"));
        assert!(!is_index_only("ADD FOREIGN KEY (a) REFERENCES b (id)"));
        assert!(!is_index_only("ADD COLUMN `index` INT"));
        assert!(!is_index_only(""));
    }
}

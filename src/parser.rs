//! SQL classification for span naming.
//!
//! Used to resolve a table when a query builder cannot name one, and by
//! [`TracingTracer`](crate::TracingTracer) to attach `db.operation` and
//! `db.sql.table` to `db_sql` annotations.

use once_cell::sync::Lazy;
use regex::Regex;

/// SQL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl SqlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Other => "QUERY",
        }
    }
}

impl std::fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// An optionally schema-qualified, optionally quoted identifier; group 1 is the
// last segment.
const IDENT: &str = r#"(?:[`"\[]?\w+[`"\]]?\.)?[`"\[]?(\w+)[`"\]]?"#;

static SELECT_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\bFROM\s+{IDENT}")).expect("valid regex"));

static INSERT_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\bINSERT\s+INTO\s+{IDENT}")).expect("valid regex"));

static UPDATE_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\bUPDATE\s+{IDENT}")).expect("valid regex"));

static DELETE_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\bDELETE\s+FROM\s+{IDENT}")).expect("valid regex"));

/// Classify a statement by its leading keyword.
pub fn parse_operation(sql: &str) -> SqlOperation {
    let keyword: String = sql
        .trim_start()
        .trim_start_matches('(')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "SELECT" | "WITH" => SqlOperation::Select,
        "INSERT" => SqlOperation::Insert,
        "UPDATE" => SqlOperation::Update,
        "DELETE" => SqlOperation::Delete,
        _ => SqlOperation::Other,
    }
}

/// Extract the primary table name from a SQL query, lower-cased.
///
/// Sub-selects resolve to the first table named in a `FROM` clause, so
/// `SELECT COUNT(*) FROM (SELECT * FROM "order") AS q` yields `order`.
pub fn extract_table(sql: &str) -> Option<String> {
    let regex = match parse_operation(sql) {
        SqlOperation::Select => &*SELECT_TABLE,
        SqlOperation::Insert => &*INSERT_TABLE,
        SqlOperation::Update => &*UPDATE_TABLE,
        SqlOperation::Delete => &*DELETE_TABLE,
        SqlOperation::Other => return None,
    };

    regex
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Parsed SQL information.
#[derive(Debug)]
pub struct ParsedSql {
    pub operation: SqlOperation,
    pub table: Option<String>,
}

impl ParsedSql {
    pub fn parse(sql: &str) -> Self {
        Self {
            operation: parse_operation(sql),
            table: extract_table(sql),
        }
    }

    /// Format: "{OPERATION} {table}" or "{OPERATION}"
    pub fn span_name(&self) -> String {
        match &self.table {
            Some(table) => format!("{} {}", self.operation, table),
            None => self.operation.as_str().to_string(),
        }
    }
}

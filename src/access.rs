//! Capability interface of an instrumentable data-access layer.
//!
//! A [`DataSource`] hands out [`Repository`] handles, which create
//! [`QueryBuilder`]s. Only the execution methods listed in
//! [`QueryMethod::ALL`] are wrapped by the interception layer; everything
//! else on a builder is left alone.

use async_trait::async_trait;
use serde::Serialize;

/// Query-execution entry points that get a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMethod {
    Stream,
    ExecuteCountQuery,
    LoadRawResults,
}

impl QueryMethod {
    /// Every instrumented entry point.
    pub const ALL: [QueryMethod; 3] = [
        QueryMethod::Stream,
        QueryMethod::ExecuteCountQuery,
        QueryMethod::LoadRawResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMethod::Stream => "stream",
            QueryMethod::ExecuteCountQuery => "execute_count_query",
            QueryMethod::LoadRawResults => "load_raw_results",
        }
    }
}

impl std::fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A built query that can be executed.
///
/// Results must be serializable so they can be attached to the span as the
/// `db_response` annotation.
#[async_trait]
pub trait QueryBuilder: Send + Sync {
    /// Output of [`QueryBuilder::stream`].
    type Streamed: Serialize + Send;
    /// A row as returned by [`QueryBuilder::load_raw_results`].
    type RawRow: Serialize + Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Table or resource the query targets, e.g. `order`.
    fn main_table_name(&self) -> String;

    /// Rendered SQL (or operation text) of the query.
    fn sql(&self) -> String;

    async fn stream(&self) -> Result<Self::Streamed, Self::Error>;

    async fn execute_count_query(&self) -> Result<u64, Self::Error>;

    async fn load_raw_results(&self) -> Result<Vec<Self::RawRow>, Self::Error>;

    /// Whether the execution methods already record spans.
    fn is_instrumented(&self) -> bool {
        false
    }
}

/// A per-entity handle that creates query builders.
pub trait Repository: Send + Sync {
    type QueryBuilder: QueryBuilder;

    fn create_query_builder(&self) -> Self::QueryBuilder;

    fn is_instrumented(&self) -> bool {
        false
    }
}

/// A connection that hands out repositories.
pub trait DataSource: Send + Sync {
    type Repository: Repository;

    /// Acquire the repository for `entity`.
    fn get_repository(&self, entity: &str) -> Self::Repository;

    fn is_instrumented(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_method_names() {
        let names: Vec<&str> = QueryMethod::ALL.iter().map(QueryMethod::as_str).collect();
        assert_eq!(names, ["stream", "execute_count_query", "load_raw_results"]);
        assert_eq!(QueryMethod::LoadRawResults.to_string(), "load_raw_results");
    }
}

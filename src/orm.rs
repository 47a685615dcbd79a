//! SeaORM implementation of the data-access capability traits.
//!
//! Rows are loaded as JSON objects, so any table can be queried through a
//! repository without generated entity models, and results serialize straight
//! into the `db_response` annotation.
//!
//! ```rust,ignore
//! use sea_orm::Database;
//! use orm_zipkin_tracing::prelude::*;
//! use orm_zipkin_tracing::orm::{table_of, SeaOrmSource};
//!
//! let db = Database::connect("postgres://localhost/mydb").await?;
//! let traced = SeaOrmSource::new(db).with_tracing(&config);
//!
//! let orders = traced
//!     .get_repository(&table_of::<order::Entity>())
//!     .create_query_builder()
//!     .map(|q| q.limit(10))
//!     .stream()
//!     .await?;
//! ```

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sea_orm::sea_query::{Alias, Asterisk, IntoCondition, Query, SelectStatement};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, FromQueryResult, Statement,
};
use serde_json::Value as JsonValue;

use crate::access::{DataSource, QueryBuilder, Repository};
use crate::parser;

const COUNT_ALIAS: &str = "num_items";

/// Table name of a SeaORM entity, for [`DataSource::get_repository`].
pub fn table_of<E: EntityTrait>() -> String {
    E::default().table_name().to_owned()
}

/// A [`DataSource`] over a SeaORM `DatabaseConnection`.
#[derive(Debug, Clone)]
pub struct SeaOrmSource {
    conn: DatabaseConnection,
}

impl SeaOrmSource {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn into_inner(self) -> DatabaseConnection {
        self.conn
    }
}

impl From<DatabaseConnection> for SeaOrmSource {
    fn from(conn: DatabaseConnection) -> Self {
        Self::new(conn)
    }
}

impl DataSource for SeaOrmSource {
    type Repository = SeaOrmRepository;

    fn get_repository(&self, entity: &str) -> SeaOrmRepository {
        SeaOrmRepository {
            conn: self.conn.clone(),
            table: entity.to_owned(),
        }
    }
}

/// Repository for one table.
#[derive(Debug, Clone)]
pub struct SeaOrmRepository {
    conn: DatabaseConnection,
    table: String,
}

impl SeaOrmRepository {
    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Repository for SeaOrmRepository {
    type QueryBuilder = SeaOrmQuery;

    fn create_query_builder(&self) -> SeaOrmQuery {
        SeaOrmQuery {
            conn: self.conn.clone(),
            table: self.table.clone(),
            source: QuerySource::Select(select_all(&self.table)),
        }
    }
}

#[derive(Debug, Clone)]
enum QuerySource {
    Select(SelectStatement),
    Raw(Statement),
}

/// A query over a repository's table, built with `sea_query` or given as a
/// raw statement.
#[derive(Debug, Clone)]
pub struct SeaOrmQuery {
    conn: DatabaseConnection,
    table: String,
    source: QuerySource,
}

impl SeaOrmQuery {
    /// Add a `WHERE` condition. Ignored for raw statements.
    pub fn filter<C: IntoCondition>(mut self, condition: C) -> Self {
        if let Some(select) = self.select_mut() {
            select.cond_where(condition);
        }
        self
    }

    /// Ignored for raw statements.
    pub fn limit(mut self, limit: u64) -> Self {
        if let Some(select) = self.select_mut() {
            select.limit(limit);
        }
        self
    }

    /// Ignored for raw statements.
    pub fn offset(mut self, offset: u64) -> Self {
        if let Some(select) = self.select_mut() {
            select.offset(offset);
        }
        self
    }

    /// Replace the query with a raw statement.
    pub fn with_statement(mut self, statement: Statement) -> Self {
        self.source = QuerySource::Raw(statement);
        self
    }

    /// The underlying select, unless the query is a raw statement.
    pub fn select_mut(&mut self) -> Option<&mut SelectStatement> {
        match &mut self.source {
            QuerySource::Select(select) => Some(select),
            QuerySource::Raw(_) => None,
        }
    }

    pub fn statement(&self) -> Statement {
        match &self.source {
            QuerySource::Select(select) => self.conn.get_database_backend().build(select),
            QuerySource::Raw(statement) => statement.clone(),
        }
    }
}

#[async_trait]
impl QueryBuilder for SeaOrmQuery {
    type Streamed = Vec<JsonValue>;
    type RawRow = JsonValue;
    type Error = DbErr;

    /// For raw statements, the table named in the SQL if one can be parsed.
    fn main_table_name(&self) -> String {
        match &self.source {
            QuerySource::Select(_) => self.table.clone(),
            QuerySource::Raw(statement) => {
                parser::extract_table(&statement.sql).unwrap_or_else(|| self.table.clone())
            }
        }
    }

    fn sql(&self) -> String {
        self.statement().sql
    }

    /// Drains the row stream into JSON rows.
    async fn stream(&self) -> Result<Vec<JsonValue>, DbErr> {
        let rows = JsonValue::find_by_statement(self.statement())
            .stream(&self.conn)
            .await?;
        rows.try_collect().await
    }

    async fn execute_count_query(&self) -> Result<u64, DbErr> {
        let row = JsonValue::find_by_statement(count_statement(&self.statement()))
            .one(&self.conn)
            .await?;

        Ok(row
            .as_ref()
            .and_then(|row| row.get(COUNT_ALIAS))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0))
    }

    async fn load_raw_results(&self) -> Result<Vec<JsonValue>, DbErr> {
        JsonValue::find_by_statement(self.statement())
            .all(&self.conn)
            .await
    }
}

fn select_all(table: &str) -> SelectStatement {
    Query::select()
        .column(Asterisk)
        .from(Alias::new(table))
        .to_owned()
}

/// Wrap `statement` in a `COUNT(*)` sub-select, keeping its bound values.
fn count_statement(statement: &Statement) -> Statement {
    Statement {
        sql: format!(
            "SELECT COUNT(*) AS {COUNT_ALIAS} FROM ({}) AS sub_query",
            statement.sql
        ),
        values: statement.values.clone(),
        db_backend: statement.db_backend,
    }
}

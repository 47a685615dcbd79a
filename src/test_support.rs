//! In-memory tracer and data source shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Barrier;

use crate::access::{DataSource, QueryBuilder, Repository};
use crate::context::TraceContext;
use crate::tracer::{Annotation, RecordError, Tracer};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Entry {
    Record(TraceContext, Annotation),
    Marker(String),
}

pub(crate) type Journal = Arc<Mutex<Vec<Entry>>>;

/// Keeps every annotation, interleaved with markers pushed by
/// [`MemoryQuery`] executions.
#[derive(Default)]
pub(crate) struct RecordingTracer {
    current: Mutex<Option<TraceContext>>,
    journal: Journal,
}

impl RecordingTracer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub(crate) fn entries(&self) -> Vec<Entry> {
        self.journal.lock().clone()
    }

    pub(crate) fn records(&self) -> Vec<(TraceContext, Annotation)> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Record(id, annotation) => Some((id, annotation)),
                Entry::Marker(_) => None,
            })
            .collect()
    }

    pub(crate) fn records_for(&self, id: &TraceContext) -> Vec<Annotation> {
        self.records()
            .into_iter()
            .filter(|(span, _)| span == id)
            .map(|(_, annotation)| annotation)
            .collect()
    }

    /// Distinct span identities in first-seen order.
    pub(crate) fn span_ids(&self) -> Vec<TraceContext> {
        let mut ids: Vec<TraceContext> = Vec::new();
        for (id, _) in self.records() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

impl Tracer for RecordingTracer {
    fn current_id(&self) -> Option<TraceContext> {
        *self.current.lock()
    }

    fn set_id(&self, id: TraceContext) {
        *self.current.lock() = Some(id);
    }

    fn record(&self, id: &TraceContext, annotation: Annotation) -> Result<(), RecordError> {
        self.journal.lock().push(Entry::Record(*id, annotation));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub(crate) struct MemoryError(pub String);

#[derive(Clone, Default)]
struct Behaviour {
    journal: Option<Journal>,
    failure: Option<String>,
    gate: Option<Arc<Barrier>>,
}

/// Tables of JSON rows keyed by lower-cased entity name.
#[derive(Clone, Default)]
pub(crate) struct MemorySource {
    tables: HashMap<String, Vec<JsonValue>>,
    behaviour: Behaviour,
}

impl MemorySource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_table(mut self, name: &str, rows: Vec<JsonValue>) -> Self {
        self.tables.insert(name.to_lowercase(), rows);
        self
    }

    /// Push `<method>:start` / `<method>:end` markers around executions.
    pub(crate) fn with_journal(mut self, journal: Journal) -> Self {
        self.behaviour.journal = Some(journal);
        self
    }

    pub(crate) fn failing(mut self, message: &str) -> Self {
        self.behaviour.failure = Some(message.to_string());
        self
    }

    /// Every execution waits on `gate` before completing.
    pub(crate) fn with_gate(mut self, gate: Arc<Barrier>) -> Self {
        self.behaviour.gate = Some(gate);
        self
    }
}

impl DataSource for MemorySource {
    type Repository = MemoryRepository;

    fn get_repository(&self, entity: &str) -> MemoryRepository {
        let table = entity.to_lowercase();
        MemoryRepository {
            rows: self.tables.get(&table).cloned().unwrap_or_default(),
            table,
            behaviour: self.behaviour.clone(),
        }
    }
}

pub(crate) struct MemoryRepository {
    table: String,
    rows: Vec<JsonValue>,
    behaviour: Behaviour,
}

impl Repository for MemoryRepository {
    type QueryBuilder = MemoryQuery;

    fn create_query_builder(&self) -> MemoryQuery {
        MemoryQuery {
            table: self.table.clone(),
            rows: self.rows.clone(),
            limit: None,
            behaviour: self.behaviour.clone(),
        }
    }
}

pub(crate) struct MemoryQuery {
    table: String,
    rows: Vec<JsonValue>,
    limit: Option<usize>,
    behaviour: Behaviour,
}

impl MemoryQuery {
    pub(crate) fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn set_limit(&mut self, limit: usize) {
        self.limit = Some(limit);
    }

    fn mark(&self, marker: String) {
        if let Some(journal) = &self.behaviour.journal {
            journal.lock().push(Entry::Marker(marker));
        }
    }

    async fn run(&self, method: &str) -> Result<Vec<JsonValue>, MemoryError> {
        self.mark(format!("{method}:start"));
        if let Some(gate) = &self.behaviour.gate {
            gate.wait().await;
        }
        self.mark(format!("{method}:end"));

        match &self.behaviour.failure {
            Some(message) => Err(MemoryError(message.clone())),
            None => Ok(self
                .rows
                .iter()
                .take(self.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()),
        }
    }
}

#[async_trait]
impl QueryBuilder for MemoryQuery {
    type Streamed = Vec<JsonValue>;
    type RawRow = JsonValue;
    type Error = MemoryError;

    fn main_table_name(&self) -> String {
        self.table.clone()
    }

    fn sql(&self) -> String {
        match self.limit {
            Some(limit) => format!("SELECT * FROM \"{}\" LIMIT {limit}", self.table),
            None => format!("SELECT * FROM \"{}\"", self.table),
        }
    }

    async fn stream(&self) -> Result<Vec<JsonValue>, MemoryError> {
        self.run("stream").await
    }

    async fn execute_count_query(&self) -> Result<u64, MemoryError> {
        self.run("execute_count_query")
            .await
            .map(|rows| rows.len() as u64)
    }

    async fn load_raw_results(&self) -> Result<Vec<JsonValue>, MemoryError> {
        self.run("load_raw_results").await
    }
}

//! Instrumenting decorators for data sources, repositories and query builders.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::access::{DataSource, QueryBuilder, QueryMethod, Repository};
use crate::config::TraceConfig;
use crate::context::{Extractor, TraceContext};
use crate::lifecycle::SpanLifecycle;
use crate::TARGET;

/// Wrap `source` so that every query executed through it records a span.
///
/// The returned [`TracedSource`] is a pass-through that records nothing when
/// `config` has no tracer or `source` is already instrumented. Otherwise, if
/// `inbound` carries a well-formed B3 context, every query span of the
/// returned source is a child of it, independent of other sources sharing the
/// same tracer. The context is also handed to the tracer through `set_id`.
///
/// # Example
///
/// ```rust,ignore
/// use orm_zipkin_tracing::{instrument, DataSource, QueryBuilder, Repository, TraceConfig};
///
/// let traced = instrument(source, &config, Some(&request_headers));
/// let rows = traced.get_repository("order").create_query_builder().stream().await?;
/// ```
pub fn instrument<D: DataSource>(
    source: D,
    config: &TraceConfig,
    inbound: Option<&dyn Extractor>,
) -> TracedSource<D> {
    if source.is_instrumented() {
        tracing::debug!(target: TARGET, "Data source already instrumented");
        return TracedSource::passthrough(source);
    }

    let Some(mut lifecycle) = SpanLifecycle::from_config(config) else {
        tracing::debug!(target: TARGET, "No tracer configured, instrumentation disabled");
        return TracedSource::passthrough(source);
    };

    if let Some(context) = inbound.and_then(|carrier| TraceContext::extract(carrier)) {
        tracing::debug!(
            target: TARGET,
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
            "Joining inbound trace"
        );
        let tracer = lifecycle.tracer();
        if panic::catch_unwind(AssertUnwindSafe(|| tracer.set_id(context))).is_err() {
            tracing::warn!(target: TARGET, "Tracer panicked setting the inbound context");
        }
        lifecycle = lifecycle.with_inbound(context);
    }

    TracedSource {
        inner: source,
        lifecycle: Some(Arc::new(lifecycle)),
    }
}

/// Extension trait for easy wrapping of data sources.
pub trait TracingExt: DataSource + Sized {
    /// Wrap this data source with tracing instrumentation.
    fn with_tracing(self, config: &TraceConfig) -> TracedSource<Self> {
        instrument(self, config, None)
    }

    /// Wrap this data source, joining the trace carried by `inbound`.
    fn with_tracing_context(self, config: &TraceConfig, inbound: &dyn Extractor) -> TracedSource<Self> {
        instrument(self, config, Some(inbound))
    }
}

impl<D: DataSource> TracingExt for D {}

/// A traced wrapper around a [`DataSource`].
///
/// Repositories acquired through it create [`TracedQueryBuilder`]s. Every
/// other method of the wrapped source is reachable through `Deref`.
#[derive(Debug, Clone)]
pub struct TracedSource<D> {
    inner: D,
    lifecycle: Option<Arc<SpanLifecycle>>,
}

impl<D> TracedSource<D> {
    fn passthrough(inner: D) -> Self {
        Self {
            inner,
            lifecycle: None,
        }
    }

    /// Get a reference to the wrapped source.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Consume the wrapper and return the wrapped source.
    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Whether this wrapper records spans itself.
    pub fn is_active(&self) -> bool {
        self.lifecycle.is_some()
    }
}

impl<D: DataSource> DataSource for TracedSource<D> {
    type Repository = TracedRepository<D::Repository>;

    fn get_repository(&self, entity: &str) -> Self::Repository {
        TracedRepository::new(self.inner.get_repository(entity), self.lifecycle.clone())
    }

    fn is_instrumented(&self) -> bool {
        self.lifecycle.is_some() || self.inner.is_instrumented()
    }
}

impl<D> Deref for TracedSource<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.inner
    }
}

/// A traced wrapper around a [`Repository`].
#[derive(Debug, Clone)]
pub struct TracedRepository<R> {
    inner: R,
    lifecycle: Option<Arc<SpanLifecycle>>,
}

impl<R: Repository> TracedRepository<R> {
    /// Wrap `inner`. An already instrumented repository is passed through.
    pub fn new(inner: R, lifecycle: Option<Arc<SpanLifecycle>>) -> Self {
        let lifecycle = lifecycle.filter(|_| !inner.is_instrumented());
        Self { inner, lifecycle }
    }
}

impl<R> TracedRepository<R> {
    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Repository> Repository for TracedRepository<R> {
    type QueryBuilder = TracedQueryBuilder<R::QueryBuilder>;

    fn create_query_builder(&self) -> Self::QueryBuilder {
        TracedQueryBuilder::new(self.inner.create_query_builder(), self.lifecycle.clone())
    }

    fn is_instrumented(&self) -> bool {
        self.lifecycle.is_some() || self.inner.is_instrumented()
    }
}

impl<R> Deref for TracedRepository<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.inner
    }
}

/// A traced wrapper around a [`QueryBuilder`].
///
/// `stream`, `execute_count_query` and `load_raw_results` record a span;
/// `main_table_name` and `sql` are forwarded. Builder methods of the wrapped
/// query are reachable through `DerefMut`, or through [`TracedQueryBuilder::map`]
/// for builders that chain by value.
#[derive(Debug, Clone)]
pub struct TracedQueryBuilder<Q> {
    inner: Q,
    lifecycle: Option<Arc<SpanLifecycle>>,
}

impl<Q: QueryBuilder> TracedQueryBuilder<Q> {
    /// Wrap `inner`. An already instrumented builder is passed through.
    pub fn new(inner: Q, lifecycle: Option<Arc<SpanLifecycle>>) -> Self {
        let lifecycle = lifecycle.filter(|_| !inner.is_instrumented());
        Self { inner, lifecycle }
    }

    async fn intercept<C, F, T>(&self, method: QueryMethod, call: C) -> Result<T, Q::Error>
    where
        C: FnOnce() -> F,
        F: Future<Output = Result<T, Q::Error>>,
        T: Serialize,
    {
        match &self.lifecycle {
            Some(lifecycle) => {
                let table = self.inner.main_table_name();
                let sql = self.inner.sql();
                lifecycle.observe(method, &table, &sql, call).await
            }
            None => call().await,
        }
    }
}

impl<Q> TracedQueryBuilder<Q> {
    /// Apply a by-value builder step to the wrapped query, keeping the
    /// instrumentation.
    pub fn map(self, f: impl FnOnce(Q) -> Q) -> Self {
        Self {
            inner: f(self.inner),
            lifecycle: self.lifecycle,
        }
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    pub fn into_inner(self) -> Q {
        self.inner
    }
}

#[async_trait]
impl<Q: QueryBuilder> QueryBuilder for TracedQueryBuilder<Q> {
    type Streamed = Q::Streamed;
    type RawRow = Q::RawRow;
    type Error = Q::Error;

    fn main_table_name(&self) -> String {
        self.inner.main_table_name()
    }

    fn sql(&self) -> String {
        self.inner.sql()
    }

    async fn stream(&self) -> Result<Q::Streamed, Q::Error> {
        self.intercept(QueryMethod::Stream, || self.inner.stream())
            .await
    }

    async fn execute_count_query(&self) -> Result<u64, Q::Error> {
        self.intercept(QueryMethod::ExecuteCountQuery, || self.inner.execute_count_query())
            .await
    }

    async fn load_raw_results(&self) -> Result<Vec<Q::RawRow>, Q::Error> {
        self.intercept(QueryMethod::LoadRawResults, || self.inner.load_raw_results())
            .await
    }

    fn is_instrumented(&self) -> bool {
        self.lifecycle.is_some() || self.inner.is_instrumented()
    }
}

impl<Q> Deref for TracedQueryBuilder<Q> {
    type Target = Q;

    fn deref(&self) -> &Q {
        &self.inner
    }
}

impl<Q> DerefMut for TracedQueryBuilder<Q> {
    fn deref_mut(&mut self) -> &mut Q {
        &mut self.inner
    }
}

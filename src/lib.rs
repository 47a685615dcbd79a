//! # orm-zipkin-tracing
//!
//! Zipkin-style span instrumentation for ORM query builders.
//!
//! Wrap a data source once per request and every query executed through it
//! records a client span: service and RPC names, the SQL text, send/receive
//! annotations and the outcome. Spans join the inbound request's B3 trace when
//! one is supplied.
//!
//! ## Features
//!
//! - **Transparent Wrapping**: `TracedSource` hands out repositories and query builders that behave exactly like the originals
//! - **Exactly Once**: Wrapping an already instrumented source, repository or builder is a no-op
//! - **Trace Correlation**: Inbound B3 headers (multi or single header) become the parent of every query span
//! - **Fail Open**: Tracer errors and panics are logged, never surfaced to the caller
//! - **SeaORM Adapter**: `orm::SeaOrmSource` instruments a `DatabaseConnection`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sea_orm::Database;
//! use orm_zipkin_tracing::orm::SeaOrmSource;
//! use orm_zipkin_tracing::prelude::*;
//!
//! let config = TraceConfig::new(Arc::new(TracingTracer::new()))
//!     .with_service_name("orders-svc")
//!     .with_local_port(8080);
//!
//! let db = Database::connect("postgres://localhost/mydb").await?;
//! let traced = SeaOrmSource::new(db).with_tracing_context(&config, &request_headers);
//!
//! let rows = traced.get_repository("order").create_query_builder().stream().await?;
//! ```
//!
//! ## Span Annotations
//!
//! | Annotation | When | Value |
//! |------------|------|-------|
//! | service name | send | `TraceConfig::service_name` |
//! | rpc | send | `db(<table>)` |
//! | `db_sql` | send | Rendered SQL |
//! | `cs` | send | Client send |
//! | local address | send | `TraceConfig::local_port` |
//! | `X-B3-Flags` | send | `"true"`, debug traces only |
//! | server address | send | `TraceConfig::remote_service`, when set |
//! | `db_end` | receive | `"Succeed"` or `"Error"` |
//! | `db_response` | receive | JSON result (if enabled) or error message |
//! | `cr` | receive | Client receive |

mod access;
mod bridge;
mod config;
mod context;
mod lifecycle;
pub mod orm;
mod parser;
mod proxy;
mod tracer;

#[cfg(test)]
mod test_support;

pub(crate) const TARGET: &str = "orm_zipkin_tracing";

pub use access::{DataSource, QueryBuilder, QueryMethod, Repository};
pub use bridge::TracingTracer;
pub use config::{RemoteService, TraceConfig};
pub use context::{headers, ContextError, Extractor, SpanId, TraceContext, TraceId};
pub use lifecycle::{QuerySpan, SpanLifecycle};
pub use parser::{ParsedSql, SqlOperation};
pub use proxy::{instrument, TracedQueryBuilder, TracedRepository, TracedSource, TracingExt};
pub use tracer::{keys, scoped, Annotation, HostAddr, RecordError, Scope, Tracer};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        instrument, DataSource, QueryBuilder, Repository, TraceConfig, TracingExt, TracingTracer,
    };
}

//! Per-query span protocol.
//!
//! Every instrumented call goes through the same sequence:
//!
//! ```text
//! create child id -> annotate send side -> run query -> annotate outcome
//! ```
//!
//! [`QuerySpan`] encodes that as a typestate: [`SpanLifecycle::start`] records
//! the send side and hands back a span whose only transition,
//! [`QuerySpan::finish`], consumes it.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crate::access::QueryMethod;
use crate::config::TraceConfig;
use crate::context::TraceContext;
use crate::parser;
use crate::tracer::{keys, scoped, Annotation, Tracer};
use crate::TARGET;

/// Records spans around query executions for one configuration.
pub struct SpanLifecycle {
    tracer: Arc<dyn Tracer>,
    config: TraceConfig,
    server_addr: Option<Annotation>,
    inbound: Option<TraceContext>,
}

impl fmt::Debug for SpanLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanLifecycle")
            .field("config", &self.config)
            .field("inbound", &self.inbound)
            .finish_non_exhaustive()
    }
}

impl SpanLifecycle {
    /// Returns `None` when the configuration carries no tracer.
    pub fn from_config(config: &TraceConfig) -> Option<Self> {
        let tracer = config.tracer.clone()?;
        Some(Self {
            tracer,
            server_addr: config.remote_service.as_ref().map(|remote| remote.to_annotation()),
            config: config.clone(),
            inbound: None,
        })
    }

    /// Parent every query span on `context` instead of the tracer's current
    /// identity.
    pub fn with_inbound(mut self, context: TraceContext) -> Self {
        self.inbound = Some(context);
        self
    }

    pub fn inbound(&self) -> Option<&TraceContext> {
        self.inbound.as_ref()
    }

    pub fn tracer(&self) -> &dyn Tracer {
        &*self.tracer
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Derive a child span and record the send-side annotations.
    ///
    /// The child derives from the inbound context when there is one, and
    /// from the tracer's current identity otherwise.
    pub fn start(&self, method: QueryMethod, table: &str, sql: &str) -> QuerySpan<'_> {
        let id = match &self.inbound {
            Some(inbound) => inbound.child(),
            None => self.child_of_current(),
        };
        let rpc = rpc_name(table, sql);

        scoped(self.tracer(), id, |scope| {
            scope.record_service_name(&self.config.service_name);
            scope.record_rpc(&rpc);
            scope.record_binary(keys::DB_SQL, sql);
            scope.record(Annotation::ClientSend);
            scope.record(Annotation::LocalAddr {
                port: self.config.local_port,
            });

            if id.is_debug() {
                scope.record_binary(keys::FLAGS, "true");
            }

            if let Some(server_addr) = &self.server_addr {
                scope.record(server_addr.clone());
            }
        });

        tracing::debug!(
            target: TARGET,
            trace_id = %id.trace_id(),
            span_id = %id.span_id(),
            db.method = method.as_str(),
            rpc = %rpc,
            "Query span started"
        );

        QuerySpan {
            lifecycle: self,
            id,
            method,
        }
    }

    /// Run `call` inside a span.
    ///
    /// `call` is only invoked after the send side has been recorded. Its
    /// output is returned as-is. Dropping the returned future before the
    /// query completes leaves the span open, without `db_end` or `cr`.
    pub async fn observe<C, F, T, E>(
        &self,
        method: QueryMethod,
        table: &str,
        sql: &str,
        call: C,
    ) -> Result<T, E>
    where
        C: FnOnce() -> F,
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: fmt::Display,
    {
        let span = self.start(method, table, sql);
        let result = call().await;
        span.finish(&result);
        result
    }

    fn child_of_current(&self) -> TraceContext {
        panic::catch_unwind(AssertUnwindSafe(|| self.tracer.create_child_id())).unwrap_or_else(|_| {
            tracing::warn!(target: TARGET, "Tracer panicked deriving a child id");
            TraceContext::root()
        })
    }

    fn render_response<T: Serialize>(&self, value: &T) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(body) => Some(self.cap(body)),
            Err(error) => {
                tracing::warn!(
                    target: TARGET,
                    error = %error,
                    "Failed to serialize query response"
                );
                None
            }
        }
    }

    fn cap(&self, mut body: String) -> String {
        if let Some(max) = self.config.max_response_len {
            if body.len() > max {
                let mut end = max;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
        }
        body
    }
}

/// A span whose send side has been recorded.
#[must_use = "a query span records nothing on completion unless finished"]
pub struct QuerySpan<'a> {
    lifecycle: &'a SpanLifecycle,
    id: TraceContext,
    method: QueryMethod,
}

impl QuerySpan<'_> {
    pub fn id(&self) -> &TraceContext {
        &self.id
    }

    /// Record the outcome and close the span.
    pub fn finish<T: Serialize, E: fmt::Display>(self, result: &Result<T, E>) {
        let lifecycle = self.lifecycle;

        scoped(lifecycle.tracer(), self.id, |scope| match result {
            Ok(value) => {
                scope.record_binary(keys::DB_END, "Succeed");
                if lifecycle.config.annotate_response {
                    if let Some(body) = lifecycle.render_response(value) {
                        scope.record_binary(keys::DB_RESPONSE, body);
                    }
                }
                scope.record(Annotation::ClientRecv);
            }
            Err(error) => {
                scope.record_binary(keys::DB_END, "Error");
                scope.record_binary(keys::DB_RESPONSE, lifecycle.cap(error.to_string()));
                scope.record(Annotation::ClientRecv);
            }
        });

        match result {
            Ok(_) => tracing::debug!(
                target: TARGET,
                span_id = %self.id.span_id(),
                db.method = self.method.as_str(),
                "Query span finished"
            ),
            Err(error) => tracing::error!(
                target: TARGET,
                span_id = %self.id.span_id(),
                db.method = self.method.as_str(),
                error = %error,
                "Database query failed"
            ),
        }
    }
}

/// `db(<table>)`, falling back to the table parsed from the SQL.
fn rpc_name(table: &str, sql: &str) -> String {
    if !table.is_empty() {
        return format!("db({table})");
    }
    match parser::extract_table(sql) {
        Some(table) => format!("db({table})"),
        None => "db(unknown)".to_string(),
    }
}

//! A [`Tracer`] that forwards annotations to the `tracing` ecosystem.

use parking_lot::RwLock;

use crate::context::TraceContext;
use crate::parser::ParsedSql;
use crate::tracer::{keys, Annotation, RecordError, Tracer};
use crate::TARGET;

/// Emits every annotation as a `tracing` event carrying the span identity.
///
/// Whatever subscriber is installed decides where the events go. `db_sql`
/// annotations are classified so that events carry `db.operation` and
/// `db.sql.table` alongside the statement.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use orm_zipkin_tracing::{TraceConfig, TracingTracer};
///
/// let config = TraceConfig::new(Arc::new(TracingTracer::new()));
/// ```
#[derive(Debug, Default)]
pub struct TracingTracer {
    current: RwLock<Option<TraceContext>>,
}

impl TracingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `context` as the current identity.
    pub fn with_context(context: TraceContext) -> Self {
        Self {
            current: RwLock::new(Some(context)),
        }
    }
}

impl Tracer for TracingTracer {
    fn current_id(&self) -> Option<TraceContext> {
        *self.current.read()
    }

    fn set_id(&self, id: TraceContext) {
        *self.current.write() = Some(id);
    }

    fn record(&self, id: &TraceContext, annotation: Annotation) -> Result<(), RecordError> {
        let trace_id = id.trace_id();
        let span_id = id.span_id();
        let parent_id = id.parent_id();

        match annotation {
            Annotation::ServiceName(name) => tracing::debug!(
                target: TARGET,
                %trace_id,
                %span_id,
                service.name = %name,
                "service name"
            ),
            Annotation::Rpc(name) => tracing::debug!(
                target: TARGET,
                %trace_id,
                %span_id,
                otel.name = %name,
                "rpc"
            ),
            Annotation::Binary { key, value } if key == keys::DB_SQL => {
                let parsed = ParsedSql::parse(&value);
                tracing::debug!(
                    target: TARGET,
                    %trace_id,
                    %span_id,
                    db.operation = %parsed.operation,
                    db.sql.table = parsed.table.as_deref().unwrap_or_default(),
                    db.statement = %value,
                    "{}",
                    parsed.span_name()
                )
            }
            Annotation::Binary { key, value } if key == keys::DB_END && value == "Error" => {
                tracing::warn!(target: TARGET, %trace_id, %span_id, otel.status_code = "ERROR", "db_end")
            }
            Annotation::Binary { key, value } => tracing::debug!(
                target: TARGET,
                %trace_id,
                %span_id,
                annotation.key = %key,
                annotation.value = %value,
                "binary annotation"
            ),
            Annotation::ClientSend => tracing::info!(
                target: TARGET,
                %trace_id,
                %span_id,
                parent_id = ?parent_id.map(|p| p.to_string()),
                debug = id.is_debug(),
                "cs"
            ),
            Annotation::ClientRecv => tracing::info!(target: TARGET, %trace_id, %span_id, "cr"),
            Annotation::LocalAddr { port } => tracing::debug!(
                target: TARGET,
                %trace_id,
                %span_id,
                local.port = port,
                "local address"
            ),
            Annotation::ServerAddr {
                service_name,
                host,
                port,
            } => tracing::debug!(
                target: TARGET,
                %trace_id,
                %span_id,
                peer.service = ?service_name,
                server.address = ?host.map(|h| h.to_string()),
                server.port = ?port,
                "server address"
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::HostAddr;

    #[test]
    fn test_current_id_round_trip() {
        let tracer = TracingTracer::new();
        assert_eq!(tracer.current_id(), None);

        let context = TraceContext::root();
        tracer.set_id(context);
        assert_eq!(tracer.current_id(), Some(context));

        let child = tracer.create_child_id();
        assert_eq!(child.parent_id(), Some(context.span_id()));
        assert_eq!(tracer.current_id(), Some(context));
    }

    #[test]
    fn test_records_every_annotation_kind() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("orm_zipkin_tracing=trace")
            .with_test_writer()
            .try_init();

        let context = TraceContext::root();
        let tracer = TracingTracer::with_context(context);
        let id = tracer.create_child_id();

        let annotations = [
            Annotation::ServiceName("orders-svc".to_string()),
            Annotation::Rpc("db(order)".to_string()),
            Annotation::binary(keys::DB_SQL, "SELECT * FROM \"order\""),
            Annotation::ClientSend,
            Annotation::LocalAddr { port: 8080 },
            Annotation::ServerAddr {
                service_name: Some("postgres".to_string()),
                host: Some(HostAddr::from("127.0.0.1")),
                port: Some(5432),
            },
            Annotation::binary(keys::DB_END, "Error"),
            Annotation::binary(keys::DB_RESPONSE, "timeout"),
            Annotation::ClientRecv,
        ];
        for annotation in annotations {
            assert!(tracer.record(&id, annotation).is_ok());
        }
    }
}

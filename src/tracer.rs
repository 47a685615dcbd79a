//! The tracer interface the instrumentation records into.
//!
//! The crate does not store or export spans. It derives span identities and
//! hands annotations to a [`Tracer`], which owns everything after that. Every
//! record call carries the identity it belongs to, so concurrent queries never
//! depend on a shared "current span" while annotating.

use std::fmt;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

use crate::context::TraceContext;

/// Binary annotation keys written by the query lifecycle.
pub mod keys {
    /// Rendered SQL of the query.
    pub const DB_SQL: &str = "db_sql";
    /// `"Succeed"` or `"Error"`.
    pub const DB_END: &str = "db_end";
    /// Serialized result, or the error message on failure.
    pub const DB_RESPONSE: &str = "db_response";
    /// Recorded when the span identity carries the debug flag.
    pub const FLAGS: &str = crate::context::headers::FLAGS;
}

/// Errors a tracer may report while recording.
///
/// These never reach the caller of an instrumented query; they are logged and
/// dropped.
#[derive(Debug, Clone, Error)]
pub enum RecordError {
    #[error("tracer is unavailable")]
    Unavailable,

    #[error("tracer rejected annotation: {0}")]
    Rejected(String),
}

/// Address of a network peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAddr {
    Ip(IpAddr),
    Name(String),
}

impl From<&str> for HostAddr {
    fn from(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => HostAddr::Ip(ip),
            Err(_) => HostAddr::Name(host.to_string()),
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddr::Ip(ip) => write!(f, "{ip}"),
            HostAddr::Name(name) => f.write_str(name),
        }
    }
}

/// A single annotation on a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    ServiceName(String),
    Rpc(String),
    Binary {
        key: String,
        value: String,
    },
    ClientSend,
    ClientRecv,
    LocalAddr {
        port: u16,
    },
    ServerAddr {
        service_name: Option<String>,
        host: Option<HostAddr>,
        port: Option<u16>,
    },
}

impl Annotation {
    pub fn binary(key: impl Into<String>, value: impl Into<String>) -> Self {
        Annotation::Binary {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Short name of the variant, used in log output.
    pub fn kind(&self) -> &'static str {
        match self {
            Annotation::ServiceName(_) => "service_name",
            Annotation::Rpc(_) => "rpc",
            Annotation::Binary { .. } => "binary",
            Annotation::ClientSend => "cs",
            Annotation::ClientRecv => "cr",
            Annotation::LocalAddr { .. } => "local_addr",
            Annotation::ServerAddr { .. } => "server_addr",
        }
    }
}

/// A Zipkin-style tracer.
///
/// Implementations own the ambient "current" identity and whatever storage
/// or transport completed spans go to.
pub trait Tracer: Send + Sync {
    /// The identity new child spans derive from, if one has been set.
    fn current_id(&self) -> Option<TraceContext>;

    /// Replace the current identity.
    fn set_id(&self, id: TraceContext);

    /// Derive a fresh child of the current identity, or a new root when
    /// there is none. Does not change the current identity.
    fn create_child_id(&self) -> TraceContext {
        match self.current_id() {
            Some(current) => current.child(),
            None => TraceContext::root(),
        }
    }

    /// Record one annotation against the span identified by `id`.
    fn record(&self, id: &TraceContext, annotation: Annotation) -> Result<(), RecordError>;
}

/// Records annotations against one span identity.
///
/// Obtained through [`scoped`]. Recording is fail-open: errors and panics
/// raised by the tracer are logged and swallowed.
pub struct Scope<'a> {
    tracer: &'a dyn Tracer,
    id: TraceContext,
}

impl<'a> Scope<'a> {
    pub fn id(&self) -> &TraceContext {
        &self.id
    }

    pub fn record(&self, annotation: Annotation) {
        let kind = annotation.kind();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.tracer.record(&self.id, annotation)
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(
                    target: crate::TARGET,
                    span_id = %self.id.span_id(),
                    annotation = kind,
                    error = %error,
                    "Failed to record annotation"
                );
            }
            Err(_) => {
                tracing::warn!(
                    target: crate::TARGET,
                    span_id = %self.id.span_id(),
                    annotation = kind,
                    "Tracer panicked while recording annotation"
                );
            }
        }
    }

    pub fn record_service_name(&self, name: impl Into<String>) {
        self.record(Annotation::ServiceName(name.into()));
    }

    pub fn record_rpc(&self, name: impl Into<String>) {
        self.record(Annotation::Rpc(name.into()));
    }

    pub fn record_binary(&self, key: impl Into<String>, value: impl Into<String>) {
        self.record(Annotation::binary(key, value));
    }
}

/// Run `body` with a [`Scope`] bound to `id`.
///
/// The tracer's current identity is neither read nor modified.
pub fn scoped<R>(tracer: &dyn Tracer, id: TraceContext, body: impl FnOnce(&Scope<'_>) -> R) -> R {
    body(&Scope { tracer, id })
}

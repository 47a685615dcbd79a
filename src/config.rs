//! Configuration for query span recording.

use std::fmt;
use std::sync::Arc;

use crate::tracer::{Annotation, HostAddr, Tracer};

/// The database (or other peer) queries are sent to.
///
/// Recorded on every span as a server-address annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteService {
    pub service_name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl RemoteService {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: Some(service_name.into()),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub(crate) fn to_annotation(&self) -> Annotation {
        Annotation::ServerAddr {
            service_name: self.service_name.clone(),
            host: self.host.as_deref().map(HostAddr::from),
            port: self.port,
        }
    }
}

/// Configuration options for query tracing.
///
/// Without a tracer, instrumentation is disabled and wrapped objects behave
/// exactly like the originals.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use orm_zipkin_tracing::{RemoteService, TraceConfig, TracingTracer};
///
/// let config = TraceConfig::new(Arc::new(TracingTracer::new()))
///     .with_service_name("orders-svc")
///     .with_local_port(8080)
///     .with_remote_service(RemoteService::new("postgres").with_host("10.0.0.7").with_port(5432));
/// ```
#[derive(Clone)]
pub struct TraceConfig {
    /// Tracer spans are recorded into. `None` disables instrumentation.
    pub tracer: Option<Arc<dyn Tracer>>,

    /// Local service name recorded on every span.
    /// Default: `"unknown"`
    pub service_name: String,

    /// Peer the queries go to.
    /// Default: `None`
    pub remote_service: Option<RemoteService>,

    /// Whether successful results are serialized into the `db_response`
    /// annotation.
    /// Default: `true`
    ///
    /// **Security Warning**: results are recorded in full and may contain
    /// sensitive data. See [`TraceConfig::with_max_response_len`].
    pub annotate_response: bool,

    /// Port recorded in the local-address annotation.
    /// Default: `0`
    pub local_port: u16,

    /// Upper bound in bytes for the `db_response` annotation.
    /// Default: `None` (unbounded)
    pub max_response_len: Option<usize>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            tracer: None,
            service_name: "unknown".to_string(),
            remote_service: None,
            annotate_response: true,
            local_port: 0,
            max_response_len: None,
        }
    }
}

impl fmt::Debug for TraceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceConfig")
            .field("tracer", &self.tracer.as_ref().map(|_| "<tracer>"))
            .field("service_name", &self.service_name)
            .field("remote_service", &self.remote_service)
            .field("annotate_response", &self.annotate_response)
            .field("local_port", &self.local_port)
            .field("max_response_len", &self.max_response_len)
            .finish()
    }
}

impl TraceConfig {
    /// Create an enabled configuration with default values.
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            tracer: Some(tracer),
            ..Self::default()
        }
    }

    /// Create a configuration that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.tracer.is_some()
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_remote_service(mut self, remote: RemoteService) -> Self {
        self.remote_service = Some(remote);
        self
    }

    /// Enable or disable recording of successful results.
    pub fn with_response_annotation(mut self, enabled: bool) -> Self {
        self.annotate_response = enabled;
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Truncate `db_response` annotations to at most `len` bytes.
    pub fn with_max_response_len(mut self, len: usize) -> Self {
        self.max_response_len = Some(len);
        self
    }

    /// Full response recording.
    ///
    /// **Warning**: Do not use in production as it records every result.
    pub fn development(tracer: Arc<dyn Tracer>) -> Self {
        Self::new(tracer)
    }

    /// Spans without result payloads. Error messages are capped at 1 KiB.
    pub fn production(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            annotate_response: false,
            max_response_len: Some(1024),
            ..Self::new(tracer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTracer;

    #[test]
    fn test_defaults() {
        let config = TraceConfig::default();
        assert!(!config.is_enabled());
        assert_eq!(config.service_name, "unknown");
        assert!(config.annotate_response);
        assert_eq!(config.local_port, 0);
        assert_eq!(config.remote_service, None);
        assert_eq!(config.max_response_len, None);
    }

    #[test]
    fn test_config_builder() {
        let config = TraceConfig::new(Arc::new(RecordingTracer::new()))
            .with_service_name("orders-svc")
            .with_local_port(8080)
            .with_response_annotation(false);

        assert!(config.is_enabled());
        assert_eq!(config.service_name, "orders-svc");
        assert_eq!(config.local_port, 8080);
        assert!(!config.annotate_response);
    }

    #[test]
    fn test_production_config() {
        let config = TraceConfig::production(Arc::new(RecordingTracer::new()));
        assert!(!config.annotate_response);
        assert_eq!(config.max_response_len, Some(1024));
    }

    #[test]
    fn test_remote_service_annotation() {
        let remote = RemoteService::new("postgres").with_host("10.0.0.7").with_port(5432);
        assert_eq!(
            remote.to_annotation(),
            Annotation::ServerAddr {
                service_name: Some("postgres".to_string()),
                host: Some(HostAddr::Ip("10.0.0.7".parse().unwrap())),
                port: Some(5432),
            }
        );
    }

    #[test]
    fn test_debug_hides_tracer() {
        let config = TraceConfig::new(Arc::new(RecordingTracer::new()));
        assert!(format!("{config:?}").contains("<tracer>"));
    }
}

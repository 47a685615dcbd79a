//! Trace identity and inbound B3 context extraction.
//!
//! A [`TraceContext`] is the identity a span is recorded under. Inbound
//! requests carry one in Zipkin B3 headers, either as the multi-header set
//! (`X-B3-TraceId`, `X-B3-SpanId`, ...) or as the single `b3` header:
//!
//! ```text
//! b3: {trace_id}-{span_id}[-{sampling}[-{parent_span_id}]]
//! ```
//!
//! Extraction is lenient: a carrier without the headers yields `None`, and a
//! carrier with malformed headers also yields `None` so that instrumentation
//! carries on with a fresh identity instead of failing the request.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::BuildHasher;
use std::str::FromStr;

use thiserror::Error;

/// B3 propagation header names.
pub mod headers {
    pub const TRACE_ID: &str = "X-B3-TraceId";
    pub const SPAN_ID: &str = "X-B3-SpanId";
    pub const PARENT_SPAN_ID: &str = "X-B3-ParentSpanId";
    pub const SAMPLED: &str = "X-B3-Sampled";
    pub const FLAGS: &str = "X-B3-Flags";
    /// Single-header encoding.
    pub const SINGLE: &str = "b3";
}

/// Errors raised while parsing an inbound trace context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("invalid trace id `{0}`: expected 16 or 32 lower-hex characters")]
    InvalidTraceId(String),

    #[error("invalid span id `{0}`: expected 16 lower-hex characters")]
    InvalidSpanId(String),

    #[error("missing span id for trace `{0}`")]
    MissingSpanId(String),

    #[error("invalid b3 header `{0}`")]
    InvalidSingleHeader(String),
}

/// A 64 or 128 bit trace identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId {
    high: u64,
    low: u64,
}

impl TraceId {
    /// Build a 64 bit trace id. Zero is not a valid id.
    pub fn new(low: u64) -> Option<Self> {
        (low != 0).then_some(Self { high: 0, low })
    }

    /// Build a 128 bit trace id.
    pub fn new_128(high: u64, low: u64) -> Option<Self> {
        (high != 0 || low != 0).then_some(Self { high, low })
    }

    fn random() -> Self {
        Self {
            high: 0,
            low: random_id(),
        }
    }

    pub fn is_128bit(&self) -> bool {
        self.high != 0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_128bit() {
            write!(f, "{:016x}{:016x}", self.high, self.low)
        } else {
            write!(f, "{:016x}", self.low)
        }
    }
}

impl FromStr for TraceId {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ContextError::InvalidTraceId(s.to_string());
        let id = match s.len() {
            16 => TraceId::new(parse_hex(s).ok_or_else(invalid)?),
            32 => {
                let (high, low) = s.split_at(16);
                TraceId::new_128(
                    parse_hex(high).ok_or_else(invalid)?,
                    parse_hex(low).ok_or_else(invalid)?,
                )
            }
            _ => None,
        };
        id.ok_or_else(invalid)
    }
}

/// A 64 bit span identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// Zero is not a valid id.
    pub fn new(id: u64) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    fn random() -> Self {
        Self(random_id())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(ContextError::InvalidSpanId(s.to_string()));
        }
        parse_hex(s)
            .and_then(SpanId::new)
            .ok_or_else(|| ContextError::InvalidSpanId(s.to_string()))
    }
}

/// The identity a span is recorded under.
///
/// Child contexts share the trace id, get a fresh span id and point back to
/// their parent. Sampling and debug decisions are inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceContext {
    trace_id: TraceId,
    span_id: SpanId,
    parent_id: Option<SpanId>,
    sampled: Option<bool>,
    debug: bool,
}

impl TraceContext {
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self {
            trace_id,
            span_id,
            parent_id: None,
            sampled: None,
            debug: false,
        }
    }

    /// Start a new trace with random ids and no sampling decision.
    pub fn root() -> Self {
        Self::new(TraceId::random(), SpanId::random())
    }

    /// Derive a child of this context.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            parent_id: Some(self.span_id),
            sampled: self.sampled,
            debug: self.debug,
        }
    }

    pub fn with_parent_id(mut self, parent_id: SpanId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = Some(sampled);
        self
    }

    /// Debug implies sampled.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        if debug {
            self.sampled = Some(true);
        }
        self
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn parent_id(&self) -> Option<SpanId> {
        self.parent_id
    }

    pub fn sampled(&self) -> Option<bool> {
        self.sampled
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Extract a context from an inbound carrier.
    ///
    /// Returns `None` both when no B3 headers are present and when they are
    /// malformed. Malformed headers are logged at debug level.
    pub fn extract<E: Extractor + ?Sized>(carrier: &E) -> Option<Self> {
        match Self::try_extract(carrier) {
            Ok(context) => context,
            Err(error) => {
                tracing::debug!(
                    target: crate::TARGET,
                    error = %error,
                    "Ignoring malformed inbound trace context"
                );
                None
            }
        }
    }

    /// Like [`TraceContext::extract`], but reports malformed headers.
    ///
    /// The multi-header form takes precedence over the single `b3` header.
    pub fn try_extract<E: Extractor + ?Sized>(carrier: &E) -> Result<Option<Self>, ContextError> {
        if let Some(trace_id) = carrier.get(headers::TRACE_ID) {
            return Self::from_multi_header(carrier, trace_id).map(Some);
        }
        match carrier.get(headers::SINGLE) {
            Some(value) => Self::from_single_header(value),
            None => Ok(None),
        }
    }

    fn from_multi_header<E: Extractor + ?Sized>(
        carrier: &E,
        trace_id: &str,
    ) -> Result<Self, ContextError> {
        let trace_id: TraceId = trace_id.trim().parse()?;
        let span_id: SpanId = carrier.get(headers::SPAN_ID)
            .ok_or_else(|| ContextError::MissingSpanId(trace_id.to_string()))?
            .trim()
            .parse()?;

        let mut context = Self::new(trace_id, span_id);
        if let Some(parent) = carrier.get(headers::PARENT_SPAN_ID) {
            context.parent_id = Some(parent.trim().parse()?);
        }
        context.sampled = carrier.get(headers::SAMPLED).and_then(parse_sampled);
        if carrier.get(headers::FLAGS).map(str::trim) == Some("1") {
            context = context.with_debug(true);
        }
        Ok(context)
    }

    fn from_single_header(value: &str) -> Result<Option<Self>, ContextError> {
        let value = value.trim();
        let parts: Vec<&str> = value.split('-').collect();
        match parts.as_slice() {
            // Sampling-only header: no identity to join.
            [flag] if matches!(*flag, "0" | "1" | "d") => Ok(None),
            [trace_id, span_id, rest @ ..] if rest.len() <= 2 => {
                let mut context = Self::new(trace_id.parse()?, span_id.parse()?);
                match rest.first().copied() {
                    Some("d") => context = context.with_debug(true),
                    Some(flag) => {
                        context.sampled = Some(parse_sampled(flag).ok_or_else(|| {
                            ContextError::InvalidSingleHeader(value.to_string())
                        })?)
                    }
                    None => {}
                }
                if let Some(parent) = rest.get(1) {
                    context.parent_id = Some(parent.parse()?);
                }
                Ok(Some(context))
            }
            _ => Err(ContextError::InvalidSingleHeader(value.to_string())),
        }
    }

    /// Render this context as B3 multi-headers for outgoing propagation.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (headers::TRACE_ID, self.trace_id.to_string()),
            (headers::SPAN_ID, self.span_id.to_string()),
        ];
        if let Some(parent) = self.parent_id {
            out.push((headers::PARENT_SPAN_ID, parent.to_string()));
        }
        if self.debug {
            out.push((headers::FLAGS, "1".to_string()));
        } else if let Some(sampled) = self.sampled {
            out.push((headers::SAMPLED, if sampled { "1" } else { "0" }.to_string()));
        }
        out
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.trace_id, self.span_id)
    }
}

/// A key/value carrier an inbound trace context can be read from.
///
/// Implemented for string maps and slices of string pairs. Header names
/// match case-insensitively.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key)
            .or_else(|| find_ignore_case(self.iter(), key))
            .map(String::as_str)
    }
}

impl Extractor for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        BTreeMap::get(self, key)
            .or_else(|| find_ignore_case(self.iter(), key))
            .map(String::as_str)
    }
}

impl<'a> Extractor for [(&'a str, &'a str)] {
    fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| *value)
    }
}

impl<'a, const N: usize> Extractor for [(&'a str, &'a str); N] {
    fn get(&self, key: &str) -> Option<&str> {
        Extractor::get(self.as_slice(), key)
    }
}

fn find_ignore_case<'m>(
    mut entries: impl Iterator<Item = (&'m String, &'m String)>,
    key: &str,
) -> Option<&'m String> {
    entries
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value)
}

fn parse_hex(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

fn parse_sampled(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn random_id() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carrier(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_multi_header() {
        let headers = carrier(&[
            ("X-B3-TraceId", "463ac35c9f6413ad48485a3953bb6124"),
            ("X-B3-SpanId", "a2fb4a1d1a96d312"),
            ("X-B3-ParentSpanId", "0020000000000001"),
            ("X-B3-Sampled", "1"),
        ]);

        let context = TraceContext::extract(&headers).expect("context");
        assert_eq!(context.trace_id().to_string(), "463ac35c9f6413ad48485a3953bb6124");
        assert_eq!(context.span_id().to_string(), "a2fb4a1d1a96d312");
        assert_eq!(context.parent_id().map(|p| p.as_u64()), Some(0x0020000000000001));
        assert_eq!(context.sampled(), Some(true));
        assert!(!context.is_debug());
    }

    #[test]
    fn test_extract_lowercase_headers_and_debug_flag() {
        let headers = carrier(&[
            ("x-b3-traceid", "48485a3953bb6124"),
            ("x-b3-spanid", "a2fb4a1d1a96d312"),
            ("x-b3-flags", "1"),
        ]);

        let context = TraceContext::extract(&headers).expect("context");
        assert!(context.is_debug());
        assert_eq!(context.sampled(), Some(true));
        assert!(!context.trace_id().is_128bit());
    }

    #[test]
    fn test_extract_mixed_case_headers_from_maps() {
        let pairs = [
            ("X-B3-Traceid", "48485a3953bb6124"),
            ("x-B3-SPANID", "a2fb4a1d1a96d312"),
            ("X-b3-sampled", "0"),
        ];

        let hashed = carrier(&pairs);
        let context = TraceContext::extract(&hashed).expect("context");
        assert_eq!(context.span_id().to_string(), "a2fb4a1d1a96d312");
        assert_eq!(context.sampled(), Some(false));

        let ordered: BTreeMap<String, String> = hashed.into_iter().collect();
        assert_eq!(TraceContext::extract(&ordered), Some(context));
    }

    #[test]
    fn test_extract_single_header() {
        let pairs = [("b3", "80f198ee56343ba864fe8b2a57d3eff7-e457b5a2e4d86bd1-1-05e3ac9a4f6e3b90")];
        let context = TraceContext::extract(&pairs[..]).expect("context");
        assert_eq!(context.span_id().to_string(), "e457b5a2e4d86bd1");
        assert_eq!(context.parent_id().map(|p| p.to_string()), Some("05e3ac9a4f6e3b90".to_string()));
        assert_eq!(context.sampled(), Some(true));

        let pairs = [("b3", "80f198ee56343ba8-e457b5a2e4d86bd1-d")];
        assert!(TraceContext::extract(&pairs[..]).expect("context").is_debug());

        let pairs = [("b3", "0")];
        assert_eq!(TraceContext::try_extract(&pairs[..]), Ok(None));
    }

    #[test]
    fn test_absent_context() {
        let headers = carrier(&[("content-type", "application/json")]);
        assert_eq!(TraceContext::try_extract(&headers), Ok(None));
    }

    #[test]
    fn test_malformed_context_is_ignored() {
        let headers = carrier(&[("X-B3-TraceId", "not-a-trace"), ("X-B3-SpanId", "a2fb4a1d1a96d312")]);
        assert!(matches!(
            TraceContext::try_extract(&headers),
            Err(ContextError::InvalidTraceId(_))
        ));
        assert_eq!(TraceContext::extract(&headers), None);

        let headers = carrier(&[("X-B3-TraceId", "48485a3953bb6124")]);
        assert!(matches!(
            TraceContext::try_extract(&headers),
            Err(ContextError::MissingSpanId(_))
        ));

        let headers = carrier(&[("X-B3-TraceId", "0000000000000000"), ("X-B3-SpanId", "a2fb4a1d1a96d312")]);
        assert_eq!(TraceContext::extract(&headers), None);

        let pairs = [("b3", "48485a3953bb6124-a2fb4a1d1a96d312-x")];
        assert!(matches!(
            TraceContext::try_extract(&pairs[..]),
            Err(ContextError::InvalidSingleHeader(_))
        ));
    }

    #[test]
    fn test_child_inherits_trace_and_flags() {
        let parent = TraceContext::root().with_debug(true);
        let child = parent.child();

        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.parent_id(), Some(parent.span_id()));
        assert_ne!(child.span_id(), parent.span_id());
        assert!(child.is_debug());
        assert_eq!(child.sampled(), Some(true));
    }

    #[test]
    fn test_headers_round_trip_through_extract() {
        let context = TraceContext::root().child().with_sampled(false);
        let headers: HashMap<String, String> = context
            .to_headers()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(TraceContext::extract(&headers), Some(context));
    }
}

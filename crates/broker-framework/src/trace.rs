//! # Trace Context Codec
//!
//! Encodes a distributed trace context into transport-agnostic string headers and
//! reads it back on the other side of the broker.
//!
//! ## Wire Format
//!
//! The context travels in a single `traceparent` header:
//!
//! ```text
//! 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01
//! ^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ ^^^^^^^^^^^^^^^^ ^^
//! |  trace id (32 hex)                span id (16 hex) flags (01 = sampled)
//! version
//! ```
//!
//! Baggage entries are carried as separate `baggage-{key}` headers.
//!
//! ## Permissive Extraction
//!
//! [`extract`] never fails. When the header is missing or malformed it returns a new
//! root context. Corrupt trace data costs observability, never message processing.

use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Header carrying `version-traceId-spanId-flags`.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Prefix of the headers carrying baggage entries.
pub const BAGGAGE_HEADER_PREFIX: &str = "baggage-";

const SUPPORTED_VERSION: u8 = 0x00;
const INVALID_VERSION: u8 = 0xff;
const FLAG_SAMPLED: u8 = 0x01;

/// String headers attached to every message.
pub type Headers = BTreeMap<String, String>;

/// 16-byte trace identifier, preserved end-to-end.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// The all-zero id, which is never a valid trace.
    pub const INVALID: TraceId = TraceId([0; 16]);

    /// Generates a fresh, non-zero trace id.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        loop {
            let bytes: [u8; 16] = rng.random();
            if bytes != [0; 16] {
                return Self(bytes);
            }
        }
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

/// 8-byte span identifier, derived anew at every hop.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub const INVALID: SpanId = SpanId([0; 8]);

    /// Generates a fresh, non-zero span id.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        loop {
            let bytes: [u8; 8] = rng.random();
            if bytes != [0; 8] {
                return Self(bytes);
            }
        }
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({self})")
    }
}

/// The identifiers that correlate spans across processes into one trace.
///
/// A context is immutable once created. Moving to the next hop goes through
/// [`TraceContext::child`], which keeps the trace id and baggage and mints a new
/// span id whose parent is the current span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    sampled: bool,
    baggage: BTreeMap<String, String>,
}

impl TraceContext {
    /// Starts a new trace with no parent. New roots are sampled.
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_span_id: None,
            sampled: true,
            baggage: BTreeMap::new(),
        }
    }

    /// Rebuilds a context received from a remote peer.
    pub fn from_remote(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            sampled,
            baggage: BTreeMap::new(),
        }
    }

    /// Derives the context for the next hop: same trace, new span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
            baggage: self.baggage.clone(),
        }
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The span this context was derived from, `None` for roots and remote contexts.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn baggage(&self) -> &BTreeMap<String, String> {
        &self.baggage
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }

    /// Formats the `traceparent` header value.
    pub fn traceparent(&self) -> String {
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        format!(
            "{:02x}-{}-{}-{:02x}",
            SUPPORTED_VERSION, self.trace_id, self.span_id, flags
        )
    }
}

/// Serializes `context` into a fresh header map.
pub fn inject(context: &TraceContext) -> Headers {
    let mut headers = Headers::new();
    inject_into(context, &mut headers);
    headers
}

/// Serializes `context` into existing headers.
///
/// An invalid (zero) context writes nothing; this never fails.
pub fn inject_into(context: &TraceContext, headers: &mut Headers) {
    if !context.is_valid() {
        return;
    }
    headers.insert(TRACEPARENT_HEADER.to_string(), context.traceparent());
    for (key, value) in &context.baggage {
        headers.insert(format!("{BAGGAGE_HEADER_PREFIX}{key}"), value.clone());
    }
}

/// Reads the trace context from `headers`, falling back to a new root.
pub fn extract(headers: &Headers) -> TraceContext {
    match extract_parent(headers) {
        Some(context) => context,
        None => {
            debug!("No usable traceparent header, starting a new root trace");
            let mut root = TraceContext::new_root();
            root.baggage = extract_baggage(headers);
            root
        }
    }
}

/// Reads the trace context from `headers`, or `None` if absent or malformed.
pub fn extract_parent(headers: &Headers) -> Option<TraceContext> {
    let value = header_value(headers, TRACEPARENT_HEADER)?;
    let Some((trace_id, span_id, flags)) = parse_traceparent(value) else {
        debug!(traceparent = value, "Ignoring malformed traceparent header");
        return None;
    };
    let mut context = TraceContext::from_remote(trace_id, span_id, flags & FLAG_SAMPLED != 0);
    context.baggage = extract_baggage(headers);
    Some(context)
}

fn parse_traceparent(value: &str) -> Option<(TraceId, SpanId, u8)> {
    let mut fields = value.trim().split('-');
    let version = decode_hex::<1>(fields.next()?)?[0];
    let trace_id = TraceId(decode_hex::<16>(fields.next()?)?);
    let span_id = SpanId(decode_hex::<8>(fields.next()?)?);
    let flags = decode_hex::<1>(fields.next()?)?[0];

    if fields.next().is_some() || version == INVALID_VERSION {
        return None;
    }
    if !trace_id.is_valid() || !span_id.is_valid() {
        return None;
    }
    Some((trace_id, span_id, flags))
}

fn extract_baggage(headers: &Headers) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(BAGGAGE_HEADER_PREFIX)?;
            (!name.is_empty()).then(|| (name.to_string(), value.clone()))
        })
        .collect()
}

fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .or_else(|| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
        .map(String::as_str)
}

fn decode_hex<const N: usize>(field: &str) -> Option<[u8; N]> {
    if field.len() != N * 2 || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&field[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

use http::HeaderMap;
use std::time::Instant;

/// Distributed-tracing contract around each API chain. Exporter-backed
/// implementations (Jaeger, Zipkin) plug in at construction time; the
/// gateway core only talks to this trait and ships with [`NoopTracer`].
pub trait Tracer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a span for one pipeline pass. The returned handle is carried on
    /// the request context and finished when the response is written.
    fn start_span(&self, operation: &str) -> Span;

    /// Write propagation headers for the upstream request.
    fn inject(&self, span: &Span, headers: &mut HeaderMap);

    /// Read an inbound propagation context, if any.
    fn extract(&self, headers: &HeaderMap) -> Option<SpanContext>;

    /// Flush and release exporter resources at shutdown.
    fn close(&self);
}

#[derive(Debug)]
pub struct Span {
    pub operation: String,
    pub started: Instant,
    pub context: Option<SpanContext>,
}

#[derive(Debug, Clone)]
pub struct SpanContext {
    pub trace_id: String,
}

/// Tracer used when tracing is disabled or no exporter is configured.
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn start_span(&self, operation: &str) -> Span {
        Span {
            operation: operation.to_string(),
            started: Instant::now(),
            context: None,
        }
    }

    fn inject(&self, _span: &Span, _headers: &mut HeaderMap) {}

    fn extract(&self, _headers: &HeaderMap) -> Option<SpanContext> {
        None
    }

    fn close(&self) {}
}

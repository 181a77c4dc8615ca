//! W3C Trace Context propagation for outbound HTTP calls.
//!
//! Outbound webhooks carry `traceparent`/`tracestate` so the receiver's spans join the
//! trace of the request that produced the call.
//!
//! See: https://www.w3.org/TR/trace-context/

use opentelemetry::trace::{SpanContext, TraceContextExt};
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

/// `version-trace_id-span_id-trace_flags`
fn traceparent(span_context: &SpanContext) -> String {
    format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    )
}

/// Trace headers for the current span. Empty when no valid span is active.
pub fn current_trace_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let context = Span::current().context();
    let span_ref = context.span();
    let span_context = span_ref.span_context();

    if !span_context.is_valid() {
        return headers;
    }

    if let Ok(value) = HeaderValue::from_str(&traceparent(span_context)) {
        headers.insert(TRACEPARENT_HEADER, value);
    }

    let state = span_context.trace_state().header();
    if !state.is_empty()
        && let Ok(value) = HeaderValue::from_str(&state)
    {
        headers.insert(TRACESTATE_HEADER, value);
    }

    headers
}

/// Attach the current trace context to an outbound request.
pub trait WithTraceContext {
    fn with_trace_context(self) -> Self;
}

impl WithTraceContext for reqwest::RequestBuilder {
    fn with_trace_context(self) -> Self {
        self.headers(current_trace_headers())
    }
}

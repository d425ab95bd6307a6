//! The span payload carried through the end pipeline.
use opentelemetry::trace::{SpanContext, SpanId, SpanKind, Status};
use opentelemetry::KeyValue;
use std::borrow::Cow;
use std::time::SystemTime;

/// An ended span as seen by [`SpanProcessor`]s.
///
/// This is the owned value threaded through the end pipeline; a stage that
/// transforms a span hands the modified value to the next stage. Richer data
/// (events, links, resource) belongs to the tracing SDK that produces these
/// values, not to the dispatch layer.
///
/// [`SpanProcessor`]: crate::SpanProcessor
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Exportable `SpanContext`.
    pub span_context: SpanContext,
    /// Span parent id.
    pub parent_span_id: SpanId,
    /// Span kind.
    pub span_kind: SpanKind,
    /// Span name.
    pub name: Cow<'static, str>,
    /// Span start time.
    pub start_time: SystemTime,
    /// Span end time.
    pub end_time: SystemTime,
    /// Span attributes.
    pub attributes: Vec<KeyValue>,
    /// The number of attributes that were above the configured limit, and thus
    /// dropped.
    pub dropped_attributes_count: u32,
    /// Span status.
    pub status: Status,
}

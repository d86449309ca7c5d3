//! The propagated identity of a span.

/// The subset of a span's state that crosses process boundaries: the ids,
/// plus whatever trace-level metadata the upstream hop already committed.
///
/// A `SpanContext` is produced by extraction (the remote parent of locally
/// created spans) and consumed by injection (snapshotted from the active
/// span). The ids are mandatory and immutable; everything else is
/// best-effort.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanContext {
    /// Trace id shared by every span of the trace. Never zero.
    pub trace_id: u64,
    /// Id of the span this context describes; zero when the upstream hop
    /// sent a trace id without a usable parent id.
    pub span_id: u64,
    /// The sampling priority committed upstream, if any.
    pub sampling_priority: Option<i32>,
    /// The origin of the trace (e.g. synthetics), if any.
    pub origin: Option<String>,
    /// The raw propagated tags header as received or rendered.
    pub tags_header: Option<String>,
}

impl SpanContext {
    /// Creates a context carrying only ids.
    pub fn new(trace_id: u64, span_id: u64) -> Self {
        SpanContext {
            trace_id,
            span_id,
            sampling_priority: None,
            origin: None,
            tags_header: None,
        }
    }

    /// Sets the sampling priority.
    pub fn with_sampling_priority(mut self, priority: i32) -> Self {
        self.sampling_priority = Some(priority);
        self
    }

    /// Sets the origin.
    pub fn with_origin<T: Into<String>>(mut self, origin: T) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Sets the raw propagated tags header.
    pub fn with_tags_header<T: Into<String>>(mut self, header: T) -> Self {
        self.tags_header = Some(header.into());
        self
    }
}

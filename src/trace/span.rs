//! # Span
//!
//! A span is a single timed operation within a trace. The [`Span`] handle
//! wraps the mutable [`SpanRecord`] behind a mutex; finishing the span takes
//! the record out and hands it, by value, to the owning trace's flush
//! buffer. Anything arriving after that is dropped with a diagnostic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::trace::sampler::{SamplingMechanism, SamplingPriority};
use crate::trace::span_context::SpanContext;
use crate::trace::trace_context::TraceContext;

/// Setting this tag overrides the trace's sampling priority (while the
/// decision is still open) instead of landing in the span's tag map.
pub const TAG_SAMPLING_PRIORITY: &str = "sampling.priority";
/// Truthy values force the trace to be kept (user decision).
pub const TAG_MANUAL_KEEP: &str = "manual.keep";
/// Truthy values force the trace to be dropped (user decision).
pub const TAG_MANUAL_DROP: &str = "manual.drop";
/// Setting this tag updates the trace-level origin.
pub const TAG_ORIGIN: &str = "_dd.origin";

/// Metric stamped onto flushed spans so the agent can recover the trace's
/// sampling priority from any chunk.
pub const METRIC_SAMPLING_PRIORITY: &str = "_sampling_priority_v1";

/// A finished (or in-flight) unit of work: immutable identity plus the tag
/// and metric bags. This is the value handed to the exporter.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanRecord {
    /// Trace id shared by all spans of the trace.
    pub trace_id: u64,
    /// Unique id of this span within the trace.
    pub span_id: u64,
    /// Id of the parent span, if this is not a root span.
    pub parent_id: Option<u64>,
    /// Service the span belongs to.
    pub service: String,
    /// Name of the operation being measured.
    pub operation_name: String,
    /// The resource the operation acts on (e.g. an endpoint or query).
    pub resource_name: String,
    /// Coarse span type (web, db, ...), if any.
    pub span_type: Option<String>,
    /// Wall-clock start of the operation.
    pub start_time: SystemTime,
    /// How long the operation took; set when the span finishes.
    pub duration: Option<Duration>,
    /// Whether the operation failed.
    pub error: bool,
    /// String-valued tags.
    pub tags: HashMap<String, String>,
    /// Numeric metrics.
    pub metrics: HashMap<String, f64>,
}

impl SpanRecord {
    pub(crate) fn new(
        trace_id: u64,
        span_id: u64,
        parent_id: Option<u64>,
        service: String,
        operation_name: String,
        start_time: SystemTime,
    ) -> Self {
        SpanRecord {
            trace_id,
            span_id,
            parent_id,
            service,
            resource_name: operation_name.clone(),
            operation_name,
            span_type: None,
            start_time,
            duration: None,
            error: false,
            tags: HashMap::new(),
            metrics: HashMap::new(),
        }
    }
}

/// Handle to a single operation within a trace.
///
/// Cloning the handle shares the underlying record; the record itself is
/// owned by exactly one scope until the span finishes.
#[derive(Clone, Debug)]
pub struct Span {
    trace_id: u64,
    span_id: u64,
    parent_id: Option<u64>,
    trace: Arc<TraceContext>,
    data: Arc<Mutex<Option<SpanRecord>>>,
}

impl Span {
    pub(crate) fn new(record: SpanRecord, trace: Arc<TraceContext>) -> Self {
        Span {
            trace_id: record.trace_id,
            span_id: record.span_id,
            parent_id: record.parent_id,
            trace,
            data: Arc::new(Mutex::new(Some(record))),
        }
    }

    /// The trace id of this span.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// The id of this span.
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// The id of this span's parent, if any.
    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// The trace this span belongs to.
    pub fn trace(&self) -> &Arc<TraceContext> {
        &self.trace
    }

    /// Whether the span is still recording (i.e. not yet finished).
    pub fn is_recording(&self) -> bool {
        self.data
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Snapshot of this span's propagated identity plus the trace-level
    /// metadata committed so far.
    pub fn span_context(&self) -> SpanContext {
        let mut context = SpanContext::new(self.trace_id, self.span_id);
        context.sampling_priority = self.trace.sampling_priority();
        context.origin = self.trace.origin();

        let tags_header = self.trace.tags().to_propagation_header();
        if !tags_header.is_empty() {
            context.tags_header = Some(tags_header);
        }

        context
    }

    /// Operate on the span record, if the span is still open.
    fn with_data<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut SpanRecord) -> T,
    {
        self.data
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().map(f))
    }

    /// Sets a tag on the span, overwriting any previous value.
    ///
    /// A few keys are intercepted and redirected to the owning trace
    /// instead of the span's tag map: [`TAG_SAMPLING_PRIORITY`],
    /// [`TAG_MANUAL_KEEP`], [`TAG_MANUAL_DROP`] and [`TAG_ORIGIN`].
    /// Writes to a finished span are dropped with a diagnostic.
    pub fn set_tag<K, V>(&self, key: K, value: V)
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let key = key.as_ref();
        let value = value.into();

        if !self.is_recording() {
            tracing::debug!(
                span_id = self.span_id,
                key,
                "tag set on a finished span, dropping"
            );
            return;
        }

        match key {
            TAG_SAMPLING_PRIORITY => match value.parse::<i32>() {
                Ok(priority) if SamplingPriority::from_i32(priority).is_some() => {
                    self.trace
                        .set_sampling_decision(priority, SamplingMechanism::Manual, None);
                }
                _ => tracing::warn!(
                    span_id = self.span_id,
                    value = %value,
                    "invalid sampling priority tag value, ignoring"
                ),
            },
            TAG_MANUAL_KEEP => {
                if is_truthy(&value) {
                    self.trace.set_sampling_decision(
                        SamplingPriority::UserKeep as i32,
                        SamplingMechanism::Manual,
                        None,
                    );
                }
            }
            TAG_MANUAL_DROP => {
                if is_truthy(&value) {
                    self.trace.set_sampling_decision(
                        SamplingPriority::UserReject as i32,
                        SamplingMechanism::Manual,
                        None,
                    );
                }
            }
            TAG_ORIGIN => self.trace.set_origin(value),
            _ => {
                self.with_data(|record| {
                    record.tags.insert(key.to_string(), value);
                });
            }
        }
    }

    /// Sets a numeric metric on the span, overwriting any previous value.
    pub fn set_metric<K: AsRef<str>>(&self, key: K, value: f64) {
        let updated = self.with_data(|record| {
            record.metrics.insert(key.as_ref().to_string(), value);
        });

        if updated.is_none() {
            tracing::debug!(
                span_id = self.span_id,
                key = key.as_ref(),
                "metric set on a finished span, dropping"
            );
        }
    }

    /// Flags the span as failed.
    pub fn set_error(&self, error: bool) {
        if self.with_data(|record| record.error = error).is_none() {
            tracing::debug!(span_id = self.span_id, "error flag set on a finished span, dropping");
        }
    }

    /// Overrides the resource name.
    pub fn set_resource_name<T: Into<String>>(&self, resource_name: T) {
        let resource_name = resource_name.into();
        if self
            .with_data(|record| record.resource_name = resource_name)
            .is_none()
        {
            tracing::debug!(span_id = self.span_id, "resource set on a finished span, dropping");
        }
    }

    /// Overrides the span type.
    pub fn set_span_type<T: Into<String>>(&self, span_type: T) {
        let span_type = span_type.into();
        if self
            .with_data(|record| record.span_type = Some(span_type))
            .is_none()
        {
            tracing::debug!(span_id = self.span_id, "type set on a finished span, dropping");
        }
    }

    /// Overrides the service name inherited from the tracer.
    pub fn set_service<T: Into<String>>(&self, service: T) {
        let service = service.into();
        if self.with_data(|record| record.service = service).is_none() {
            tracing::debug!(span_id = self.span_id, "service set on a finished span, dropping");
        }
    }

    /// Finishes the span now.
    pub fn finish(&self) {
        self.finish_at(SystemTime::now());
    }

    /// Finishes the span at the given end time. The duration is clamped to
    /// zero if the end time precedes the start time.
    pub fn finish_at(&self, end_time: SystemTime) {
        self.finish_inner(|record| {
            end_time
                .duration_since(record.start_time)
                .unwrap_or(Duration::ZERO)
        });
    }

    /// Finishes the span with an explicit duration.
    pub fn finish_with_duration(&self, duration: Duration) {
        self.finish_inner(|_| duration);
    }

    fn finish_inner<F>(&self, duration: F)
    where
        F: FnOnce(&SpanRecord) -> Duration,
    {
        // take the record out, marking the span as finished
        let record = match self.data.lock().ok().and_then(|mut guard| guard.take()) {
            Some(record) => record,
            None => {
                tracing::debug!(span_id = self.span_id, "span already finished");
                return;
            }
        };

        let mut record = record;
        record.duration = Some(duration(&record));
        self.trace.close_span(record);
    }

    #[cfg(test)]
    pub(crate) fn record(&self) -> Option<SpanRecord> {
        self.data.lock().ok().and_then(|guard| guard.clone())
    }
}

fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

//! Per-trace shared state: the open-span counter, the root span reference,
//! the committed sampling decision, and the flush buffer.
//!
//! All spans of one trace share a single `TraceContext`; spans of different
//! traces never contend. The exclusive section is one mutex around the
//! counter, buffer, and decision; everything it does is a counter update or
//! a buffer push/swap. Exporter calls and tag-collection updates happen
//! outside of it.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::trace::sampler::{SamplingDecision, SamplingMechanism};
use crate::trace::span::{SpanRecord, METRIC_SAMPLING_PRIORITY};
use crate::trace::span_context::SpanContext;
use crate::trace::tags::{TraceTagCollection, TAG_DECISION_MAKER, TAG_UPSTREAM_SERVICES};
use crate::trace::tracer::TracerShared;
use crate::trace::upstream::{append_upstream_service, UpstreamService};

/// State shared by every span of one trace.
///
/// Created when the trace's first span is registered and kept alive by the
/// spans that reference it; once the last open span closes and the buffer
/// has been written, dropping the final span handle drops the context. A
/// trace whose spans are never all closed keeps its context and buffer
/// alive indefinitely; that leak is preferred over flushing a trace that
/// might still grow.
pub struct TraceContext {
    shared: Arc<TracerShared>,
    state: Mutex<TraceState>,
    tags: TraceTagCollection,
}

#[derive(Default)]
struct TraceState {
    root_span: Option<u64>,
    open_spans: u32,
    finished: Vec<SpanRecord>,
    sampling_decision: Option<SamplingDecision>,
    // once locked, the decision has been observed outside this process (or
    // is about to be) and can no longer change
    sampling_locked: bool,
    origin: Option<String>,
}

impl TraceContext {
    /// Creates the context for a locally-started trace.
    pub(crate) fn new(shared: Arc<TracerShared>) -> Arc<Self> {
        let max_header_length = shared.config.tags_header_max_length;
        Arc::new(TraceContext {
            shared,
            state: Mutex::new(TraceState::default()),
            tags: TraceTagCollection::new(max_header_length),
        })
    }

    /// Creates the context for a trace continued from a propagated parent.
    ///
    /// A priority carried by the parent is adopted verbatim, marked as
    /// propagated, and locked immediately; the local sampler will never be
    /// consulted for this trace.
    pub(crate) fn from_propagated(shared: Arc<TracerShared>, parent: &SpanContext) -> Arc<Self> {
        let max_header_length = shared.config.tags_header_max_length;

        let tags = match &parent.tags_header {
            Some(header) => TraceTagCollection::parse(header, max_header_length),
            None => TraceTagCollection::new(max_header_length),
        };

        let decision = parent.sampling_priority.map(|priority| {
            SamplingDecision::new(priority, SamplingMechanism::Propagated, None)
        });

        Arc::new(TraceContext {
            shared,
            state: Mutex::new(TraceState {
                sampling_locked: decision.is_some(),
                sampling_decision: decision,
                origin: parent.origin.clone(),
                ..TraceState::default()
            }),
            tags,
        })
    }

    /// Registers a new span with the trace. The first registered span
    /// becomes the trace's root; a locally-started trace asks the sampler
    /// for an initial decision at that point, but the decision stays open
    /// to overrides until it locks.
    pub(crate) fn add_span(&self, span: &SpanRecord) {
        let mut state = self.state.lock().expect("trace state poisoned");

        if state.root_span.is_none() {
            state.root_span = Some(span.span_id);

            if state.sampling_decision.is_none() {
                if let Some(sampler) = &self.shared.sampler {
                    state.sampling_decision = Some(sampler.decide(span));
                }
            }
        }

        state.open_spans += 1;
    }

    /// Buffers a finished span and flushes when the trace allows it.
    ///
    /// Closing the root span locks the decision and stamps it onto the root
    /// record. When the last open span closes, the whole buffer is swapped
    /// out and written. When enough finished spans pile up on a still-open
    /// trace, the buffer is swapped out early (partial flush) and every
    /// span of the outgoing batch is stamped with the locked priority,
    /// since the batch that carries the root may have left already or may
    /// never leave.
    pub(crate) fn close_span(&self, mut span: SpanRecord) {
        let mut batch = None;
        let mut stamp_batch = None;
        let mut decision_to_record = None;

        {
            let mut state = self.state.lock().expect("trace state poisoned");

            if state.root_span == Some(span.span_id) {
                state.sampling_locked = true;

                match state.sampling_decision {
                    Some(decision) => {
                        span.metrics
                            .insert(METRIC_SAMPLING_PRIORITY.to_string(), decision.priority as f64);
                        decision_to_record = Some(decision);
                    }
                    None => tracing::warn!(
                        trace_id = span.trace_id,
                        "root span closed before a sampling decision was made"
                    ),
                }
            }

            state.finished.push(span);
            state.open_spans = state.open_spans.saturating_sub(1);

            if state.open_spans == 0 {
                batch = Some(mem::take(&mut state.finished));
            } else if self.shared.config.partial_flush_enabled
                && state.finished.len() >= self.shared.config.partial_flush_min_spans
            {
                state.sampling_locked = true;
                stamp_batch = state.sampling_decision;

                // the remaining spans are likely to fill a similar batch,
                // so allocate the replacement at full size up front
                let capacity = state.finished.len();
                batch = Some(mem::replace(&mut state.finished, Vec::with_capacity(capacity)));
            }
        }

        if let Some(decision) = decision_to_record {
            self.record_decision_maker(&decision);
        }

        if let Some(mut batch) = batch {
            if let Some(decision) = stamp_batch {
                tracing::debug!(
                    trace_id = batch[0].trace_id,
                    spans = batch.len(),
                    "partial flush of an unfinished trace"
                );

                // the agent reads the priority off the first span without a
                // parent; the root may not be in this batch, so stamp all
                for span in batch.iter_mut() {
                    span.metrics
                        .insert(METRIC_SAMPLING_PRIORITY.to_string(), decision.priority as f64);
                }
            }

            if let Err(err) = self.shared.exporter.write(&batch) {
                tracing::warn!(error = %err, "failed to write finished spans");
            }
        }
    }

    /// Overrides the trace's sampling decision. Ignored with a diagnostic
    /// once the decision is locked.
    pub fn set_sampling_decision(
        &self,
        priority: i32,
        mechanism: SamplingMechanism,
        rate: Option<f64>,
    ) {
        let decision = SamplingDecision::new(priority, mechanism, rate);

        {
            let mut state = self.state.lock().expect("trace state poisoned");

            if state.sampling_locked {
                tracing::debug!(
                    priority,
                    "sampling decision already locked, ignoring override"
                );
                return;
            }

            state.sampling_decision = Some(decision);
        }

        self.record_decision_maker(&decision);
    }

    /// Locks the sampling decision (e.g. ahead of header injection) and
    /// returns it.
    pub fn lock_sampling_decision(&self) -> Option<SamplingDecision> {
        let mut state = self.state.lock().expect("trace state poisoned");
        state.sampling_locked = true;
        state.sampling_decision
    }

    /// The trace's current sampling decision, if one has been made.
    pub fn sampling_decision(&self) -> Option<SamplingDecision> {
        self.state
            .lock()
            .expect("trace state poisoned")
            .sampling_decision
    }

    /// The trace's current sampling priority, if one has been decided.
    pub fn sampling_priority(&self) -> Option<i32> {
        self.sampling_decision().map(|decision| decision.priority)
    }

    /// The id of the trace's root span, once one has been registered.
    pub fn root_span_id(&self) -> Option<u64> {
        self.state.lock().expect("trace state poisoned").root_span
    }

    /// Number of spans registered but not yet closed.
    pub fn open_spans(&self) -> u32 {
        self.state.lock().expect("trace state poisoned").open_spans
    }

    /// The trace's origin, if one was set or propagated.
    pub fn origin(&self) -> Option<String> {
        self.state.lock().expect("trace state poisoned").origin.clone()
    }

    /// Sets the trace's origin.
    pub fn set_origin<T: Into<String>>(&self, origin: T) {
        self.state.lock().expect("trace state poisoned").origin = Some(origin.into());
    }

    /// The trace-level tag collection.
    pub fn tags(&self) -> &TraceTagCollection {
        &self.tags
    }

    /// Appends this process's hop to the trace's upstream service chain,
    /// once a sampling decision exists.
    pub fn record_upstream_service(&self) {
        let Some(decision) = self.sampling_decision() else {
            return;
        };

        let hop = UpstreamService::from_decision(&self.shared.config.service_name, &decision);
        let chain = self.tags.get_tag(TAG_UPSTREAM_SERVICES).unwrap_or_default();
        self.tags
            .set_tag(TAG_UPSTREAM_SERVICES, append_upstream_service(&chain, &hop));
    }

    /// Records the decision maker tag for locally-made keep decisions, so
    /// downstream services can tell how the trace came to be retained.
    fn record_decision_maker(&self, decision: &SamplingDecision) {
        if decision.mechanism == SamplingMechanism::Propagated {
            return;
        }

        if decision.is_keep() {
            if self.tags.get_tag(TAG_DECISION_MAKER).is_none() {
                self.tags
                    .set_tag(TAG_DECISION_MAKER, format!("-{}", decision.mechanism as i32));
            }
        } else {
            self.tags.remove_tag(TAG_DECISION_MAKER);
        }
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("trace state poisoned");
        f.debug_struct("TraceContext")
            .field("root_span", &state.root_span)
            .field("open_spans", &state.open_spans)
            .field("buffered", &state.finished.len())
            .field("sampling_decision", &state.sampling_decision)
            .field("sampling_locked", &state.sampling_locked)
            .finish()
    }
}

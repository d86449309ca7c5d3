//! The exporter boundary.
//!
//! The trace core hands finished spans to a [`SpanExporter`] one batch per
//! flush. A batch is finalized, read-only data: every span in it belongs to
//! the same trace, but spans arrive in no particular order and the root
//! span may be missing from any batch of a partially-flushed trace (or
//! present in none of them when it was itself flushed early).

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::trace::error::{TraceError, TraceResult};
use crate::trace::span::SpanRecord;

/// Consumes batches of finished spans.
pub trait SpanExporter: Send + Sync + fmt::Debug {
    /// Writes a batch of finished spans.
    ///
    /// Called once per flush, outside of any trace's exclusive section.
    /// Implementations must treat the batch as immutable and must not
    /// assume anything about span ordering within it.
    fn write(&self, batch: &[SpanRecord]) -> TraceResult<()>;
}

/// A [`SpanExporter`] that discards every batch.
#[derive(Clone, Debug, Default)]
pub struct NoopSpanExporter {
    _private: (),
}

impl NoopSpanExporter {
    /// Creates a new no-op exporter.
    pub fn new() -> Self {
        NoopSpanExporter::default()
    }
}

impl SpanExporter for NoopSpanExporter {
    fn write(&self, _batch: &[SpanRecord]) -> TraceResult<()> {
        Ok(())
    }
}

/// A [`SpanExporter`] that keeps spans in memory for inspection.
///
/// Typically used for testing and debugging; cloning shares the storage, so
/// a clone handed to a tracer can be inspected from the test.
///
/// # Example
///
/// ```
/// use datadog_trace_core::trace::{InMemorySpanExporter, Tracer};
///
/// let exporter = InMemorySpanExporter::default();
/// let tracer = Tracer::builder().with_exporter(exporter.clone()).build();
/// tracer.start_span("work").finish();
///
/// let spans = exporter.get_finished_spans().unwrap();
/// assert_eq!(spans.len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanRecord>>>,
    writes: Arc<AtomicUsize>,
}

impl InMemorySpanExporter {
    /// Returns the finished spans received so far.
    pub fn get_finished_spans(&self) -> TraceResult<Vec<SpanRecord>> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .map_err(|_| TraceError::from("InMemorySpanExporter mutex poisoned"))
    }

    /// Number of batches written so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Clears the stored spans and the batch counter.
    pub fn reset(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
        self.writes.store(0, Ordering::SeqCst);
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn write(&self, batch: &[SpanRecord]) -> TraceResult<()> {
        self.spans
            .lock()
            .map(|mut spans| spans.extend_from_slice(batch))
            .map_err(|_| TraceError::from("InMemorySpanExporter mutex poisoned"))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

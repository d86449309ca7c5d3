//! Scopes: the active-span handles forming a per-flow stack.
//!
//! A scope is a handle used to manage the concept of an active span: at any
//! given time a flow has at most one active span, and newly started spans
//! become children of it. Scopes form a singly-linked stack through their
//! parent references; activation pushes, closing pops and restores the
//! parent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::context::Context;
use crate::trace::span::Span;

/// Observer of scope lifecycle events.
///
/// Events fire in a fixed order. On activation: `span_opened`, then
/// `span_deactivated` for the previous active span (if any), then
/// `span_activated` for the new one. On close: `span_deactivated`,
/// `span_activated` for the restored parent (if any), `span_closed`, and
/// finally `trace_ended` when the closed scope was a root. An out-of-order
/// close emits only `span_closed`.
pub trait ScopeListener: Send + Sync {
    /// A span was wrapped in a new scope.
    fn span_opened(&self, _span: &Span) {}
    /// A span became the active span of its flow.
    fn span_activated(&self, _span: &Span) {}
    /// A span stopped being the active span of its flow.
    fn span_deactivated(&self, _span: &Span) {}
    /// A scope was closed.
    fn span_closed(&self, _span: &Span) {}
    /// A root scope was closed, ending the local part of the trace.
    fn trace_ended(&self, _span: &Span) {}
}

pub(crate) struct ScopeInner {
    pub(crate) span: Span,
    pub(crate) parent: Option<Arc<ScopeInner>>,
    // the flow this scope was activated in; close always runs against it,
    // even when the scope is closed from another thread or a cancelled task
    context: Context,
    finish_on_close: bool,
    closed: AtomicBool,
}

/// The handle returned by activation.
///
/// Closing the scope (or dropping it, e.g. when a task is cancelled)
/// restores its parent as the active scope and optionally finishes the
/// wrapped span. Closing is idempotent.
pub struct Scope {
    inner: Arc<ScopeInner>,
    manager: ScopeManager,
}

impl Scope {
    /// The span wrapped in this scope.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Closes the scope and makes its parent scope active.
    pub fn close(self) {
        self.close_once();
    }

    fn close_once(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.manager.close(&self.inner);

            if self.inner.finish_on_close {
                self.inner.span.finish();
            }
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close_once();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("span_id", &self.inner.span.span_id())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Maintains the active scope per execution flow and fans lifecycle events
/// out to registered listeners.
#[derive(Clone, Default)]
pub struct ScopeManager {
    inner: Arc<ScopeManagerInner>,
}

#[derive(Default)]
struct ScopeManagerInner {
    listeners: RwLock<Vec<Arc<dyn ScopeListener>>>,
}

impl ScopeManager {
    /// Creates a scope manager with no listeners.
    pub fn new() -> Self {
        ScopeManager::default()
    }

    /// Registers a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn ScopeListener>) {
        self.inner
            .listeners
            .write()
            .expect("scope listeners poisoned")
            .push(listener);
    }

    /// The active span of the current flow, if any.
    pub fn active(&self) -> Option<Span> {
        Context::map_current(|cx| cx.active_span())
    }

    /// Wraps `span` in a new scope, captures the current active scope as
    /// its parent, and makes the new scope active for the current flow.
    pub fn activate(&self, span: Span, finish_on_close: bool) -> Scope {
        Context::map_current(|cx| {
            let parent = cx.active_scope();

            let inner = Arc::new(ScopeInner {
                span,
                parent: parent.clone(),
                context: cx.clone(),
                finish_on_close,
                closed: AtomicBool::new(false),
            });

            self.notify(|listener| listener.span_opened(&inner.span));

            if let Some(previous) = &parent {
                self.notify(|listener| listener.span_deactivated(&previous.span));
            }

            cx.set_active_scope(Some(inner.clone()));
            self.notify(|listener| listener.span_activated(&inner.span));

            Scope {
                inner,
                manager: self.clone(),
            }
        })
    }

    /// Runs the close protocol for `scope` against the flow it was
    /// activated in.
    ///
    /// If the scope is not that flow's active scope, the close is out of
    /// order (the scope was "stolen" by some interleaved activation): the
    /// active chain of still-open scopes is left untouched and only
    /// `span_closed` is emitted, so the anomaly stays observable.
    pub(crate) fn close(&self, scope: &Arc<ScopeInner>) {
        let is_active = scope
            .context
            .active_scope()
            .is_some_and(|active| Arc::ptr_eq(&active, scope));

        if !is_active {
            tracing::debug!(
                span_id = scope.span.span_id(),
                "scope closed out of order, active scope left unchanged"
            );
            self.notify(|listener| listener.span_closed(&scope.span));
            return;
        }

        self.notify(|listener| listener.span_deactivated(&scope.span));

        // the scope that was just closed was the active scope, so its
        // parent becomes the new active scope
        scope.context.set_active_scope(scope.parent.clone());

        if let Some(parent) = &scope.parent {
            self.notify(|listener| listener.span_activated(&parent.span));
        }

        self.notify(|listener| listener.span_closed(&scope.span));

        if scope.parent.is_none() {
            self.notify(|listener| listener.trace_ended(&scope.span));
        }
    }

    fn notify<F: Fn(&Arc<dyn ScopeListener>)>(&self, f: F) {
        for listener in self
            .inner
            .listeners
            .read()
            .expect("scope listeners poisoned")
            .iter()
        {
            f(listener);
        }
    }
}

impl fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self
            .inner
            .listeners
            .read()
            .map(|listeners| listeners.len())
            .unwrap_or(0);
        f.debug_struct("ScopeManager")
            .field("listeners", &listeners)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::export::NoopSpanExporter;
    use crate::trace::tracer::Tracer;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<(String, u64)>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<(String, u64)> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: &str, span: &Span) {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), span.span_id()));
        }
    }

    impl ScopeListener for RecordingListener {
        fn span_opened(&self, span: &Span) {
            self.push("opened", span);
        }

        fn span_activated(&self, span: &Span) {
            self.push("activated", span);
        }

        fn span_deactivated(&self, span: &Span) {
            self.push("deactivated", span);
        }

        fn span_closed(&self, span: &Span) {
            self.push("closed", span);
        }

        fn trace_ended(&self, span: &Span) {
            self.push("trace_ended", span);
        }
    }

    fn tracer_with_listener() -> (Tracer, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let tracer = Tracer::builder()
            .with_exporter(NoopSpanExporter::new())
            .with_listener(listener.clone())
            .build();
        (tracer, listener)
    }

    #[test]
    fn activate_and_close_restore_parent() {
        let (tracer, _) = tracer_with_listener();

        let outer = tracer.start_active("outer", true);
        let outer_id = outer.span().span_id();

        let inner = tracer.start_active("inner", true);
        assert_eq!(
            tracer.active_span().map(|s| s.span_id()),
            Some(inner.span().span_id())
        );

        inner.close();
        assert_eq!(tracer.active_span().map(|s| s.span_id()), Some(outer_id));

        outer.close();
        assert!(tracer.active_span().is_none());
    }

    #[test]
    fn lifecycle_event_order() {
        let (tracer, listener) = tracer_with_listener();

        let outer = tracer.start_active("outer", true);
        let outer_id = outer.span().span_id();
        let inner = tracer.start_active("inner", true);
        let inner_id = inner.span().span_id();
        inner.close();
        outer.close();

        let expected = vec![
            ("opened".to_string(), outer_id),
            ("activated".to_string(), outer_id),
            ("opened".to_string(), inner_id),
            ("deactivated".to_string(), outer_id),
            ("activated".to_string(), inner_id),
            ("deactivated".to_string(), inner_id),
            ("activated".to_string(), outer_id),
            ("closed".to_string(), inner_id),
            ("deactivated".to_string(), outer_id),
            ("closed".to_string(), outer_id),
            ("trace_ended".to_string(), outer_id),
        ];
        assert_eq!(listener.events(), expected);
    }

    #[test]
    fn out_of_order_close_leaves_active_chain_intact() {
        let (tracer, listener) = tracer_with_listener();

        let outer = tracer.start_active("outer", true);
        let outer_id = outer.span().span_id();
        let inner = tracer.start_active("inner", true);
        let inner_id = inner.span().span_id();

        // closing the outer scope while the inner one is active is an
        // anomaly: nothing moves, only the closed event fires
        outer.close();
        assert_eq!(tracer.active_span().map(|s| s.span_id()), Some(inner_id));
        assert_eq!(
            listener.events().last(),
            Some(&("closed".to_string(), outer_id))
        );

        // the inner scope still closes normally, restoring its (already
        // closed) parent as active
        inner.close();
        assert_eq!(tracer.active_span().map(|s| s.span_id()), Some(outer_id));
    }

    #[test]
    fn drop_closes_scope() {
        let (tracer, listener) = tracer_with_listener();

        {
            let _scope = tracer.start_active("dropped", true);
        }

        assert!(tracer.active_span().is_none());
        assert!(listener
            .events()
            .iter()
            .any(|(event, _)| event == "closed"));
    }

    #[test]
    fn close_after_close_fires_once() {
        let (tracer, listener) = tracer_with_listener();

        let scope = tracer.start_active("once", true);
        scope.close();

        let closes = listener
            .events()
            .iter()
            .filter(|(event, _)| event == "closed")
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn finish_on_close_false_keeps_span_open() {
        let (tracer, _) = tracer_with_listener();

        let scope = tracer.start_active("open", false);
        let span = scope.span().clone();
        scope.close();

        assert!(span.is_recording());
        span.finish();
    }

    #[test]
    fn trace_ended_only_for_root() {
        let (tracer, listener) = tracer_with_listener();

        let outer = tracer.start_active("outer", true);
        let inner = tracer.start_active("inner", true);
        inner.close();

        assert!(!listener
            .events()
            .iter()
            .any(|(event, _)| event == "trace_ended"));

        outer.close();
        assert!(listener
            .events()
            .iter()
            .any(|(event, _)| event == "trace_ended"));
    }
}

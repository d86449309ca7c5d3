//! Execution-scoped storage for the active scope.
//!
//! A [`Context`] is a handle to one logical flow of execution: it owns the
//! slot that says which scope is currently active for that flow. Cloning a
//! `Context` shares the slot, so a flow keeps a single active-scope chain
//! no matter how many handles to it exist or which worker thread is
//! currently running it.
//!
//! Each OS thread starts out in its own anonymous flow. Synchronous code
//! never needs to touch this module; the scope manager reads and writes the
//! current thread's flow implicitly. Asynchronous code pins a flow to a
//! future with [`FutureExt::with_context`]: the flow is re-attached around
//! every poll, so activations made inside the future survive suspension and
//! resumption on a different thread. This is deliberately not plain
//! thread-local state; the thread local only holds *which flow* a thread is
//! currently running.

use futures_core::stream::Stream;
use futures_sink::Sink;
use pin_project_lite::pin_project;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use crate::trace::scope::ScopeInner;
use crate::trace::span::Span;

thread_local! {
    static CURRENT_CONTEXT: RefCell<Context> = RefCell::new(Context::new());
}

/// A handle to one logical flow's active-scope slot.
#[derive(Clone, Default)]
pub struct Context {
    active: Arc<Mutex<Option<Arc<ScopeInner>>>>,
}

impl Context {
    /// Creates a fresh flow with no active scope.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns a handle to the flow the current thread is running.
    ///
    /// The handle shares the flow's slot: scope activations and closes made
    /// through any handle are visible through all of them.
    pub fn current() -> Self {
        Context::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current thread's flow without cloning the
    /// handle.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| f(&cx.borrow()))
    }

    /// The span of this flow's active scope, if any.
    pub fn active_span(&self) -> Option<Span> {
        self.active_scope().map(|scope| scope.span.clone())
    }

    pub(crate) fn active_scope(&self) -> Option<Arc<ScopeInner>> {
        self.active.lock().expect("context slot poisoned").clone()
    }

    pub(crate) fn set_active_scope(&self, scope: Option<Arc<ScopeInner>>) {
        *self.active.lock().expect("context slot poisoned") = scope;
    }

    /// Makes this flow the current one for this thread.
    ///
    /// Dropping the returned [`ContextGuard`] restores the previous flow.
    /// The guard must be held in a named binding; an unnamed `_` drops it
    /// immediately.
    pub fn attach(self) -> ContextGuard {
        let previous = CURRENT_CONTEXT
            .try_with(|current| current.replace(self))
            .ok();

        ContextGuard {
            previous,
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field(
                "active_span",
                &self.active_span().map(|span| span.span_id()),
            )
            .finish()
    }
}

/// A guard that resets the current flow to the previous one when dropped.
#[allow(missing_debug_implementations)]
pub struct ContextGuard {
    previous: Option<Context>,
    // ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = CURRENT_CONTEXT.try_with(|current| current.replace(previous));
        }
    }
}

pin_project! {
    /// A future, stream, or sink pinned to an execution flow.
    #[derive(Clone, Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        cx: Context,
    }
}

impl<T: Sized> FutureExt for T {}

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.cx.clone().attach();

        this.inner.poll(task_cx)
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.cx.clone().attach();
        T::poll_next(this.inner, task_cx)
    }
}

impl<I, T: Sink<I>> Sink<I> for WithContext<T>
where
    T: Sink<I>,
{
    type Error = T::Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = this.cx.clone().attach();
        T::poll_ready(this.inner, task_cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        let this = self.project();
        let _guard = this.cx.clone().attach();
        T::start_send(this.inner, item)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _guard = this.cx.clone().attach();
        T::poll_flush(this.inner, task_cx)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        task_cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        let _enter = this.cx.clone().attach();
        T::poll_close(this.inner, task_cx)
    }
}

/// Extension trait allowing futures, streams, and sinks to carry an
/// execution flow.
pub trait FutureExt: Sized {
    /// Pins the provided flow to this value, returning a `WithContext`
    /// wrapper.
    ///
    /// When the wrapped value is a future, stream, or sink, the flow is
    /// made current while it is being polled.
    fn with_context(self, cx: Context) -> WithContext<Self> {
        WithContext { inner: self, cx }
    }

    /// Pins the current flow to this value, returning a `WithContext`
    /// wrapper.
    fn with_current_context(self) -> WithContext<Self> {
        let cx = Context::current();
        self.with_context(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::export::NoopSpanExporter;
    use crate::trace::tracer::Tracer;

    fn test_tracer() -> Tracer {
        Tracer::builder()
            .with_exporter(NoopSpanExporter::new())
            .build()
    }

    #[test]
    fn fresh_flow_has_no_active_span() {
        assert!(Context::new().active_span().is_none());
    }

    #[test]
    fn attach_and_restore() {
        let tracer = test_tracer();

        let outer = Context::current();
        assert!(outer.active_span().is_none());

        {
            let _guard = Context::new().attach();
            let scope = tracer.start_active("inner", true);
            assert_eq!(
                Context::current().active_span().map(|s| s.span_id()),
                Some(scope.span().span_id())
            );
            scope.close();
        }

        // the previous flow is restored untouched
        assert!(Context::current().active_span().is_none());
    }

    #[test]
    fn handles_share_the_slot() {
        let tracer = test_tracer();
        let flow = Context::current();

        let scope = tracer.start_active("work", true);
        assert_eq!(
            flow.active_span().map(|s| s.span_id()),
            Some(scope.span().span_id())
        );
        scope.close();
        assert!(flow.active_span().is_none());
    }

    #[test]
    fn flow_moves_across_threads() {
        let tracer = test_tracer();
        let scope = tracer.start_active("work", false);
        let span_id = scope.span().span_id();

        let flow = Context::current();
        let seen = std::thread::spawn(move || {
            let _guard = flow.attach();
            Context::current().active_span().map(|s| s.span_id())
        })
        .join()
        .unwrap();

        assert_eq!(seen, Some(span_id));
        scope.close();
        scope_closed_everywhere(span_id);
    }

    fn scope_closed_everywhere(_span_id: u64) {
        assert!(Context::current().active_span().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flow_survives_suspension() {
        let tracer = test_tracer();

        let task = async move {
            let scope = tracer.start_active("async-work", true);
            let span_id = scope.span().span_id();

            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            // after resumption (possibly on another worker) the scope is
            // still active for this flow
            let active = Context::current().active_span().map(|s| s.span_id());
            scope.close();
            (span_id, active)
        };

        let (span_id, active) = tokio::spawn(task.with_context(Context::new()))
            .await
            .unwrap();

        assert_eq!(active, Some(span_id));
    }
}

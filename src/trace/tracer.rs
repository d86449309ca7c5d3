//! The span creation API.
//!
//! A [`Tracer`] owns the pieces every trace shares: configuration, the
//! sampler and exporter collaborators, the id generator, and the scope
//! manager. Spans are created through [`SpanBuilder`]; the builder resolves
//! the parent (explicit local span, explicit propagated context, or the
//! flow's active scope) and registers the new span with the right
//! [`TraceContext`].

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::propagation::{Extractor, Injector};
use crate::propagation::propagator::DatadogPropagator;
use crate::trace::config::Config;
use crate::trace::export::{NoopSpanExporter, SpanExporter};
use crate::trace::id_generator::{IdGenerator, RandomIdGenerator};
use crate::trace::sampler::{AlwaysKeepSampler, Sampler};
use crate::trace::scope::{Scope, ScopeListener, ScopeManager};
use crate::trace::span::{Span, SpanRecord};
use crate::trace::span_context::SpanContext;
use crate::trace::trace_context::TraceContext;

/// The pieces of a tracer shared by every trace it starts.
pub(crate) struct TracerShared {
    pub(crate) config: Config,
    pub(crate) sampler: Option<Box<dyn Sampler>>,
    pub(crate) exporter: Box<dyn SpanExporter>,
}

impl fmt::Debug for TracerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerShared")
            .field("config", &self.config)
            .field("sampler", &self.sampler)
            .field("exporter", &self.exporter)
            .finish()
    }
}

/// Creates spans, resolves their parents, and hands finished traces to the
/// exporter.
#[derive(Clone, Debug)]
pub struct Tracer {
    shared: Arc<TracerShared>,
    scope_manager: ScopeManager,
    id_generator: Arc<dyn IdGenerator>,
    propagator: DatadogPropagator,
}

impl Tracer {
    /// Starts building a tracer.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The tracer's scope manager.
    pub fn scope_manager(&self) -> &ScopeManager {
        &self.scope_manager
    }

    /// The active span of the current flow, if any.
    pub fn active_span(&self) -> Option<Span> {
        self.scope_manager.active()
    }

    /// Starts building a span.
    pub fn span_builder<T: Into<String>>(&self, operation_name: T) -> SpanBuilder<'_> {
        SpanBuilder::new(self, operation_name.into())
    }

    /// Starts a span as a child of the current flow's active span (or as a
    /// new trace root if there is none).
    pub fn start_span<T: Into<String>>(&self, operation_name: T) -> Span {
        self.span_builder(operation_name).start()
    }

    /// Starts a span continuing the trace described by a propagated parent
    /// context.
    pub fn start_span_from<T: Into<String>>(&self, operation_name: T, parent: &SpanContext) -> Span {
        self.span_builder(operation_name)
            .with_parent_context(parent.clone())
            .start()
    }

    /// Starts a span and activates it as the current flow's active scope.
    pub fn start_active<T: Into<String>>(&self, operation_name: T, finish_on_close: bool) -> Scope {
        let span = self.start_span(operation_name);
        self.scope_manager.activate(span, finish_on_close)
    }

    /// Injects the active span's propagation context into a carrier.
    ///
    /// Injecting makes the trace's sampling decision observable outside the
    /// process, so the decision is locked first.
    pub fn inject_active(&self, injector: &mut dyn Injector) {
        let Some(span) = self.active_span() else {
            return;
        };

        span.trace().lock_sampling_decision();
        self.propagator.inject(&span.span_context(), injector);
    }

    /// Extracts a propagated parent context from a carrier.
    pub fn extract(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        self.propagator.extract(extractor)
    }

    pub(crate) fn start_from_builder(&self, builder: SpanBuilderParts) -> Span {
        let SpanBuilderParts {
            operation_name,
            service,
            resource_name,
            span_type,
            start_time,
            tags,
            error,
            parent,
            ignore_active_scope,
        } = builder;

        let local_parent = match &parent {
            Parent::LocalSpan(span) => Some(span.clone()),
            Parent::Remote(_) => None,
            Parent::FromFlow => {
                if ignore_active_scope {
                    None
                } else {
                    self.active_span()
                }
            }
        };

        let (trace, trace_id, parent_id) = if let Some(parent_span) = &local_parent {
            (
                parent_span.trace().clone(),
                parent_span.trace_id(),
                Some(parent_span.span_id()),
            )
        } else if let Parent::Remote(context) = &parent {
            let parent_id = (context.span_id != 0).then_some(context.span_id);
            (
                TraceContext::from_propagated(self.shared.clone(), context),
                context.trace_id,
                parent_id,
            )
        } else {
            (
                TraceContext::new(self.shared.clone()),
                self.id_generator.new_trace_id(),
                None,
            )
        };

        let mut record = SpanRecord::new(
            trace_id,
            self.id_generator.new_span_id(),
            parent_id,
            service.unwrap_or_else(|| self.shared.config.service_name.clone()),
            operation_name,
            start_time.unwrap_or_else(SystemTime::now),
        );

        if let Some(resource_name) = resource_name {
            record.resource_name = resource_name;
        }
        record.span_type = span_type;
        record.error = error;
        record.tags.extend(tags);

        trace.add_span(&record);
        Span::new(record, trace)
    }
}

/// Builder for [`Tracer`].
pub struct Builder {
    config: Config,
    sampler: Option<Box<dyn Sampler>>,
    exporter: Option<Box<dyn SpanExporter>>,
    id_generator: Arc<dyn IdGenerator>,
    listeners: Vec<Arc<dyn ScopeListener>>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            config: Config::default(),
            sampler: Some(Box::new(AlwaysKeepSampler::new())),
            exporter: None,
            id_generator: Arc::new(RandomIdGenerator::default()),
            listeners: Vec::new(),
        }
    }
}

impl Builder {
    /// Sets the tracer configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the exporter that receives finished span batches.
    pub fn with_exporter<T: SpanExporter + 'static>(mut self, exporter: T) -> Self {
        self.exporter = Some(Box::new(exporter));
        self
    }

    /// Sets the sampler asked for the initial decision of each local trace.
    pub fn with_sampler<T: Sampler + 'static>(mut self, sampler: T) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Removes the sampler; local traces then stay undecided until a
    /// priority is set explicitly.
    pub fn without_sampler(mut self) -> Self {
        self.sampler = None;
        self
    }

    /// Sets the id generator.
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.id_generator = Arc::new(id_generator);
        self
    }

    /// Registers a scope lifecycle listener.
    pub fn with_listener(mut self, listener: Arc<dyn ScopeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Builds the tracer.
    pub fn build(self) -> Tracer {
        let scope_manager = ScopeManager::new();
        for listener in self.listeners {
            scope_manager.add_listener(listener);
        }

        Tracer {
            shared: Arc::new(TracerShared {
                config: self.config,
                sampler: self.sampler,
                exporter: self
                    .exporter
                    .unwrap_or_else(|| Box::new(NoopSpanExporter::new())),
            }),
            scope_manager,
            id_generator: self.id_generator,
            propagator: DatadogPropagator::new(),
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("sampler", &self.sampler)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

enum Parent {
    /// Child of the current flow's active span, if one exists.
    FromFlow,
    /// Child of an explicit local span.
    LocalSpan(Span),
    /// Continuation of a propagated context.
    Remote(SpanContext),
}

pub(crate) struct SpanBuilderParts {
    operation_name: String,
    service: Option<String>,
    resource_name: Option<String>,
    span_type: Option<String>,
    start_time: Option<SystemTime>,
    tags: Vec<(String, String)>,
    error: bool,
    parent: Parent,
    ignore_active_scope: bool,
}

/// Builder for a single span.
#[derive(Debug)]
pub struct SpanBuilder<'a> {
    tracer: &'a Tracer,
    parts: SpanBuilderParts,
}

impl fmt::Debug for SpanBuilderParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanBuilderParts")
            .field("operation_name", &self.operation_name)
            .finish()
    }
}

impl<'a> SpanBuilder<'a> {
    fn new(tracer: &'a Tracer, operation_name: String) -> Self {
        SpanBuilder {
            tracer,
            parts: SpanBuilderParts {
                operation_name,
                service: None,
                resource_name: None,
                span_type: None,
                start_time: None,
                tags: Vec::new(),
                error: false,
                parent: Parent::FromFlow,
                ignore_active_scope: false,
            },
        }
    }

    /// Overrides the service name for this span.
    pub fn with_service<T: Into<String>>(mut self, service: T) -> Self {
        self.parts.service = Some(service.into());
        self
    }

    /// Sets the resource name.
    pub fn with_resource_name<T: Into<String>>(mut self, resource_name: T) -> Self {
        self.parts.resource_name = Some(resource_name.into());
        self
    }

    /// Sets the span type.
    pub fn with_span_type<T: Into<String>>(mut self, span_type: T) -> Self {
        self.parts.span_type = Some(span_type.into());
        self
    }

    /// Sets an explicit start time.
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.parts.start_time = Some(start_time);
        self
    }

    /// Adds a tag to the span at creation.
    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.parts.tags.push((key.into(), value.into()));
        self
    }

    /// Marks the span as failed at creation.
    pub fn with_error(mut self) -> Self {
        self.parts.error = true;
        self
    }

    /// Parents the span under an explicit local span instead of the active
    /// scope.
    pub fn with_parent_span(mut self, parent: &Span) -> Self {
        self.parts.parent = Parent::LocalSpan(parent.clone());
        self
    }

    /// Continues the trace described by a propagated parent context.
    pub fn with_parent_context(mut self, parent: SpanContext) -> Self {
        self.parts.parent = Parent::Remote(parent);
        self
    }

    /// Starts a new root trace even if the flow has an active scope.
    pub fn ignore_active_scope(mut self) -> Self {
        self.parts.ignore_active_scope = true;
        self
    }

    /// Creates the span and registers it with its trace.
    pub fn start(self) -> Span {
        self.tracer.start_from_builder(self.parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::export::InMemorySpanExporter;
    use crate::trace::id_generator::IncrementIdGenerator;

    fn test_tracer(exporter: InMemorySpanExporter) -> Tracer {
        Tracer::builder()
            .with_config(Config::default().with_service_name("web"))
            .with_exporter(exporter)
            .with_id_generator(IncrementIdGenerator::new())
            .build()
    }

    #[test]
    fn root_span_has_no_parent() {
        let tracer = test_tracer(InMemorySpanExporter::default());
        let span = tracer.start_span("root");

        assert_eq!(span.parent_id(), None);
        assert_ne!(span.trace_id(), 0);
        assert_ne!(span.span_id(), 0);
    }

    #[test]
    fn child_inherits_trace_and_service() {
        let exporter = InMemorySpanExporter::default();
        let tracer = test_tracer(exporter.clone());

        let root = tracer.start_active("root", true);
        let root_span = root.span().clone();
        let child = tracer.start_active("child", true);

        assert_eq!(child.span().trace_id(), root_span.trace_id());
        assert_eq!(child.span().parent_id(), Some(root_span.span_id()));

        child.close();
        root.close();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|span| span.service == "web"));
    }

    #[test]
    fn ignore_active_scope_starts_new_trace() {
        let tracer = test_tracer(InMemorySpanExporter::default());

        let root = tracer.start_active("root", true);
        let detached = tracer.span_builder("detached").ignore_active_scope().start();

        assert_ne!(detached.trace_id(), root.span().trace_id());
        assert_eq!(detached.parent_id(), None);

        detached.finish();
        root.close();
    }

    #[test]
    fn builder_fields_land_on_record() {
        let tracer = test_tracer(InMemorySpanExporter::default());

        let span = tracer
            .span_builder("query")
            .with_service("db")
            .with_resource_name("SELECT 1")
            .with_span_type("sql")
            .with_tag("peer.hostname", "db-1")
            .start();

        let record = span.record().unwrap();
        assert_eq!(record.service, "db");
        assert_eq!(record.resource_name, "SELECT 1");
        assert_eq!(record.span_type.as_deref(), Some("sql"));
        assert_eq!(record.tags.get("peer.hostname"), Some(&"db-1".to_string()));
    }

    #[test]
    fn resource_defaults_to_operation_name() {
        let tracer = test_tracer(InMemorySpanExporter::default());
        let span = tracer.start_span("http.request");

        assert_eq!(span.record().unwrap().resource_name, "http.request");
    }

    #[test]
    fn remote_parent_continues_the_trace() {
        let tracer = test_tracer(InMemorySpanExporter::default());

        let parent = SpanContext::new(42, 7).with_sampling_priority(1);
        let span = tracer.start_span_from("continued", &parent);

        assert_eq!(span.trace_id(), 42);
        assert_eq!(span.parent_id(), Some(7));
    }

    #[test]
    fn remote_parent_with_zero_span_id_has_no_parent() {
        let tracer = test_tracer(InMemorySpanExporter::default());

        let parent = SpanContext::new(42, 0);
        let span = tracer.start_span_from("continued", &parent);

        assert_eq!(span.trace_id(), 42);
        assert_eq!(span.parent_id(), None);
    }

    #[test]
    fn remote_parent_tags_header_becomes_trace_tags() {
        let tracer = test_tracer(InMemorySpanExporter::default());

        let parent = SpanContext::new(42, 7)
            .with_sampling_priority(2)
            .with_tags_header("_dd.p.dm=-4,_dd.p.usr.id=42");
        let span = tracer.start_span_from("continued", &parent);

        let tags = span.trace().tags();
        assert_eq!(tags.get_tag("_dd.p.dm"), Some("-4".to_string()));
        assert_eq!(tags.get_tag("_dd.p.usr.id"), Some("42".to_string()));
    }
}

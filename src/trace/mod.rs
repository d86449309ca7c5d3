//! # Trace core
//!
//! The tracing core consists of a few main structs:
//!
//! * The [`Tracer`] struct which creates spans and resolves their parents.
//! * The [`Span`] handle and the [`SpanRecord`] value it finishes into.
//! * The [`TraceContext`] shared by every span of one trace, which commits
//!   the sampling decision and flushes finished spans.
//! * The [`ScopeManager`] which tracks the active span per execution flow.

pub mod config;
pub mod error;
pub mod export;
pub mod id_generator;
pub mod sampler;
pub mod scope;
pub mod span;
pub mod span_context;
pub mod tags;
pub mod trace_context;
pub mod tracer;
pub mod upstream;

pub use config::{config, Config};
pub use error::{TraceError, TraceResult};
pub use export::{InMemorySpanExporter, NoopSpanExporter, SpanExporter};
pub use id_generator::{IdGenerator, IncrementIdGenerator, RandomIdGenerator};
pub use sampler::{
    AlwaysKeepSampler, Sampler, SamplingDecision, SamplingMechanism, SamplingPriority,
};
pub use scope::{Scope, ScopeListener, ScopeManager};
pub use span::{Span, SpanRecord};
pub use span_context::SpanContext;
pub use tags::TraceTagCollection;
pub use trace_context::TraceContext;
pub use tracer::{SpanBuilder, Tracer};
pub use upstream::UpstreamService;

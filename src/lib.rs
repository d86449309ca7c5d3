//! Trace-context lifecycle and propagation engine using Datadog's text
//! propagation formats.
//!
//! This crate implements the core of a distributed tracer: it creates,
//! links, closes and flushes spans within a trace, commits each trace's
//! sampling decision exactly once, and encodes that state into the compact
//! `x-datadog-*` header formats that cross process boundaries. Transports,
//! sampling-rate computation, and instrumentation hooks live elsewhere and
//! plug in through the [`trace::SpanExporter`] and [`trace::Sampler`]
//! traits and the [`propagation`] carrier traits.
//!
//! ## Getting started
//!
//! ```
//! use datadog_trace_core::trace::{Config, InMemorySpanExporter, Tracer};
//!
//! let exporter = InMemorySpanExporter::default();
//! let tracer = Tracer::builder()
//!     .with_config(Config::default().with_service_name("web"))
//!     .with_exporter(exporter.clone())
//!     .build();
//!
//! {
//!     let scope = tracer.start_active("handle-request", true);
//!     scope.span().set_tag("http.method", "GET");
//!
//!     let child = tracer.start_active("query-db", true);
//!     child.span().set_resource_name("SELECT * FROM users");
//!     child.close();
//!
//!     scope.close();
//! }
//!
//! let spans = exporter.get_finished_spans().unwrap();
//! assert_eq!(spans.len(), 2);
//! ```
//!
//! ## Crossing process boundaries
//!
//! The active span's context is injected into any string carrier and
//! extracted on the other side; a continued trace adopts the upstream
//! sampling decision and never re-samples:
//!
//! ```
//! use std::collections::HashMap;
//! use datadog_trace_core::trace::{NoopSpanExporter, Tracer};
//!
//! let tracer = Tracer::builder().with_exporter(NoopSpanExporter::new()).build();
//!
//! let scope = tracer.start_active("outbound", true);
//! let mut headers: HashMap<String, String> = HashMap::new();
//! tracer.inject_active(&mut headers);
//! scope.close();
//!
//! // ... on the receiving service ...
//! if let Some(parent) = tracer.extract(&headers) {
//!     let span = tracer.start_span_from("inbound", &parent);
//!     span.finish();
//! }
//! ```
//!
//! ## Flows, not threads
//!
//! The active scope is tracked per logical flow of execution, not per OS
//! thread. Asynchronous code pins its flow to a future with
//! [`FutureExt::with_context`]; the scope stays active across suspension
//! points even when the future resumes on another worker thread.

#![warn(missing_docs)]

pub mod propagation;
pub mod trace;

mod context;

pub use context::{Context, ContextGuard, FutureExt, WithContext};

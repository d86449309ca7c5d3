//! Injects and extracts [`SpanContext`]s using Datadog's header format.

use once_cell::sync::Lazy;
use std::borrow::Cow;

use crate::propagation::{Extractor, Injector};
use crate::trace::span_context::SpanContext;

/// Carrier key for the trace id.
pub const DATADOG_TRACE_ID_HEADER: &str = "x-datadog-trace-id";
/// Carrier key for the parent span id.
pub const DATADOG_PARENT_ID_HEADER: &str = "x-datadog-parent-id";
/// Carrier key for the sampling priority.
pub const DATADOG_SAMPLING_PRIORITY_HEADER: &str = "x-datadog-sampling-priority";
/// Carrier key for the trace origin.
pub const DATADOG_ORIGIN_HEADER: &str = "x-datadog-origin";
/// Carrier key for the propagated tags header.
pub const DATADOG_TAGS_HEADER: &str = "x-datadog-tags";

static DATADOG_HEADER_FIELDS: Lazy<[String; 5]> = Lazy::new(|| {
    [
        DATADOG_TRACE_ID_HEADER.to_string(),
        DATADOG_PARENT_ID_HEADER.to_string(),
        DATADOG_SAMPLING_PRIORITY_HEADER.to_string(),
        DATADOG_ORIGIN_HEADER.to_string(),
        DATADOG_TAGS_HEADER.to_string(),
    ]
});

/// Extracts and injects [`SpanContext`]s using Datadog's `x-datadog-*`
/// headers.
///
/// Extraction requires a parseable, nonzero trace id; every other field is
/// optional and best-effort, so one malformed header never costs the trace
/// linkage. Carriers may repeat a key: numeric fields take the first value
/// that parses, and a warning notes any value that didn't.
#[derive(Clone, Debug, Default)]
pub struct DatadogPropagator {
    _private: (),
}

impl DatadogPropagator {
    /// Creates a new `DatadogPropagator`.
    pub fn new() -> Self {
        DatadogPropagator::default()
    }

    /// The carrier keys this propagator reads and writes.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        DATADOG_HEADER_FIELDS.iter().map(|field| field.as_str())
    }

    /// Writes `context` into the carrier.
    ///
    /// Nothing is written when the context has an invalid (zero) trace id.
    pub fn inject(&self, context: &SpanContext, injector: &mut dyn Injector) {
        if context.trace_id == 0 {
            return;
        }

        injector.set(DATADOG_TRACE_ID_HEADER, context.trace_id.to_string());
        injector.set(DATADOG_PARENT_ID_HEADER, context.span_id.to_string());

        if let Some(priority) = context.sampling_priority {
            injector.set(DATADOG_SAMPLING_PRIORITY_HEADER, priority.to_string());
        }

        if let Some(origin) = &context.origin {
            injector.set(DATADOG_ORIGIN_HEADER, origin.clone());
        }

        if let Some(tags_header) = &context.tags_header {
            if !tags_header.is_empty() {
                injector.set(DATADOG_TAGS_HEADER, tags_header.clone());
            }
        }
    }

    /// Reads a propagated context out of the carrier.
    ///
    /// Returns `None` when the carrier holds no usable trace id; a trace id
    /// of zero is explicitly invalid.
    pub fn extract(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let trace_id = parse_u64(extractor, DATADOG_TRACE_ID_HEADER)?;

        if trace_id == 0 {
            return None;
        }

        let span_id = parse_u64(extractor, DATADOG_PARENT_ID_HEADER).unwrap_or(0);

        Some(SpanContext {
            trace_id,
            span_id,
            sampling_priority: parse_i32(extractor, DATADOG_SAMPLING_PRIORITY_HEADER),
            origin: first_non_empty(extractor, DATADOG_ORIGIN_HEADER),
            tags_header: first_non_empty(extractor, DATADOG_TAGS_HEADER),
        })
    }
}

fn parse_u64(extractor: &dyn Extractor, key: &str) -> Option<u64> {
    parse_first(extractor, key, |value| value.parse::<u64>().ok())
}

fn parse_i32(extractor: &dyn Extractor, key: &str) -> Option<i32> {
    // the parsed value may be a priority this library doesn't define, but
    // it is passed along without validation for forward compatibility
    parse_first(extractor, key, |value| value.parse::<i32>().ok())
}

/// Returns the first carrier value under `key` that `parse` accepts,
/// logging a warning when any value was present but unparseable.
fn parse_first<T, F>(extractor: &dyn Extractor, key: &str, parse: F) -> Option<T>
where
    F: Fn(&str) -> Option<T>,
{
    let values = extractor.get_all(key)?;

    let mut parsed = None;
    let mut garbage = false;

    for value in &values {
        match parse(value) {
            Some(result) if parsed.is_none() => parsed = Some(result),
            Some(_) => {}
            None => garbage = true,
        }
    }

    if garbage {
        tracing::warn!(
            header = key,
            values = %values.join(","),
            "could not parse some propagation header values"
        );
    }

    parsed
}

fn first_non_empty(extractor: &dyn Extractor, key: &str) -> Option<String> {
    extractor
        .get_all(key)?
        .into_iter()
        .find(|value| !value.is_empty())
        .map(Cow::into_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A carrier that can hold several values per key.
    #[derive(Default)]
    struct MultiCarrier(Vec<(String, String)>);

    impl MultiCarrier {
        fn with(pairs: &[(&str, &str)]) -> Self {
            MultiCarrier(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                    .collect(),
            )
        }
    }

    impl Extractor for MultiCarrier {
        fn get(&self, key: &str) -> Option<Cow<'_, str>> {
            let key = key.to_lowercase();
            self.0
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| Cow::Borrowed(v.as_str()))
        }

        fn keys(&self) -> Vec<Cow<'_, str>> {
            self.0.iter().map(|(k, _)| Cow::Borrowed(k.as_str())).collect()
        }

        fn get_all(&self, key: &str) -> Option<Vec<Cow<'_, str>>> {
            let key = key.to_lowercase();
            let values: Vec<Cow<'_, str>> = self
                .0
                .iter()
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| Cow::Borrowed(v.as_str()))
                .collect();
            (!values.is_empty()).then_some(values)
        }
    }

    fn extract(pairs: &[(&str, &str)]) -> Option<SpanContext> {
        DatadogPropagator::new().extract(&MultiCarrier::with(pairs))
    }

    #[test]
    fn extract_table() {
        let cases: Vec<(Vec<(&str, &str)>, Option<SpanContext>)> = vec![
            // no headers at all
            (vec![], None),
            // a priority alone is not a context
            (vec![(DATADOG_SAMPLING_PRIORITY_HEADER, "2")], None),
            // unparseable trace id
            (vec![(DATADOG_TRACE_ID_HEADER, "garbage")], None),
            // zero is explicitly invalid
            (vec![(DATADOG_TRACE_ID_HEADER, "0")], None),
            // trace id alone is enough
            (
                vec![(DATADOG_TRACE_ID_HEADER, "12345")],
                Some(SpanContext::new(12345, 0)),
            ),
            // a bad parent id degrades to zero without dropping the context
            (
                vec![
                    (DATADOG_TRACE_ID_HEADER, "12345"),
                    (DATADOG_PARENT_ID_HEADER, "garbage"),
                ],
                Some(SpanContext::new(12345, 0)),
            ),
            // the full set
            (
                vec![
                    (DATADOG_TRACE_ID_HEADER, "12345"),
                    (DATADOG_PARENT_ID_HEADER, "1"),
                    (DATADOG_SAMPLING_PRIORITY_HEADER, "2"),
                    (DATADOG_ORIGIN_HEADER, "synthetics"),
                    (DATADOG_TAGS_HEADER, "_dd.p.dm=-1"),
                ],
                Some(
                    SpanContext::new(12345, 1)
                        .with_sampling_priority(2)
                        .with_origin("synthetics")
                        .with_tags_header("_dd.p.dm=-1"),
                ),
            ),
            // a bad priority is treated as absent
            (
                vec![
                    (DATADOG_TRACE_ID_HEADER, "12345"),
                    (DATADOG_PARENT_ID_HEADER, "1"),
                    (DATADOG_SAMPLING_PRIORITY_HEADER, "soon"),
                ],
                Some(SpanContext::new(12345, 1)),
            ),
        ];

        for (pairs, expected) in cases {
            assert_eq!(extract(&pairs), expected, "headers: {pairs:?}");
        }
    }

    #[test]
    fn extract_takes_first_parseable_value() {
        let context = extract(&[
            (DATADOG_TRACE_ID_HEADER, "garbage"),
            (DATADOG_TRACE_ID_HEADER, "12345"),
            (DATADOG_TRACE_ID_HEADER, "678"),
        ])
        .unwrap();

        assert_eq!(context.trace_id, 12345);
    }

    #[test]
    fn extract_is_case_insensitive() {
        let context = extract(&[("X-Datadog-Trace-Id", "99"), ("X-DATADOG-PARENT-ID", "7")]).unwrap();
        assert_eq!(context.trace_id, 99);
        assert_eq!(context.span_id, 7);
    }

    #[test]
    fn inject_writes_all_present_fields() {
        let context = SpanContext::new(12345, 1)
            .with_sampling_priority(2)
            .with_origin("synthetics")
            .with_tags_header("_dd.p.dm=-1,_dd.p.usr.id=42");

        let mut carrier: HashMap<String, String> = HashMap::new();
        DatadogPropagator::new().inject(&context, &mut carrier);

        assert_eq!(carrier.get(DATADOG_TRACE_ID_HEADER), Some(&"12345".to_string()));
        assert_eq!(carrier.get(DATADOG_PARENT_ID_HEADER), Some(&"1".to_string()));
        assert_eq!(
            carrier.get(DATADOG_SAMPLING_PRIORITY_HEADER),
            Some(&"2".to_string())
        );
        assert_eq!(
            carrier.get(DATADOG_ORIGIN_HEADER),
            Some(&"synthetics".to_string())
        );
        assert_eq!(
            carrier.get(DATADOG_TAGS_HEADER),
            Some(&"_dd.p.dm=-1,_dd.p.usr.id=42".to_string())
        );
    }

    #[test]
    fn inject_skips_absent_fields() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        DatadogPropagator::new().inject(&SpanContext::new(12345, 1), &mut carrier);

        assert_eq!(carrier.len(), 2);
        assert!(!carrier.contains_key(DATADOG_SAMPLING_PRIORITY_HEADER));
        assert!(!carrier.contains_key(DATADOG_ORIGIN_HEADER));
        assert!(!carrier.contains_key(DATADOG_TAGS_HEADER));
    }

    #[test]
    fn inject_ignores_invalid_context() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        DatadogPropagator::new().inject(&SpanContext::new(0, 1), &mut carrier);
        assert!(carrier.is_empty());
    }

    #[test]
    fn round_trip() {
        let context = SpanContext::new(12345, 1)
            .with_sampling_priority(-1)
            .with_origin("rum")
            .with_tags_header("_dd.p.dm=-4");

        let mut carrier: HashMap<String, String> = HashMap::new();
        DatadogPropagator::new().inject(&context, &mut carrier);

        assert_eq!(DatadogPropagator::new().extract(&carrier), Some(context));
    }

    #[test]
    fn fields_cover_all_headers() {
        let propagator = DatadogPropagator::new();
        let fields: Vec<&str> = propagator.fields().collect();
        assert_eq!(
            fields,
            vec![
                DATADOG_TRACE_ID_HEADER,
                DATADOG_PARENT_ID_HEADER,
                DATADOG_SAMPLING_PRIORITY_HEADER,
                DATADOG_ORIGIN_HEADER,
                DATADOG_TAGS_HEADER,
            ]
        );
    }
}

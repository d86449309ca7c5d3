//! Trace-level propagated tags and the `x-datadog-tags` header codec.
//!
//! Tags whose key starts with the reserved `_dd.p.` prefix are propagated
//! horizontally, from upstream services and to downstream services, in a
//! `key1=value1,key2=value2` header. The rendered header is cached on the
//! collection and invalidated by any mutation.

use std::sync::Mutex;

/// Keys with this prefix are propagated across process boundaries.
pub const PROPAGATED_TAG_PREFIX: &str = "_dd.p.";

/// Trace tag recording the mechanism behind a kept sampling decision.
pub const TAG_DECISION_MAKER: &str = "_dd.p.dm";

/// Trace tag holding the accumulated upstream service chain.
pub const TAG_UPSTREAM_SERVICES: &str = "_dd.p.upstream_services";

/// Diagnostic tag set when the rendered header would exceed its size cap.
/// Not itself propagated (no reserved prefix), but visible on the trace.
pub const TAG_PROPAGATION_ERROR: &str = "_dd.propagation_error";

pub(crate) const TAG_PAIR_SEPARATOR: char = ',';
pub(crate) const KEY_VALUE_SEPARATOR: char = '=';

// the shortest valid tag has the prefix, a 1-char key and a 1-char value:
// "_dd.p.a=b"
const PROPAGATED_TAG_PREFIX_LEN: usize = PROPAGATED_TAG_PREFIX.len();
const MIN_PROPAGATED_TAG_LEN: usize = PROPAGATED_TAG_PREFIX_LEN + 3;

/// An ordered collection of trace-level tags with a cached, size-capped
/// header rendering of its propagated subset.
///
/// Key comparisons are case-insensitive and insertion order is preserved,
/// so the rendered header is stable across hops.
#[derive(Debug)]
pub struct TraceTagCollection {
    max_header_length: usize,
    inner: Mutex<TagsInner>,
}

#[derive(Debug, Default)]
struct TagsInner {
    tags: Vec<(String, String)>,
    cached_header: Option<String>,
}

impl TraceTagCollection {
    /// Creates an empty collection with the given header size cap.
    pub fn new(max_header_length: usize) -> Self {
        TraceTagCollection {
            max_header_length,
            inner: Mutex::new(TagsInner::default()),
        }
    }

    /// Parses an `x-datadog-tags` header value in `key1=value1,key2=value2`
    /// format. Only tags carrying the reserved prefix are kept; pairs that
    /// are too short, have no value, or put the separator inside the prefix
    /// are discarded.
    pub fn parse(header: &str, max_header_length: usize) -> Self {
        let collection = TraceTagCollection::new(max_header_length);

        if header.is_empty() {
            return collection;
        }

        let mut tags = Vec::new();

        for pair in header.split(TAG_PAIR_SEPARATOR).filter(|p| !p.is_empty()) {
            if pair.len() < MIN_PROPAGATED_TAG_LEN || !pair.starts_with(PROPAGATED_TAG_PREFIX) {
                continue;
            }

            // the first equals sign separates key from value; the value can
            // contain additional equals signs (e.g. base64 padding), so never
            // split on any but the first
            if let Some(separator) = pair.find(KEY_VALUE_SEPARATOR) {
                // "_dd.p.a=b"
                //         ^ separator at index 7 or higher, before the last char
                if separator > PROPAGATED_TAG_PREFIX_LEN && separator < pair.len() - 1 {
                    tags.push((pair[..separator].to_string(), pair[separator + 1..].to_string()));
                }
            }
        }

        collection.inner.lock().expect("trace tags poisoned").tags = tags;
        collection
    }

    /// Inserts or overwrites a tag. Matching is case-insensitive; insertion
    /// order of first appearance is preserved.
    pub fn set_tag<K, V>(&self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        let value = value.into();
        let mut inner = self.inner.lock().expect("trace tags poisoned");
        inner.cached_header = None;

        if let Some(existing) = inner
            .tags
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            existing.1 = value;
        } else {
            inner.tags.push((key, value));
        }
    }

    /// Removes a tag by key, if present.
    pub fn remove_tag(&self, key: &str) {
        let mut inner = self.inner.lock().expect("trace tags poisoned");
        inner.cached_header = None;
        inner.tags.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// Returns the value of a tag by key.
    pub fn get_tag(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("trace tags poisoned")
            .tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
    }

    /// Number of tags in the collection.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("trace tags poisoned").tags.len()
    }

    /// Whether the collection holds no tags.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all tags in insertion order.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.inner.lock().expect("trace tags poisoned").tags.clone()
    }

    /// Renders the propagated subset into an `x-datadog-tags` header value.
    ///
    /// Only tags with the reserved prefix and a non-empty value qualify.
    /// If the accumulated length exceeds the configured maximum the render
    /// is abandoned: the empty string is returned, and the collection gains
    /// a single `_dd.propagation_error=max_size` tag so the overflow stays
    /// observable downstream. Truncating instead is not an option, since a
    /// header one hop over the cap would keep compounding along the chain.
    ///
    /// The rendered value is cached and reused until the next mutation.
    pub fn to_propagation_header(&self) -> String {
        let mut inner = self.inner.lock().expect("trace tags poisoned");

        if let Some(cached) = &inner.cached_header {
            return cached.clone();
        }

        let mut header = String::new();

        for (key, value) in &inner.tags {
            if key.starts_with(PROPAGATED_TAG_PREFIX) && !value.is_empty() {
                if !header.is_empty() {
                    header.push(TAG_PAIR_SEPARATOR);
                }

                header.push_str(key);
                header.push(KEY_VALUE_SEPARATOR);
                header.push_str(value);

                if header.len() > self.max_header_length {
                    tracing::warn!(
                        length = header.len(),
                        max_length = self.max_header_length,
                        "propagated tags header exceeds maximum length, dropping header"
                    );

                    upsert(&mut inner.tags, TAG_PROPAGATION_ERROR, "max_size");
                    // cache the empty render so the marker is added only once
                    inner.cached_header = Some(String::new());
                    return String::new();
                }
            }
        }

        inner.cached_header = Some(header.clone());
        header
    }
}

fn upsert(tags: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(existing) = tags.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        existing.1 = value.to_string();
    } else {
        tags.push((key.to_string(), value.to_string()));
    }
}

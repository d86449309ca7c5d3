//! The upstream service chain carried in the `_dd.p.upstream_services` tag.
//!
//! Each service that makes (or re-asserts) a sampling decision appends a
//! compact hop record to the chain:
//!
//! ```text
//! _dd.p.upstream_services=bWNudWx0eS13ZWI|0|1;dHJhY2Utc3RhdHMtcXVlcnk|2|4
//! ```
//!
//! - hops are separated by `;`
//! - fields within a hop are separated by `|`
//! - field #1 is the UTF-8 service name, base64-encoded without padding
//! - field #2 is the sampling priority
//! - field #3 is the sampling mechanism
//! - field #4 is the sampling rate, rounded up to four decimal places, when
//!   the decision was rate-based; otherwise the field is omitted
//!
//! Chains mutate by appending in place, never by replacing: a service seen
//! again gets its new values appended to its existing hop, so the full
//! sampling history survives every process boundary without the chain
//! growing a new hop per pass.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::trace::sampler::SamplingDecision;

/// Separator between hops in the chain.
pub const GROUP_SEPARATOR: char = ';';
/// Separator between fields within a hop.
pub const FIELD_SEPARATOR: char = '|';

/// One hop of the upstream service chain.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamService {
    /// Name of the service that made the decision.
    pub service_name: String,
    /// The sampling priority the service decided on.
    pub sampling_priority: i32,
    /// The mechanism behind the decision.
    pub sampling_mechanism: i32,
    /// The sampling rate, when the decision was rate-based.
    pub sampling_rate: Option<f64>,
}

impl UpstreamService {
    /// Creates a hop record.
    pub fn new<T: Into<String>>(
        service_name: T,
        sampling_priority: i32,
        sampling_mechanism: i32,
        sampling_rate: Option<f64>,
    ) -> Self {
        UpstreamService {
            service_name: service_name.into(),
            sampling_priority,
            sampling_mechanism,
            sampling_rate,
        }
    }

    /// Creates a hop record for this service from a trace's decision.
    pub fn from_decision<T: Into<String>>(service_name: T, decision: &SamplingDecision) -> Self {
        UpstreamService::new(
            service_name,
            decision.priority,
            decision.mechanism as i32,
            decision.rate,
        )
    }

    /// The base64-encoded (no padding) service name leading this hop.
    fn encoded_service_name(&self) -> String {
        STANDARD_NO_PAD.encode(self.service_name.as_bytes())
    }

    /// The decision fields of this hop, without the service name.
    fn decision_fields(&self) -> String {
        let mut fields = format!("{}{}{}", self.sampling_priority, FIELD_SEPARATOR, self.sampling_mechanism);

        if let Some(rate) = self.sampling_rate {
            fields.push(FIELD_SEPARATOR);
            fields.push_str(&format_rate(round_up(rate, 4)));
        }

        fields
    }

    /// Serializes the full hop record, `base64(service)|priority|mechanism[|rate]`.
    pub fn serialize(&self) -> String {
        format!(
            "{}{}{}",
            self.encoded_service_name(),
            FIELD_SEPARATOR,
            self.decision_fields()
        )
    }
}

/// Rounds `value` up at `digits` decimal places.
pub(crate) fn round_up(value: f64, digits: i32) -> f64 {
    let pow = 10f64.powi(digits);
    (value * pow).ceil() / pow
}

fn format_rate(rate: f64) -> String {
    format!("{rate}")
}

/// Appends a hop to a serialized chain.
///
/// The chain is scanned for an existing hop belonging to the same service;
/// the match must be a whole leading field (at the start of the chain or
/// right after a `;`), so a service whose encoded name is a suffix of
/// another's can never splice into the wrong hop. When a hop is found, the
/// new decision fields are appended to it after a `|`; otherwise the full
/// record is appended as a new `;`-separated hop.
pub fn append_upstream_service(chain: &str, hop: &UpstreamService) -> String {
    if chain.is_empty() {
        return hop.serialize();
    }

    let encoded = hop.encoded_service_name();
    let mut needle = encoded.clone();
    needle.push(FIELD_SEPARATOR);

    let mut search_start = 0;

    while search_start <= chain.len() {
        let key_start = match chain[search_start..].find(&needle) {
            Some(offset) => search_start + offset,
            None => {
                // service not seen yet, append as a new hop
                return format!("{chain}{GROUP_SEPARATOR}{}", hop.serialize());
            }
        };

        if key_start == 0 || chain[..key_start].ends_with(GROUP_SEPARATOR) {
            let value_start = key_start + needle.len();

            return match chain[value_start..].find(GROUP_SEPARATOR) {
                // the hop is the last one, append at the end of the chain
                None => format!("{chain}{FIELD_SEPARATOR}{}", hop.decision_fields()),
                // otherwise insert right before the next hop
                Some(offset) => {
                    let insert_at = value_start + offset;
                    format!(
                        "{}{}{}{}",
                        &chain[..insert_at],
                        FIELD_SEPARATOR,
                        hop.decision_fields(),
                        &chain[insert_at..]
                    )
                }
            };
        }

        // matched inside another hop's field, keep looking
        search_start = key_start + encoded.len();
    }

    chain.to_string()
}

/// Appends `value` to the tag named `key` inside a rendered
/// `key1=value1,key2=value2` header, in place and without re-parsing.
///
/// The scan only accepts `key=` as a whole tag key, at the start of the
/// header or right after a `,`, so a key that is a suffix of another key
/// (`bar=` inside `foobar=`) is skipped. When the key is found, the new
/// value is appended to its current value after `value_separator`; when it
/// is not, a new `key=value` pair is appended.
pub fn append_tag_value(header: &str, value_separator: char, key: &str, value: &str) -> String {
    let mut needle = String::with_capacity(key.len() + 1);
    needle.push_str(key);
    needle.push(crate::trace::tags::KEY_VALUE_SEPARATOR);

    let mut search_start = 0;

    while search_start <= header.len() {
        let key_start = match header[search_start..].find(&needle) {
            Some(offset) => search_start + offset,
            None => {
                // key not found, append as a new key/value pair
                return if header.is_empty() {
                    format!("{key}{}{value}", crate::trace::tags::KEY_VALUE_SEPARATOR)
                } else {
                    format!(
                        "{header}{}{key}{}{value}",
                        crate::trace::tags::TAG_PAIR_SEPARATOR,
                        crate::trace::tags::KEY_VALUE_SEPARATOR
                    )
                };
            }
        };

        // make sure this is a whole tag key and not just a substring
        if key_start == 0
            || header[..key_start].ends_with(crate::trace::tags::TAG_PAIR_SEPARATOR)
        {
            let value_start = key_start + needle.len();

            return match header[value_start..].find(crate::trace::tags::TAG_PAIR_SEPARATOR) {
                // the tag's current value runs to the end of the header
                None => format!("{header}{value_separator}{value}"),
                // insert the new value at the end of the tag's current value
                Some(offset) => {
                    let insert_at = value_start + offset;
                    format!(
                        "{}{}{}{}",
                        &header[..insert_at],
                        value_separator,
                        value,
                        &header[insert_at..]
                    )
                }
            };
        }

        // this was not the key we were looking for, skip and keep looking
        search_start = key_start + key.len();
    }

    header.to_string()
}

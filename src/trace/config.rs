//! Tracer configuration
//!
//! Configuration for the trace core; defaults can be overridden through the
//! usual `DD_*` environment variables or through the `with_*` builders.

use std::env;
use std::str::FromStr;

const ENV_SERVICE: &str = "DD_SERVICE";
const ENV_PARTIAL_FLUSH_ENABLED: &str = "DD_TRACE_PARTIAL_FLUSH_ENABLED";
const ENV_PARTIAL_FLUSH_MIN_SPANS: &str = "DD_TRACE_PARTIAL_FLUSH_MIN_SPANS";
const ENV_TAGS_HEADER_MAX_LENGTH: &str = "DD_TRACE_X_DATADOG_TAGS_MAX_LENGTH";

/// Service name used when `DD_SERVICE` is not set.
pub const DEFAULT_SERVICE_NAME: &str = "unnamed-rust-service";
/// Spans buffered on an unfinished trace before a partial flush triggers.
pub const DEFAULT_PARTIAL_FLUSH_MIN_SPANS: usize = 500;
/// Maximum rendered length of the propagated tags header.
pub const DEFAULT_TAGS_HEADER_MAX_LENGTH: usize = 512;

/// Default tracer configuration, with environment overrides applied.
pub fn config() -> Config {
    Config::default()
}

/// Tracer configuration.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Service name inherited by every span that doesn't set its own.
    pub service_name: String,

    /// Whether finished spans may be flushed before the whole trace ends.
    pub partial_flush_enabled: bool,

    /// Number of buffered finished spans that triggers a partial flush.
    pub partial_flush_min_spans: usize,

    /// Maximum length of the rendered `x-datadog-tags` header; renders that
    /// would exceed it are dropped and the tag set is marked instead.
    pub tags_header_max_length: usize,
}

impl Config {
    /// Sets the service name.
    pub fn with_service_name<T: Into<String>>(mut self, service_name: T) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Enables partial flushing once `min_spans` finished spans are buffered
    /// on a still-open trace.
    pub fn with_partial_flush(mut self, min_spans: usize) -> Self {
        self.partial_flush_enabled = true;
        self.partial_flush_min_spans = min_spans;
        self
    }

    /// Sets the maximum rendered length of the propagated tags header.
    pub fn with_tags_header_max_length(mut self, max_length: usize) -> Self {
        self.tags_header_max_length = max_length;
        self
    }
}

impl Default for Config {
    /// Create the default configuration, honoring environment overrides.
    fn default() -> Self {
        let mut config = Config {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            partial_flush_enabled: false,
            partial_flush_min_spans: DEFAULT_PARTIAL_FLUSH_MIN_SPANS,
            tags_header_max_length: DEFAULT_TAGS_HEADER_MAX_LENGTH,
        };

        if let Ok(service_name) = env::var(ENV_SERVICE) {
            if !service_name.is_empty() {
                config.service_name = service_name;
            }
        }

        if let Ok(enabled) = env::var(ENV_PARTIAL_FLUSH_ENABLED) {
            match parse_bool(&enabled) {
                Some(value) => config.partial_flush_enabled = value,
                None => tracing::warn!(
                    env = ENV_PARTIAL_FLUSH_ENABLED,
                    value = %enabled,
                    "invalid boolean in environment, keeping default"
                ),
            }
        }

        if let Ok(min_spans) = env::var(ENV_PARTIAL_FLUSH_MIN_SPANS) {
            match usize::from_str(&min_spans) {
                Ok(value) if value > 0 => config.partial_flush_min_spans = value,
                _ => tracing::warn!(
                    env = ENV_PARTIAL_FLUSH_MIN_SPANS,
                    value = %min_spans,
                    "invalid span count in environment, keeping default"
                ),
            }
        }

        if let Ok(max_length) = env::var(ENV_TAGS_HEADER_MAX_LENGTH) {
            match usize::from_str(&max_length) {
                Ok(value) => config.tags_header_max_length = value,
                Err(_) => tracing::warn!(
                    env = ENV_TAGS_HEADER_MAX_LENGTH,
                    value = %max_length,
                    "invalid header length in environment, keeping default"
                ),
            }
        }

        config
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") || value == "1" {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") || value == "0" {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        temp_env::with_vars_unset(
            [
                ENV_SERVICE,
                ENV_PARTIAL_FLUSH_ENABLED,
                ENV_PARTIAL_FLUSH_MIN_SPANS,
                ENV_TAGS_HEADER_MAX_LENGTH,
            ],
            || {
                let config = Config::default();
                assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
                assert!(!config.partial_flush_enabled);
                assert_eq!(config.partial_flush_min_spans, DEFAULT_PARTIAL_FLUSH_MIN_SPANS);
                assert_eq!(config.tags_header_max_length, DEFAULT_TAGS_HEADER_MAX_LENGTH);
            },
        );
    }

    #[test]
    fn environment_overrides() {
        temp_env::with_vars(
            [
                (ENV_SERVICE, Some("billing")),
                (ENV_PARTIAL_FLUSH_ENABLED, Some("true")),
                (ENV_PARTIAL_FLUSH_MIN_SPANS, Some("50")),
                (ENV_TAGS_HEADER_MAX_LENGTH, Some("128")),
            ],
            || {
                let config = Config::default();
                assert_eq!(config.service_name, "billing");
                assert!(config.partial_flush_enabled);
                assert_eq!(config.partial_flush_min_spans, 50);
                assert_eq!(config.tags_header_max_length, 128);
            },
        );
    }

    #[test]
    fn invalid_environment_values_keep_defaults() {
        temp_env::with_vars(
            [
                (ENV_PARTIAL_FLUSH_ENABLED, Some("yes please")),
                (ENV_PARTIAL_FLUSH_MIN_SPANS, Some("0")),
                (ENV_TAGS_HEADER_MAX_LENGTH, Some("lots")),
            ],
            || {
                let config = Config::default();
                assert!(!config.partial_flush_enabled);
                assert_eq!(config.partial_flush_min_spans, DEFAULT_PARTIAL_FLUSH_MIN_SPANS);
                assert_eq!(config.tags_header_max_length, DEFAULT_TAGS_HEADER_MAX_LENGTH);
            },
        );
    }

    #[test]
    fn builders() {
        let config = Config::default()
            .with_service_name("checkout")
            .with_partial_flush(10)
            .with_tags_header_max_length(64);

        assert_eq!(config.service_name, "checkout");
        assert!(config.partial_flush_enabled);
        assert_eq!(config.partial_flush_min_spans, 10);
        assert_eq!(config.tags_header_max_length, 64);
    }
}

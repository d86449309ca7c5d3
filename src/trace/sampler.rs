//! Sampling decision types and the sampler collaborator interface.
//!
//! The core never computes sampling rates itself; it asks a [`Sampler`] for
//! a decision once per locally-started trace, stores the result on the
//! trace, and locks it when the first spans leave the process (root close,
//! partial flush, or header injection).

use std::fmt;

use crate::trace::span::SpanRecord;

/// Sampling priority values understood by the agent and by downstream
/// services.
///
/// Values received from upstream services are carried as raw `i32` without
/// validation for forward compatibility; this enum names the values this
/// library can produce itself.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingPriority {
    /// The user explicitly asked for this trace to be dropped.
    UserReject = -1,
    /// The sampler decided to drop this trace.
    AutoReject = 0,
    /// The sampler decided to keep this trace.
    AutoKeep = 1,
    /// The user explicitly asked for this trace to be kept.
    UserKeep = 2,
}

impl SamplingPriority {
    /// Maps a raw priority value onto a known priority, if it is one.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            -1 => Some(SamplingPriority::UserReject),
            0 => Some(SamplingPriority::AutoReject),
            1 => Some(SamplingPriority::AutoKeep),
            2 => Some(SamplingPriority::UserKeep),
            _ => None,
        }
    }

    /// Whether this priority keeps the trace.
    pub fn is_keep(self) -> bool {
        (self as i32) > 0
    }
}

/// The mechanism used to make a trace sampling decision.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingMechanism {
    /// No decision was made, or it was made with an unknown mechanism.
    None = 0,
    /// A rate computed automatically by the agent.
    AgentRate = 1,
    /// A rate computed automatically by the backend.
    RemoteRate = 2,
    /// A sampling rule or global rate configured by the user.
    Rule = 3,
    /// A manual decision by the user (e.g. the `manual.keep` tag).
    Manual = 4,
    /// The decision was made by an upstream service and adopted verbatim.
    Propagated = 5,
}

/// A trace sampling decision: priority, the mechanism that produced it, and
/// the sampling rate if one was used.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingDecision {
    /// The sampling priority. Raw `i32` so that propagated values outside
    /// [`SamplingPriority`] survive a pass-through.
    pub priority: i32,
    /// How the decision was made.
    pub mechanism: SamplingMechanism,
    /// The sampling rate behind the decision, when one applies.
    pub rate: Option<f64>,
}

impl SamplingDecision {
    /// Creates a new sampling decision.
    pub const fn new(priority: i32, mechanism: SamplingMechanism, rate: Option<f64>) -> Self {
        SamplingDecision {
            priority,
            mechanism,
            rate,
        }
    }

    /// Whether the decision keeps the trace.
    pub fn is_keep(&self) -> bool {
        self.priority > 0
    }
}

impl Default for SamplingDecision {
    /// The fall back decision used when no sampler is configured.
    fn default() -> Self {
        SamplingDecision::new(
            SamplingPriority::AutoKeep as i32,
            SamplingMechanism::None,
            None,
        )
    }
}

/// The sampling collaborator.
///
/// `decide` is called at most once per trace, under the trace's exclusive
/// section, when the first span of a locally-started trace is registered.
/// It is never called for traces continued from a propagated context.
/// Implementations must be cheap and CPU-bound.
pub trait Sampler: Send + Sync + fmt::Debug {
    /// Produces a sampling decision for the trace rooted at `span`.
    fn decide(&self, span: &SpanRecord) -> SamplingDecision;
}

/// A [`Sampler`] that keeps every trace at agent rate.
#[derive(Clone, Debug, Default)]
pub struct AlwaysKeepSampler {
    _private: (),
}

impl AlwaysKeepSampler {
    /// Creates a new `AlwaysKeepSampler`.
    pub fn new() -> Self {
        AlwaysKeepSampler::default()
    }
}

impl Sampler for AlwaysKeepSampler {
    fn decide(&self, _span: &SpanRecord) -> SamplingDecision {
        SamplingDecision::new(
            SamplingPriority::AutoKeep as i32,
            SamplingMechanism::AgentRate,
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_round_trip() {
        for priority in [
            SamplingPriority::UserReject,
            SamplingPriority::AutoReject,
            SamplingPriority::AutoKeep,
            SamplingPriority::UserKeep,
        ] {
            assert_eq!(SamplingPriority::from_i32(priority as i32), Some(priority));
        }

        assert_eq!(SamplingPriority::from_i32(3), None);
        assert_eq!(SamplingPriority::from_i32(-2), None);
    }

    #[test]
    fn keep_priorities() {
        assert!(SamplingPriority::AutoKeep.is_keep());
        assert!(SamplingPriority::UserKeep.is_keep());
        assert!(!SamplingPriority::AutoReject.is_keep());
        assert!(!SamplingPriority::UserReject.is_keep());
    }

    #[test]
    fn default_decision_keeps() {
        let decision = SamplingDecision::default();
        assert_eq!(decision.priority, SamplingPriority::AutoKeep as i32);
        assert_eq!(decision.mechanism, SamplingMechanism::None);
        assert_eq!(decision.rate, None);
        assert!(decision.is_keep());
    }
}

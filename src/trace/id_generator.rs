//! Id Generator

use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;

/// Interface for generating trace and span ids.
///
/// Ids are unsigned 64-bit and never zero; zero is the invalid sentinel in
/// the propagation headers.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new trace id.
    fn new_trace_id(&self) -> u64;

    /// Generate a new span id.
    fn new_span_id(&self) -> u64;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates trace and span ids using a random number generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> u64 {
        CURRENT_RNG.with(|rng| nonzero(&mut rng.borrow_mut()))
    }

    fn new_span_id(&self) -> u64 {
        CURRENT_RNG.with(|rng| nonzero(&mut rng.borrow_mut()))
    }
}

fn nonzero(rng: &mut rngs::SmallRng) -> u64 {
    loop {
        let id = rng.gen::<u64>();
        if id != 0 {
            return id;
        }
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// [`IdGenerator`] implementation that increments a counter for each new id.
/// This helps produce predictable ids for testing.
#[derive(Debug)]
pub struct IncrementIdGenerator(std::sync::atomic::AtomicU64);

impl IncrementIdGenerator {
    /// Create a new [`IncrementIdGenerator`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for IncrementIdGenerator {
    fn default() -> Self {
        Self(std::sync::atomic::AtomicU64::new(1))
    }
}

impl IdGenerator for IncrementIdGenerator {
    fn new_trace_id(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    fn new_span_id(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_nonzero() {
        let generator = RandomIdGenerator::default();
        for _ in 0..64 {
            assert_ne!(generator.new_trace_id(), 0);
            assert_ne!(generator.new_span_id(), 0);
        }
    }

    #[test]
    fn increment_ids_are_sequential() {
        let generator = IncrementIdGenerator::new();
        assert_eq!(generator.new_trace_id(), 1);
        assert_eq!(generator.new_span_id(), 2);
        assert_eq!(generator.new_span_id(), 3);
    }
}

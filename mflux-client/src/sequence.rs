//! Request sequence numbering.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Hands out `(generation, sequence)` pairs for requests.
///
/// The sequence increases by one for every request made through any
/// connection sharing the counter. The generation is set by the caller,
/// usually to tell process restarts apart.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    generation: AtomicI64,
    sequence: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter shared by every connection in the process that was not
    /// given its own.
    pub fn global() -> Arc<SequenceCounter> {
        static GLOBAL: OnceLock<Arc<SequenceCounter>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SequenceCounter::new())).clone()
    }

    /// Returns the current generation and the next sequence number.
    pub fn next(&self) -> (i64, u64) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        (self.generation.load(Ordering::SeqCst), sequence)
    }

    pub fn generation(&self) -> i64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn set_generation(&self, generation: i64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    /// The last sequence number handed out, `0` if none.
    pub fn current(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

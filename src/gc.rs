//! Garbage collector interface seen by the interpreter.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// The interpreter asks `must_collect` before decoding every instruction and
/// calls `collect` synchronously when it answers yes.
pub trait GarbageCollector: Send + Sync {
    fn must_collect(&self) -> bool;
    fn collect(&self);
}

/// Collector that never runs, the heap only grows.
#[derive(Debug, Default)]
pub struct NoopCollector;

impl GarbageCollector for NoopCollector {
    fn must_collect(&self) -> bool {
        false
    }

    fn collect(&self) {}
}

/// Collector driven by an external memory pressure flag. It only counts
/// collections, reclaiming memory is left to whoever raises the flag.
#[derive(Debug, Default)]
pub struct FlaggedCollector {
    pending: AtomicBool,
    collections: AtomicUsize,
}

impl FlaggedCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Acquire)
    }
}

impl GarbageCollector for FlaggedCollector {
    fn must_collect(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn collect(&self) {
        self.pending.store(false, Ordering::Release);
        self.collections.fetch_add(1, Ordering::AcqRel);
    }
}

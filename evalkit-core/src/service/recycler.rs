//! Recycling of task parameters
//!
//! Parallel batches borrow one parameter record per case and return it the
//! moment the case finishes. [`ParamRecycler::release`] is the only way back
//! into the pool and it always resets the record first, so an idle record never
//! holds a request, case, context or result array from the batch that used it.

use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A record that can be cleared for reuse
pub(crate) trait Recyclable: Default + Send {
    /// Drop every batch reference held by the record
    fn reset(&mut self);

    /// Whether the record holds no batch references
    fn is_reset(&self) -> bool;
}

/// Counters of one recycler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecyclerStats {
    /// Records ever allocated
    pub allocated: usize,
    /// Records waiting for reuse
    pub idle: usize,
}

/// Pool of reusable records of one type
pub(crate) struct ParamRecycler<P> {
    idle: Mutex<Vec<Box<P>>>,
    allocated: AtomicUsize,
}

impl<P: Recyclable> ParamRecycler<P> {
    pub(crate) fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take an empty record, allocating only when none is idle
    pub(crate) fn acquire(&self) -> Box<P> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        match reused {
            Some(param) => param,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Box::default()
            }
        }
    }

    /// Reset a record and return it to the pool
    pub(crate) fn release(&self, mut param: Box<P>) {
        param.reset();
        debug_assert!(param.is_reset());
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(param);
        }
    }

    pub(crate) fn stats(&self) -> RecyclerStats {
        RecyclerStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            idle: self.idle.lock().map(|idle| idle.len()).unwrap_or_default(),
        }
    }
}

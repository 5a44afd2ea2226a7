// this_file: src/refcount.rs
//! Lock-free reference counting with lifecycle hooks.
//!
//! [`RefCount`] is the counter embedded in every shared object. It only
//! uses atomic read-modify-write operations; the owner decides what
//! happens at the 0→1 and 1→0 transitions by implementing [`Lifecycle`].

use log::error;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hooks fired by [`RefCount`] on count transitions.
///
/// Hooks may take locks, but must not call back into the same counter.
pub trait Lifecycle {
    /// Called when the count goes from 0 to 1.
    fn on_first_reference(&self) {}

    /// Called when the count goes from 1 to 0.
    fn on_last_release(&self);
}

/// What an object does when its last reference is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Release the object's storage.
    DestroyOnZero,
    /// Hand the object back to its owning pool, storage intact.
    ReturnToPool,
}

/// Atomic, thread-safe reference counter.
#[derive(Debug, Default)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    /// A counter with no references.
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// Increment the count and return the prior value.
    ///
    /// Fires `on_first_reference` when the prior value was zero.
    pub fn acquire<H: Lifecycle + ?Sized>(&self, hooks: &H) -> usize {
        let prior = self.count.fetch_add(1, Ordering::AcqRel);
        if prior == 0 {
            hooks.on_first_reference();
        }
        prior
    }

    /// Decrement the count and return the prior value.
    ///
    /// Fires `on_last_release` when the prior value was one. Releasing an
    /// object with no references leaves the count at zero, fires nothing,
    /// and returns 0.
    pub fn release<H: Lifecycle + ?Sized>(&self, hooks: &H) -> usize {
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(1) => {
                hooks.on_last_release();
                1
            }
            Ok(prior) => prior,
            Err(_) => {
                error!("reference released on an object with no references");
                debug_assert!(false, "reference count underflow");
                0
            }
        }
    }

    /// Current count. Stale as soon as it is read; diagnostics only.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

// this_file: src/provider.rs
//! External memory provider interface.
//!
//! The allocator never obtains memory itself; it asks a [`MemoryProvider`]
//! for whole regions and hands them back once they are entirely free.
//! [`HeapProvider`] is the in-process implementation, backed by the global
//! allocator and optionally capped by a byte limit.

use crate::error::{Error, Result};
use log::{debug, error};
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Alignment of every heap region (one cache line).
pub const REGION_ALIGN: usize = 64;

/// Opaque identifier of a provider region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionHandle(pub u64);

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// A contiguous span of memory owned by the allocator until released.
///
/// The base address never changes while the region is alive.
#[derive(Debug)]
pub struct Region {
    handle: RegionHandle,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: a region is plain memory with a single owner; access to the
// bytes is coordinated by the allocator and the bitmaps built on it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Wrap a span handed out by a provider.
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes that stay valid and unmoved until
    /// the region is passed back to the provider that created it.
    pub unsafe fn from_raw_parts(handle: RegionHandle, base: NonNull<u8>, len: usize) -> Self {
        Self { handle, base, len }
    }

    /// Provider handle
    pub fn handle(&self) -> RegionHandle {
        self.handle
    }

    /// First byte of the region
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Source of memory regions.
pub trait MemoryProvider: Send + Sync {
    /// Obtain a region of exactly `size` bytes.
    ///
    /// Fails with [`Error::AllocationFailure`] when memory is exhausted.
    fn allocate_region(&self, size: usize) -> Result<Region>;

    /// Give a region back.
    fn release_region(&self, region: Region);
}

/// Counters describing provider activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    /// Regions handed out since creation
    pub regions_allocated: u64,
    /// Regions returned since creation
    pub regions_released: u64,
    /// Allocation requests refused
    pub failures: u64,
    /// Bytes currently held by callers
    pub current_bytes: usize,
    /// High-water mark of `current_bytes`
    pub peak_bytes: usize,
}

/// Byte accounting with an optional hard limit.
#[derive(Debug)]
struct UsageTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    limit: Option<usize>,
}

impl UsageTracker {
    fn new(limit: Option<usize>) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
        }
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let old = self.current.fetch_add(bytes, Ordering::SeqCst);
        let new = old.saturating_add(bytes);

        if let Some(limit) = self.limit {
            if new > limit {
                self.current.fetch_sub(bytes, Ordering::SeqCst);
                return Err(Error::AllocationFailure(format!(
                    "provider limit exceeded: {} bytes requested with {} of {} in use",
                    bytes, old, limit
                )));
            }
        }

        let mut peak = self.peak.load(Ordering::Relaxed);
        while new > peak {
            match self
                .peak
                .compare_exchange_weak(peak, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
        Ok(())
    }

    fn unreserve(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Provider backed by the global heap allocator.
#[derive(Debug)]
pub struct HeapProvider {
    usage: UsageTracker,
    live: Mutex<HashMap<RegionHandle, Layout>>,
    next_handle: AtomicU64,
    allocated: AtomicU64,
    released: AtomicU64,
    failures: AtomicU64,
}

impl HeapProvider {
    /// An unbounded provider
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// A provider refusing to hold more than `limit` bytes at once
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            usage: UsageTracker::new(limit),
            live: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Snapshot of the activity counters
    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            regions_allocated: self.allocated.load(Ordering::Relaxed),
            regions_released: self.released.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            current_bytes: self.usage.current.load(Ordering::Relaxed),
            peak_bytes: self.usage.peak.load(Ordering::Relaxed),
        }
    }

    /// Number of regions currently handed out
    pub fn live_regions(&self) -> usize {
        self.live.lock().expect("provider mutex poisoned").len()
    }

    fn fail(&self, err: Error) -> Error {
        self.failures.fetch_add(1, Ordering::Relaxed);
        err
    }
}

impl Default for HeapProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider for HeapProvider {
    fn allocate_region(&self, size: usize) -> Result<Region> {
        if size == 0 {
            return Err(Error::InvalidRequest("region size must be non-zero".into()));
        }
        let layout = Layout::from_size_align(size, REGION_ALIGN).map_err(|e| {
            self.fail(Error::AllocationFailure(format!(
                "cannot lay out {} bytes: {}",
                size, e
            )))
        })?;
        self.usage.reserve(size).map_err(|e| self.fail(e))?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            self.usage.unreserve(size);
            return Err(self.fail(Error::AllocationFailure(format!(
                "heap exhausted allocating {} bytes",
                size
            ))));
        };

        let handle = RegionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.live
            .lock()
            .expect("provider mutex poisoned")
            .insert(handle, layout);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        debug!("allocated {} ({} bytes)", handle, size);

        // SAFETY: `base` is a fresh allocation of `size` bytes freed only
        // in `release_region`.
        Ok(unsafe { Region::from_raw_parts(handle, base, size) })
    }

    fn release_region(&self, region: Region) {
        let layout = self
            .live
            .lock()
            .expect("provider mutex poisoned")
            .remove(&region.handle);
        match layout {
            Some(layout) => {
                // SAFETY: the layout was recorded when this pointer was allocated
                // and the handle was live until now.
                unsafe { alloc::dealloc(region.base.as_ptr(), layout) };
                self.usage.unreserve(layout.size());
                self.released.fetch_add(1, Ordering::Relaxed);
                debug!("released {} ({} bytes)", region.handle, layout.size());
            }
            None => {
                error!("release of unknown {}", region.handle);
                debug_assert!(false, "release of unknown region");
            }
        }
    }
}

impl Drop for HeapProvider {
    fn drop(&mut self) {
        let live = self.live.get_mut().map(|live| live.len()).unwrap_or(0);
        if live > 0 {
            log::warn!("heap provider dropped with {} live regions", live);
        }
        // Regions still out are owned by someone who outlived us; leak
        // them rather than free memory that may still be referenced.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_track_usage() {
        let provider = HeapProvider::new();
        let region = provider.allocate_region(8192).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(region.base().as_ptr() as usize % REGION_ALIGN, 0);
        assert_eq!(provider.stats().current_bytes, 8192);
        assert_eq!(provider.live_regions(), 1);

        provider.release_region(region);
        let stats = provider.stats();
        assert_eq!(stats.current_bytes, 0);
        assert_eq!(stats.peak_bytes, 8192);
        assert_eq!(stats.regions_allocated, 1);
        assert_eq!(stats.regions_released, 1);
        assert_eq!(provider.live_regions(), 0);
    }

    #[test]
    fn regions_are_zeroed() {
        let provider = HeapProvider::new();
        let region = provider.allocate_region(256).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(region.base().as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        provider.release_region(region);
    }

    #[test]
    fn limit_refuses_without_side_effects() {
        let provider = HeapProvider::with_limit(Some(16 * 1024));
        let a = provider.allocate_region(12 * 1024).unwrap();
        let err = provider.allocate_region(8 * 1024).unwrap_err();
        assert!(err.is_allocation_failure());

        let stats = provider.stats();
        assert_eq!(stats.current_bytes, 12 * 1024);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.regions_allocated, 1);

        provider.release_region(a);
        let b = provider.allocate_region(16 * 1024).unwrap();
        provider.release_region(b);
    }

    #[test]
    fn zero_size_is_invalid() {
        let provider = HeapProvider::new();
        assert!(matches!(
            provider.allocate_region(0),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn handles_are_unique() {
        let provider = HeapProvider::new();
        let a = provider.allocate_region(64).unwrap();
        let b = provider.allocate_region(64).unwrap();
        assert_ne!(a.handle(), b.handle());
        provider.release_region(a);
        provider.release_region(b);
    }
}

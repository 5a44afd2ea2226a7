// this_file: src/bufpool.rs

//! Bitmap pool for reusing surfaces across render cycles.
//!
//! Renderers ask for a surface of a given size and format every frame.
//! Instead of allocating and freeing pixel storage each time, the pool
//! keeps released bitmaps around and hands the same storage back on the
//! next matching request.
//!
//! Every entry is either `Acquired` (someone holds a [`Bitmap`] handle) or
//! `Free` (idle, storage retained). Dropping the last handle of a pooled
//! bitmap moves its entry back to `Free`; idle entries beyond the
//! configured count or byte budget are evicted least-recently-released
//! first, and only then does their storage go back to the allocator.

use crate::allocator::BlockAllocator;
use crate::bitmap::{surface_layout, Bitmap, BitmapCore, PixelFormat};
use crate::config::PoolConfig;
use crate::error::Result;
use log::{debug, error, trace};
use lru::LruCache;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Identifier of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

/// Exact-match lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Lifecycle state of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Idle; storage retained for reuse
    Free,
    /// Handed out to a caller
    Acquired,
}

/// Diagnostic view of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub id: EntryId,
    pub key: SurfaceKey,
    pub state: EntryState,
    pub bytes: usize,
    pub last_used: u64,
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Entries registered (acquired + idle)
    pub entries: usize,
    /// Entries currently handed out
    pub acquired: usize,
    /// Entries idle in the pool
    pub idle: usize,
    /// Bytes held by idle entries
    pub idle_bytes: usize,
    /// Acquisitions served from an idle entry
    pub hits: u64,
    /// Acquisitions that needed a new allocation
    pub misses: u64,
    /// Idle entries discarded
    pub evictions: u64,
}

/// Route from a pooled bitmap back to its pool.
pub(crate) struct PoolLink {
    pool: Weak<PoolShared>,
    entry: EntryId,
}

impl PoolLink {
    /// Return the entry to its pool. A pool that is already gone leaves
    /// the bitmap to be destroyed.
    pub(crate) fn recycle(&self) {
        match self.pool.upgrade() {
            Some(pool) => pool.release_entry(self.entry),
            None => trace!("pool gone, entry {:?} will be destroyed", self.entry),
        }
    }
}

struct PoolEntry {
    core: Arc<BitmapCore>,
    key: SurfaceKey,
    state: EntryState,
    last_used: u64,
}

struct PoolState {
    limits: PoolConfig,
    entries: HashMap<EntryId, PoolEntry>,
    /// Free entries, least recently released first.
    idle: LruCache<EntryId, ()>,
    idle_by_key: HashMap<SurfaceKey, Vec<EntryId>>,
    idle_bytes: usize,
    next_entry: u64,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl PoolState {
    fn new(limits: PoolConfig) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
            idle: LruCache::unbounded(),
            idle_by_key: HashMap::new(),
            idle_bytes: 0,
            next_entry: 0,
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Most recently released Free entry for `key`, now Acquired.
    fn take_idle(&mut self, key: SurfaceKey) -> Option<Arc<BitmapCore>> {
        let ids = self.idle_by_key.get_mut(&key)?;
        let id = ids.pop()?;
        if ids.is_empty() {
            self.idle_by_key.remove(&key);
        }
        self.idle.pop(&id);

        let now = self.tick();
        let entry = self.entries.get_mut(&id)?;
        debug_assert_eq!(entry.state, EntryState::Free);
        entry.state = EntryState::Acquired;
        entry.last_used = now;
        self.idle_bytes -= entry.core.length();
        Some(Arc::clone(&entry.core))
    }

    /// Evict Free entries until both limits hold. The returned cores are
    /// dropped by the caller once the lock is released.
    fn evict_over(&mut self, max_entries: usize, max_bytes: usize) -> Vec<Arc<BitmapCore>> {
        let mut evicted = Vec::new();
        while self.idle.len() > max_entries || self.idle_bytes > max_bytes {
            let Some((id, ())) = self.idle.pop_lru() else {
                break;
            };
            let Some(entry) = self.entries.remove(&id) else {
                error!("idle list references missing pool entry {:?}", id);
                continue;
            };
            debug_assert_eq!(entry.state, EntryState::Free);
            if let Some(ids) = self.idle_by_key.get_mut(&entry.key) {
                ids.retain(|&other| other != id);
                if ids.is_empty() {
                    self.idle_by_key.remove(&entry.key);
                }
            }
            self.idle_bytes -= entry.core.length();
            self.evictions += 1;
            debug!(
                "evicted {}x{} {} surface ({} bytes)",
                entry.key.width,
                entry.key.height,
                entry.key.format,
                entry.core.length()
            );
            evicted.push(entry.core);
        }
        evicted
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            entries: self.entries.len(),
            acquired: self.entries.len() - self.idle.len(),
            idle: self.idle.len(),
            idle_bytes: self.idle_bytes,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

pub(crate) struct PoolShared {
    allocator: Arc<BlockAllocator>,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("buffer pool mutex poisoned")
    }

    /// Acquired -> Free, then enforce the idle limits.
    fn release_entry(&self, id: EntryId) {
        let evicted = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let now = state.tick();
            let Some(entry) = state.entries.get_mut(&id) else {
                error!("release of unknown pool entry {:?}", id);
                return;
            };
            if entry.state != EntryState::Acquired {
                error!("release of pool entry {:?} that is not acquired", id);
                debug_assert!(false, "pool entry released twice");
                return;
            }
            entry.state = EntryState::Free;
            entry.last_used = now;
            let key = entry.key;
            let bytes = entry.core.length();

            state.idle.push(id, ());
            state.idle_by_key.entry(key).or_default().push(id);
            state.idle_bytes += bytes;
            trace!("entry {:?} returned to pool", id);

            let limits = state.limits;
            state.evict_over(limits.max_idle_entries, limits.max_idle_bytes)
        };
        drop(evicted);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            let outstanding = state.entries.len() - state.idle.len();
            debug!(
                "buffer pool shutting down: {} idle surfaces freed, {} still in use",
                state.idle.len(),
                outstanding
            );
        }
    }
}

/// Cache of reusable bitmaps keyed by (width, height, format).
///
/// Cloning the pool yields another handle to the same cache.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool drawing storage from `allocator`.
    pub fn new(allocator: Arc<BlockAllocator>, limits: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                allocator,
                state: Mutex::new(PoolState::new(limits)),
            }),
        }
    }

    /// Allocator backing new surfaces
    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.shared.allocator
    }

    /// Get a surface of exactly this size and format.
    ///
    /// An idle match is reused without touching the allocator; otherwise
    /// a new surface is allocated and registered. Dropping the last clone
    /// of the returned bitmap gives it back to the pool.
    pub fn acquire(&self, width: u32, height: u32, format: PixelFormat) -> Result<Bitmap> {
        surface_layout(width, height, format)?;
        let key = SurfaceKey {
            width,
            height,
            format,
        };

        let id = {
            let mut state = self.shared.lock();
            let reused = state.take_idle(key);
            if let Some(core) = reused {
                state.hits += 1;
                drop(state);
                trace!("reusing {}x{} {} surface", width, height, format);
                return Ok(Bitmap::from_core(core));
            }
            state.misses += 1;
            let id = EntryId(state.next_entry);
            state.next_entry += 1;
            id
        };

        let link = PoolLink {
            pool: Arc::downgrade(&self.shared),
            entry: id,
        };
        let core = BitmapCore::pooled(&self.shared.allocator, width, height, format, link)?;
        let bitmap = Bitmap::from_core(Arc::clone(&core));

        let mut state = self.shared.lock();
        let now = state.tick();
        state.entries.insert(
            id,
            PoolEntry {
                core,
                key,
                state: EntryState::Acquired,
                last_used: now,
            },
        );
        debug!(
            "new pooled {}x{} {} surface ({} bytes)",
            width,
            height,
            format,
            bitmap.length()
        );
        Ok(bitmap)
    }

    /// Evict idle entries until at most `max_entries` and `max_bytes` remain.
    ///
    /// Returns the number of entries evicted.
    pub fn trim(&self, max_entries: usize, max_bytes: usize) -> usize {
        let evicted = self.shared.lock().evict_over(max_entries, max_bytes);
        evicted.len()
    }

    /// Evict every idle entry.
    pub fn purge(&self) -> usize {
        self.trim(0, 0)
    }

    /// Replace the idle limits and evict down to them.
    pub fn set_limits(&self, limits: PoolConfig) -> usize {
        let evicted = {
            let mut state = self.shared.lock();
            state.limits = limits;
            state.evict_over(limits.max_idle_entries, limits.max_idle_bytes)
        };
        evicted.len()
    }

    /// Current idle limits
    pub fn limits(&self) -> PoolConfig {
        self.shared.lock().limits
    }

    /// Current counters
    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats()
    }

    /// Snapshot of every entry, ordered by id
    pub fn entries(&self) -> Vec<EntryInfo> {
        let state = self.shared.lock();
        let mut infos: Vec<EntryInfo> = state
            .entries
            .iter()
            .map(|(&id, entry)| EntryInfo {
                id,
                key: entry.key,
                state: entry.state,
                bytes: entry.core.length(),
                last_used: entry.last_used,
            })
            .collect();
        drop(state);
        infos.sort_by_key(|info| info.id);
        infos
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("limits", &self.limits())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Origin;
    use crate::config::AllocatorConfig;
    use crate::provider::HeapProvider;
    use crate::refcount::ReleasePolicy;

    fn pool(limits: PoolConfig) -> (Arc<HeapProvider>, BufferPool) {
        let provider = Arc::new(HeapProvider::new());
        let alloc = BlockAllocator::new(provider.clone(), AllocatorConfig::default()).unwrap();
        (provider, BufferPool::new(alloc, limits))
    }

    fn limits(max_idle_entries: usize, max_idle_bytes: usize) -> PoolConfig {
        PoolConfig {
            max_idle_entries,
            max_idle_bytes,
        }
    }

    #[test]
    fn release_then_acquire_reuses_storage() {
        let (provider, pool) = pool(PoolConfig::default());
        let first = pool.acquire(800, 600, PixelFormat::Rgba32).unwrap();
        assert_eq!(first.origin(), Origin::Pool);
        assert_eq!(first.release_policy(), ReleasePolicy::ReturnToPool);
        let block = first.block().unwrap();
        let regions = provider.stats().regions_allocated;
        drop(first);

        let stats = pool.stats();
        assert_eq!((stats.idle, stats.acquired), (1, 0));
        assert_eq!(stats.idle_bytes, 800 * 600 * 4);

        let second = pool.acquire(800, 600, PixelFormat::Rgba32).unwrap();
        assert_eq!(second.block(), Some(block));
        assert_eq!(provider.stats().regions_allocated, regions);
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(pool.stats().misses, 1);
    }

    #[test]
    fn key_must_match_exactly() {
        let (_provider, pool) = pool(PoolConfig::default());
        drop(pool.acquire(64, 64, PixelFormat::Rgba32).unwrap());
        let other_format = pool.acquire(64, 64, PixelFormat::Rgb32).unwrap();
        let other_size = pool.acquire(64, 32, PixelFormat::Rgba32).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.idle, 1);
        drop((other_format, other_size));
    }

    #[test]
    fn clones_keep_entry_acquired() {
        let (_provider, pool) = pool(PoolConfig::default());
        let a = pool.acquire(32, 32, PixelFormat::Gray8).unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(pool.stats().acquired, 1);
        drop(b);
        assert_eq!(pool.stats().acquired, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn eviction_by_count_drops_least_recently_released() {
        let (_provider, pool) = pool(limits(2, usize::MAX));
        let a = pool.acquire(10, 10, PixelFormat::Gray8).unwrap();
        let b = pool.acquire(20, 20, PixelFormat::Gray8).unwrap();
        let c = pool.acquire(30, 30, PixelFormat::Gray8).unwrap();
        let used_before = pool.allocator().stats().used_blocks;
        drop(a);
        drop(b);
        drop(c);

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(pool.allocator().stats().used_blocks, used_before - 1);

        let keys: Vec<u32> = pool.entries().iter().map(|e| e.key.width).collect();
        assert_eq!(keys, vec![20, 30]);
    }

    #[test]
    fn eviction_by_bytes() {
        let (_provider, pool) = pool(limits(100, 3000));
        let a = pool.acquire(40, 40, PixelFormat::Gray8).unwrap(); // 1600 bytes
        let b = pool.acquire(40, 40, PixelFormat::Gray8).unwrap();
        drop(a);
        assert_eq!(pool.stats().evictions, 0);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.idle_bytes, 1600);
    }

    #[test]
    fn zero_limits_disable_caching() {
        let (provider, pool) = pool(limits(0, 0));
        drop(pool.acquire(16, 16, PixelFormat::Rgb32).unwrap());
        assert_eq!(pool.stats().entries, 0);
        assert_eq!(provider.live_regions(), 0);
    }

    #[test]
    fn purge_never_touches_acquired_entries() {
        let (_provider, pool) = pool(PoolConfig::default());
        let held = pool.acquire(16, 16, PixelFormat::Rgb32).unwrap();
        drop(pool.acquire(8, 8, PixelFormat::Rgb32).unwrap());
        assert_eq!(pool.purge(), 1);

        let entries = pool.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, EntryState::Acquired);
        unsafe { held.as_bytes_mut()[0] = 7 };
        assert_eq!(held.as_bytes()[0], 7);
    }

    #[test]
    fn set_limits_evicts_immediately() {
        let (_provider, pool) = pool(PoolConfig::default());
        for w in 1..=4 {
            drop(pool.acquire(w * 8, 8, PixelFormat::Gray8).unwrap());
        }
        assert_eq!(pool.stats().idle, 4);
        assert_eq!(pool.set_limits(limits(1, usize::MAX)), 3);
        assert_eq!(pool.limits().max_idle_entries, 1);
    }

    #[test]
    fn bitmaps_outliving_the_pool_are_destroyed() {
        let (provider, pool) = pool(PoolConfig::default());
        let bitmap = pool.acquire(64, 64, PixelFormat::Rgba32).unwrap();
        drop(pool.acquire(32, 32, PixelFormat::Rgba32).unwrap());
        drop(pool);

        assert_eq!(bitmap.width(), 64);
        drop(bitmap);
        assert_eq!(provider.live_regions(), 0);
    }

    #[test]
    fn invalid_requests_touch_nothing() {
        let (provider, pool) = pool(PoolConfig::default());
        assert!(pool.acquire(0, 10, PixelFormat::Rgba32).is_err());
        assert_eq!(pool.stats(), PoolStats::default());
        assert_eq!(provider.stats().regions_allocated, 0);
    }

    #[test]
    fn allocation_failure_leaves_pool_unchanged() {
        let provider = Arc::new(HeapProvider::with_limit(Some(64 * 1024)));
        let config = AllocatorConfig {
            default_chunk_size: 64 * 1024,
            page_size: 4096,
            panic_on_invariant_violation: false,
        };
        let alloc = BlockAllocator::new(provider, config).unwrap();
        let pool = BufferPool::new(alloc, PoolConfig::default());

        let _held = pool.acquire(64, 64, PixelFormat::Rgba32).unwrap();
        let err = pool.acquire(512, 512, PixelFormat::Rgba32).unwrap_err();
        assert!(err.is_allocation_failure());
        assert_eq!(pool.stats().entries, 1);
        pool.allocator().check_consistency().unwrap();
    }
}

// this_file: src/context.rs
//! Explicit wiring of provider, allocator and pool.
//!
//! Components that need surfaces receive a [`SurfaceContext`] (or one of
//! its parts) rather than reaching for process-wide state.

use crate::allocator::{AllocatorStats, BlockAllocator};
use crate::bitmap::{Bitmap, PixelFormat};
use crate::bufpool::{BufferPool, PoolStats};
use crate::config::Config;
use crate::error::Result;
use crate::provider::{HeapProvider, ProviderStats};
use log::info;
use serde::Serialize;
use std::sync::Arc;

/// Provider, allocator and pool built from one configuration.
#[derive(Debug, Clone)]
pub struct SurfaceContext {
    provider: Arc<HeapProvider>,
    allocator: Arc<BlockAllocator>,
    pool: BufferPool,
}

impl SurfaceContext {
    /// Build the stack described by `config`.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let provider = Arc::new(HeapProvider::with_limit(config.provider.limit_bytes));
        let allocator = BlockAllocator::new(provider.clone(), config.allocator.clone())?;
        let pool = BufferPool::new(Arc::clone(&allocator), config.pool);
        info!(
            "surface context ready: chunk {} bytes, pool {} entries / {} bytes",
            config.allocator.default_chunk_size,
            config.pool.max_idle_entries,
            config.pool.max_idle_bytes
        );
        Ok(Self {
            provider,
            allocator,
            pool,
        })
    }

    /// Memory provider
    pub fn provider(&self) -> &Arc<HeapProvider> {
        &self.provider
    }

    /// Block allocator
    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.allocator
    }

    /// Buffer pool
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Pooled surface; see [`BufferPool::acquire`].
    pub fn acquire(&self, width: u32, height: u32, format: PixelFormat) -> Result<Bitmap> {
        self.pool.acquire(width, height, format)
    }

    /// Allocator-owned surface outside the pool, freed on last release.
    pub fn allocate_bitmap(&self, width: u32, height: u32, format: PixelFormat) -> Result<Bitmap> {
        Bitmap::allocate(&self.allocator, width, height, format)
    }

    /// Snapshot of every layer's counters
    pub fn report(&self) -> MemoryReport {
        MemoryReport::new(self.provider.stats(), self.allocator.stats(), self.pool.stats())
    }
}

/// Combined counters, serializable for the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub provider: ProviderReport,
    pub allocator: AllocatorReport,
    pub pool: PoolReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderReport {
    pub regions_allocated: u64,
    pub regions_released: u64,
    pub failures: u64,
    pub current_bytes: usize,
    pub peak_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocatorReport {
    pub chunks: usize,
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub largest_free_block: usize,
    pub failed_allocations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub entries: usize,
    pub acquired: usize,
    pub idle: usize,
    pub idle_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl MemoryReport {
    fn new(provider: ProviderStats, allocator: AllocatorStats, pool: PoolStats) -> Self {
        Self {
            provider: ProviderReport {
                regions_allocated: provider.regions_allocated,
                regions_released: provider.regions_released,
                failures: provider.failures,
                current_bytes: provider.current_bytes,
                peak_bytes: provider.peak_bytes,
            },
            allocator: AllocatorReport {
                chunks: allocator.chunks,
                total_bytes: allocator.total_bytes,
                used_bytes: allocator.used_bytes,
                free_bytes: allocator.free_bytes,
                free_blocks: allocator.free_blocks,
                largest_free_block: allocator.largest_free_block,
                failed_allocations: allocator.failed_allocations,
            },
            pool: PoolReport {
                entries: pool.entries,
                acquired: pool.acquired,
                idle: pool.idle,
                idle_bytes: pool.idle_bytes,
                hits: pool.hits,
                misses: pool.misses,
                evictions: pool.evictions,
            },
        }
    }
}

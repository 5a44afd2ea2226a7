// this_file: src/allocator.rs
//! Best-fit block allocator over provider regions.
//!
//! Memory is obtained from a [`MemoryProvider`] in chunks of at least
//! `default_chunk_size` bytes and carved into blocks on demand:
//!
//! - allocation picks the smallest free block that fits (ties go to the
//!   lowest chunk id, then the lowest offset) and splits off the tail;
//! - freeing merges the block with free neighbours straight away, so two
//!   adjacent free blocks never coexist;
//! - a chunk that becomes entirely free goes back to the provider.
//!
//! All state sits behind one mutex. Callers refer to blocks through
//! [`BlockHandle`]s, never through raw pointers; [`BlockAllocator::resolve`]
//! turns a handle into an address that stays valid while the block is
//! allocated.

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::provider::{MemoryProvider, Region};
use log::{debug, error, trace, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifier of a chunk within one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// Reference to an allocated block: chunk id, offset and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    chunk: ChunkId,
    offset: usize,
    size: usize,
}

impl BlockHandle {
    /// Chunk holding the block
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// Byte offset of the block within its chunk
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the block in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}:{}", self.chunk, self.offset, self.size)
    }
}

/// A free block as reported by [`BlockAllocator::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub chunk: ChunkId,
    pub offset: usize,
    pub size: usize,
}

/// Snapshot of allocator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Chunks currently held
    pub chunks: usize,
    /// Bytes across all chunks
    pub total_bytes: usize,
    /// Bytes in used blocks
    pub used_bytes: usize,
    /// Bytes in free blocks
    pub free_bytes: usize,
    /// Number of used blocks
    pub used_blocks: usize,
    /// Number of free blocks
    pub free_blocks: usize,
    /// Size of the largest free block
    pub largest_free_block: usize,
    /// Regions requested from the provider since creation
    pub regions_requested: u64,
    /// Regions returned to the provider since creation
    pub regions_released: u64,
    /// Allocations refused because the provider was exhausted
    pub failed_allocations: u64,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: usize,
    used: bool,
}

struct Chunk {
    region: Region,
    /// Blocks keyed by offset; they tile the region exactly.
    blocks: BTreeMap<usize, Block>,
    used_blocks: usize,
}

impl Chunk {
    fn base(&self) -> NonNull<u8> {
        self.region.base()
    }
}

#[derive(Default)]
struct AllocatorState {
    chunks: BTreeMap<ChunkId, Chunk>,
    /// Free set ordered by (size, chunk, offset) for best-fit lookup.
    free_by_size: BTreeSet<(usize, ChunkId, usize)>,
    next_chunk: u64,
    regions_requested: u64,
    regions_released: u64,
    failed_allocations: u64,
}

impl AllocatorState {
    fn best_fit(&self, size: usize) -> Option<(usize, ChunkId, usize)> {
        self.free_by_size
            .range((size, ChunkId(0), 0)..)
            .next()
            .copied()
    }

    fn add_chunk(&mut self, region: Region) -> (usize, ChunkId, usize) {
        let id = ChunkId(self.next_chunk);
        self.next_chunk += 1;
        let len = region.len();

        let mut blocks = BTreeMap::new();
        blocks.insert(0, Block { size: len, used: false });
        self.chunks.insert(
            id,
            Chunk {
                region,
                blocks,
                used_blocks: 0,
            },
        );
        self.free_by_size.insert((len, id, 0));
        self.regions_requested += 1;
        debug!("added {} ({} bytes)", id, len);
        (len, id, 0)
    }

    /// Turn the free block `(block_size, chunk, offset)` into a used block
    /// of `size` bytes, leaving any remainder free.
    fn carve(&mut self, block_size: usize, chunk_id: ChunkId, offset: usize, size: usize) -> Result<BlockHandle> {
        let chunk = self.chunks.get_mut(&chunk_id).ok_or_else(|| {
            Error::InvariantViolation(format!("free set references missing {}", chunk_id))
        })?;
        let block = chunk.blocks.get_mut(&offset).ok_or_else(|| {
            Error::InvariantViolation(format!("free set references missing block {}+{}", chunk_id, offset))
        })?;
        if block.used || block.size != block_size {
            return Err(Error::InvariantViolation(format!(
                "free set entry {}+{}:{} disagrees with block map",
                chunk_id, offset, block_size
            )));
        }

        self.free_by_size.remove(&(block_size, chunk_id, offset));
        block.used = true;
        block.size = size;
        chunk.used_blocks += 1;

        let remainder = block_size - size;
        if remainder > 0 {
            let tail = offset + size;
            chunk.blocks.insert(tail, Block { size: remainder, used: false });
            self.free_by_size.insert((remainder, chunk_id, tail));
        }

        Ok(BlockHandle {
            chunk: chunk_id,
            offset,
            size,
        })
    }

    /// Mark a block free and coalesce it. Returns the chunk's region when
    /// the chunk became entirely free and was dropped from the bookkeeping.
    fn release(&mut self, handle: BlockHandle) -> Result<Option<Region>> {
        let chunk_id = handle.chunk;
        let chunk = self
            .chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| Error::InvariantViolation(format!("free of {}: unknown chunk", handle)))?;

        match chunk.blocks.get(&handle.offset) {
            None => {
                return Err(Error::InvariantViolation(format!(
                    "free of {}: no block at that offset",
                    handle
                )))
            }
            Some(block) if !block.used => {
                return Err(Error::InvariantViolation(format!(
                    "free of {}: block is already free",
                    handle
                )))
            }
            Some(block) if block.size != handle.size => {
                return Err(Error::InvariantViolation(format!(
                    "free of {}: block holds {} bytes",
                    handle, block.size
                )))
            }
            Some(_) => {}
        }

        let mut start = handle.offset;
        let mut size = handle.size;

        let predecessor = chunk
            .blocks
            .range(..handle.offset)
            .next_back()
            .map(|(&off, &block)| (off, block));
        if let Some((prev_off, prev)) = predecessor {
            if !prev.used && prev_off + prev.size == handle.offset {
                self.free_by_size.remove(&(prev.size, chunk_id, prev_off));
                chunk.blocks.remove(&handle.offset);
                start = prev_off;
                size += prev.size;
            }
        }

        let next_off = handle.offset + handle.size;
        if let Some(&next) = chunk.blocks.get(&next_off) {
            if !next.used {
                self.free_by_size.remove(&(next.size, chunk_id, next_off));
                chunk.blocks.remove(&next_off);
                size += next.size;
            }
        }

        chunk.blocks.insert(start, Block { size, used: false });
        chunk.used_blocks -= 1;
        trace!("freed {}, free run {}+{}:{}", handle, chunk_id, start, size);

        if start == 0 && size == chunk.region.len() {
            let chunk = self
                .chunks
                .remove(&chunk_id)
                .ok_or_else(|| Error::InvariantViolation(format!("{} vanished", chunk_id)))?;
            self.regions_released += 1;
            debug!("{} entirely free, returning {}", chunk_id, chunk.region.handle());
            return Ok(Some(chunk.region));
        }

        self.free_by_size.insert((size, chunk_id, start));
        Ok(None)
    }
}

/// Best-fit allocator carving provider regions into blocks.
pub struct BlockAllocator {
    provider: Arc<dyn MemoryProvider>,
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
}

impl BlockAllocator {
    /// Create an allocator drawing regions from `provider`.
    pub fn new(provider: Arc<dyn MemoryProvider>, config: AllocatorConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            provider,
            config,
            state: Mutex::new(AllocatorState::default()),
        }))
    }

    /// Active configuration
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().expect("allocator mutex poisoned")
    }

    /// Report a bookkeeping inconsistency; fatal when so configured.
    fn report(&self, err: Error) -> Error {
        if let Error::InvariantViolation(msg) = &err {
            error!("allocator invariant violated: {}", msg);
            if self.config.panic_on_invariant_violation {
                panic!("allocator invariant violated: {}", msg);
            }
        }
        err
    }

    fn chunk_size_for(&self, size: usize) -> Result<usize> {
        let page = self.config.page_size;
        size.max(self.config.default_chunk_size)
            .checked_add(page - 1)
            .map(|n| n & !(page - 1))
            .ok_or_else(|| Error::AllocationFailure(format!("{} bytes cannot be satisfied", size)))
    }

    /// Allocate a block of exactly `size` bytes.
    ///
    /// On failure nothing changes: the free set and chunk list are left as
    /// they were.
    pub fn allocate(&self, size: usize) -> Result<BlockHandle> {
        if size == 0 {
            return Err(Error::InvalidRequest("cannot allocate zero bytes".into()));
        }

        let mut state = self.lock();
        let (block_size, chunk, offset) = match state.best_fit(size) {
            Some(candidate) => candidate,
            None => {
                let chunk_size = match self.chunk_size_for(size) {
                    Ok(n) => n,
                    Err(e) => {
                        state.failed_allocations += 1;
                        return Err(e);
                    }
                };
                match self.provider.allocate_region(chunk_size) {
                    Ok(region) => state.add_chunk(region),
                    Err(e) => {
                        state.failed_allocations += 1;
                        warn!("provider refused {} bytes for a {} byte block: {}", chunk_size, size, e);
                        return Err(e);
                    }
                }
            }
        };

        let result = state.carve(block_size, chunk, offset, size);
        drop(state);
        match result {
            Ok(handle) => {
                trace!("allocated {}", handle);
                Ok(handle)
            }
            Err(e) => Err(self.report(e)),
        }
    }

    /// Free a block, coalescing it with free neighbours.
    ///
    /// A chunk left entirely free is returned to the provider.
    pub fn free(&self, handle: BlockHandle) -> Result<()> {
        let mut state = self.lock();
        let result = state.release(handle);
        drop(state);
        match result {
            Ok(Some(region)) => {
                self.provider.release_region(region);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(self.report(e)),
        }
    }

    /// Address of the first byte of an allocated block.
    ///
    /// The address is stable until the block is freed.
    pub fn resolve(&self, handle: BlockHandle) -> Result<NonNull<u8>> {
        let state = self.lock();
        let found = state.chunks.get(&handle.chunk).and_then(|chunk| {
            chunk
                .blocks
                .get(&handle.offset)
                .filter(|b| b.used && b.size == handle.size)
                .map(|_| chunk.base())
        });
        drop(state);
        match found {
            // SAFETY: the block lies inside the region, so the offset stays
            // within the same allocation.
            Some(base) => Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(handle.offset)) }),
            None => Err(self.report(Error::InvariantViolation(format!(
                "resolve of {}: not an allocated block",
                handle
            )))),
        }
    }

    /// Snapshot of the free set ordered by chunk and offset
    pub fn free_blocks(&self) -> Vec<FreeBlock> {
        let state = self.lock();
        state
            .chunks
            .iter()
            .flat_map(|(&chunk, c)| {
                c.blocks
                    .iter()
                    .filter(|(_, b)| !b.used)
                    .map(move |(&offset, b)| FreeBlock {
                        chunk,
                        offset,
                        size: b.size,
                    })
            })
            .collect()
    }

    /// Current statistics
    pub fn stats(&self) -> AllocatorStats {
        let state = self.lock();
        let mut stats = AllocatorStats {
            chunks: state.chunks.len(),
            regions_requested: state.regions_requested,
            regions_released: state.regions_released,
            failed_allocations: state.failed_allocations,
            ..AllocatorStats::default()
        };
        for chunk in state.chunks.values() {
            stats.total_bytes += chunk.region.len();
            for block in chunk.blocks.values() {
                if block.used {
                    stats.used_bytes += block.size;
                    stats.used_blocks += 1;
                } else {
                    stats.free_bytes += block.size;
                    stats.free_blocks += 1;
                    stats.largest_free_block = stats.largest_free_block.max(block.size);
                }
            }
        }
        stats
    }

    /// Verify every bookkeeping invariant. Never panics.
    pub fn check_consistency(&self) -> Result<()> {
        let state = self.lock();
        let mut free_seen = 0;

        for (&id, chunk) in &state.chunks {
            let mut expected = 0;
            let mut prev_free = false;
            let mut used = 0;
            for (&offset, block) in &chunk.blocks {
                if offset != expected {
                    return Err(Error::InvariantViolation(format!(
                        "{}: block at {} but previous block ended at {}",
                        id, offset, expected
                    )));
                }
                if block.size == 0 {
                    return Err(Error::InvariantViolation(format!("{}: empty block at {}", id, offset)));
                }
                if block.used {
                    used += 1;
                    prev_free = false;
                } else {
                    if prev_free {
                        return Err(Error::InvariantViolation(format!(
                            "{}: adjacent free blocks at {}",
                            id, offset
                        )));
                    }
                    if !state.free_by_size.contains(&(block.size, id, offset)) {
                        return Err(Error::InvariantViolation(format!(
                            "{}: free block {}:{} missing from free set",
                            id, offset, block.size
                        )));
                    }
                    free_seen += 1;
                    prev_free = true;
                }
                expected = offset + block.size;
            }
            if expected != chunk.region.len() {
                return Err(Error::InvariantViolation(format!(
                    "{}: blocks cover {} of {} bytes",
                    id,
                    expected,
                    chunk.region.len()
                )));
            }
            if used != chunk.used_blocks {
                return Err(Error::InvariantViolation(format!(
                    "{}: {} used blocks recorded, {} present",
                    id, chunk.used_blocks, used
                )));
            }
            if used == 0 {
                return Err(Error::InvariantViolation(format!("{} is entirely free but retained", id)));
            }
        }

        if free_seen != state.free_by_size.len() {
            return Err(Error::InvariantViolation(format!(
                "free set holds {} entries, chunks hold {} free blocks",
                state.free_by_size.len(),
                free_seen
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => std::mem::take(state),
            Err(_) => return,
        };
        for (id, chunk) in state.chunks {
            if chunk.used_blocks > 0 {
                warn!("{} released with {} used blocks", id, chunk.used_blocks);
            }
            self.provider.release_region(chunk.region);
        }
    }
}

// this_file: src/lib.rs
//! surfpool - surface memory management for display servers
//!
//! This library provides:
//! - An area-backed best-fit block allocator with splitting and coalescing
//! - Reference-counted pixel surfaces (bitmaps) over allocator blocks
//! - A buffer pool recycling surfaces across render cycles
//! - A synthetic render loop for measuring pool effectiveness

pub mod allocator;
pub mod bitmap;
pub mod bufpool;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod provider;
pub mod refcount;
pub mod simulate;

// Re-export commonly used types
pub use allocator::{BlockAllocator, BlockHandle, ChunkId};
pub use bitmap::{Bitmap, Origin, PixelFormat};
pub use bufpool::{BufferPool, EntryState, PoolStats};
pub use config::{AllocatorConfig, Config, PoolConfig};
pub use context::{MemoryReport, SurfaceContext};
pub use error::{Error, Result};
pub use provider::{HeapProvider, MemoryProvider, Region, RegionHandle};
pub use refcount::{Lifecycle, RefCount, ReleasePolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

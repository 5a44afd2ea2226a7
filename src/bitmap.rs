// this_file: src/bitmap.rs
//! Reference-counted pixel surfaces.
//!
//! A [`Bitmap`] is a counted handle: cloning it acquires a reference,
//! dropping it releases one. What happens when the last reference goes
//! depends on where the surface came from:
//!
//! - standalone bitmaps free their heap buffer,
//! - allocator-owned bitmaps give their block back to the allocator,
//! - pool-owned bitmaps go back to their pool with storage intact.

use crate::allocator::{BlockAllocator, BlockHandle};
use crate::bufpool::PoolLink;
use crate::error::{Error, Result};
use crate::refcount::{Lifecycle, RefCount, ReleasePolicy};
use log::{error, trace};
use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::Arc;

/// Largest accepted width or height.
pub const MAX_DIMENSION: u32 = 32_768;

/// Pixel layouts supported for surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit, unused alpha byte
    Rgb32,
    /// 32-bit with alpha
    Rgba32,
    /// Packed 24-bit
    Rgb24,
    /// 5-6-5
    Rgb16,
    /// 5-5-5, top bit unused
    Rgb15,
    /// 5-5-5-1
    Rgba15,
    /// 8-bit palette index
    Cmap8,
    /// 8-bit grayscale
    Gray8,
    /// 1-bit monochrome
    Gray1,
}

impl PixelFormat {
    /// Every supported format
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Rgb32,
        PixelFormat::Rgba32,
        PixelFormat::Rgb24,
        PixelFormat::Rgb16,
        PixelFormat::Rgb15,
        PixelFormat::Rgba15,
        PixelFormat::Cmap8,
        PixelFormat::Gray8,
        PixelFormat::Gray1,
    ];

    /// Bits used by one pixel
    pub fn bits_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb32 | PixelFormat::Rgba32 => 32,
            PixelFormat::Rgb24 => 24,
            PixelFormat::Rgb16 | PixelFormat::Rgb15 | PixelFormat::Rgba15 => 16,
            PixelFormat::Cmap8 | PixelFormat::Gray8 => 8,
            PixelFormat::Gray1 => 1,
        }
    }

    /// Row stride for `width` pixels, padded to a 4-byte boundary.
    ///
    /// Returns `None` when the row size overflows.
    pub fn bytes_per_row(self, width: u32) -> Option<usize> {
        let bits = (width as usize).checked_mul(self.bits_per_pixel())?;
        // Whole 32-bit words per row.
        let words = bits.checked_add(31)? / 32;
        words.checked_mul(4)
    }

    /// Lowercase name, as accepted by `from_str`
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgb32 => "rgb32",
            PixelFormat::Rgba32 => "rgba32",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Rgb16 => "rgb16",
            PixelFormat::Rgb15 => "rgb15",
            PixelFormat::Rgba15 => "rgba15",
            PixelFormat::Cmap8 => "cmap8",
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Gray1 => "gray1",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.name() == lower)
            .ok_or_else(|| Error::InvalidRequest(format!("unsupported pixel format '{}'", s)))
    }
}

/// Validate dimensions and return `(stride, length)` in bytes.
pub fn surface_layout(width: u32, height: u32, format: PixelFormat) -> Result<(usize, usize)> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidRequest(format!(
            "surface dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(Error::InvalidRequest(format!(
            "surface {}x{} exceeds the {} pixel limit",
            width, height, MAX_DIMENSION
        )));
    }
    let stride = format
        .bytes_per_row(width)
        .ok_or_else(|| Error::InvalidRequest(format!("row of {} {} pixels overflows", width, format)))?;
    let length = stride
        .checked_mul(height as usize)
        .ok_or_else(|| Error::InvalidRequest(format!("{}x{} {} surface overflows", width, height, format)))?;
    Ok((stride, length))
}

/// Who owns a bitmap's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Heap buffer owned by the bitmap alone
    Standalone,
    /// Block owned by the bitmap, freed with it
    Allocator,
    /// Block owned by a buffer pool, recycled on release
    Pool,
}

enum Storage {
    Heap {
        ptr: NonNull<u8>,
        len: usize,
    },
    Block {
        allocator: Arc<BlockAllocator>,
        handle: BlockHandle,
        ptr: NonNull<u8>,
    },
}

// SAFETY: storage is owned memory; concurrent pixel access is governed by
// the `as_bytes_mut` contract.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn heap(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Storage::Heap { ptr, len }
    }

    fn block(allocator: &Arc<BlockAllocator>, len: usize) -> Result<Self> {
        let handle = allocator.allocate(len)?;
        match allocator.resolve(handle) {
            Ok(ptr) => Ok(Storage::Block {
                allocator: Arc::clone(allocator),
                handle,
                ptr,
            }),
            Err(e) => {
                let _ = allocator.free(handle);
                Err(e)
            }
        }
    }

    fn ptr(&self) -> NonNull<u8> {
        match self {
            Storage::Heap { ptr, .. } | Storage::Block { ptr, .. } => *ptr,
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        match self {
            Storage::Heap { ptr, len } => {
                // SAFETY: produced by `Box::leak` of a `[u8]` of this length.
                let slice = std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), *len);
                drop(unsafe { Box::from_raw(slice) });
            }
            Storage::Block { allocator, handle, .. } => {
                if let Err(e) = allocator.free(*handle) {
                    error!("failed to free bitmap storage {}: {}", handle, e);
                }
            }
        }
    }
}

/// Shared state behind every handle of one bitmap.
pub(crate) struct BitmapCore {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    length: usize,
    origin: Origin,
    storage: Storage,
    refs: RefCount,
    /// Set for pool-owned bitmaps; selects `ReleasePolicy::ReturnToPool`.
    pool: Option<PoolLink>,
}

impl BitmapCore {
    fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        origin: Origin,
        allocator: Option<&Arc<BlockAllocator>>,
        pool: Option<PoolLink>,
    ) -> Result<Self> {
        let (stride, length) = surface_layout(width, height, format)?;
        let storage = match allocator {
            Some(allocator) => Storage::block(allocator, length)?,
            None => Storage::heap(length),
        };
        Ok(Self {
            width,
            height,
            format,
            stride,
            length,
            origin,
            storage,
            refs: RefCount::new(),
            pool,
        })
    }

    /// Core for a pool entry; storage comes from the pool's allocator.
    pub(crate) fn pooled(
        allocator: &Arc<BlockAllocator>,
        width: u32,
        height: u32,
        format: PixelFormat,
        link: PoolLink,
    ) -> Result<Arc<Self>> {
        Self::new(width, height, format, Origin::Pool, Some(allocator), Some(link)).map(Arc::new)
    }

    pub(crate) fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.refs.count()
    }

    fn policy(&self) -> ReleasePolicy {
        if self.pool.is_some() {
            ReleasePolicy::ReturnToPool
        } else {
            ReleasePolicy::DestroyOnZero
        }
    }
}

impl Lifecycle for BitmapCore {
    fn on_first_reference(&self) {
        trace!("{}x{} {} bitmap in use", self.width, self.height, self.format);
    }

    fn on_last_release(&self) {
        match &self.pool {
            Some(link) => link.recycle(),
            None => trace!("{}x{} {} bitmap destroyed", self.width, self.height, self.format),
        }
    }
}

/// Counted handle to a pixel surface.
pub struct Bitmap {
    core: Arc<BitmapCore>,
}

impl Bitmap {
    /// Heap-backed bitmap, independent of any allocator.
    pub fn standalone(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let core = BitmapCore::new(width, height, format, Origin::Standalone, None, None)?;
        Ok(Self::from_core(Arc::new(core)))
    }

    /// Bitmap whose storage is a block of `allocator`, freed on last release.
    pub fn allocate(
        allocator: &Arc<BlockAllocator>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self> {
        let core = BitmapCore::new(width, height, format, Origin::Allocator, Some(allocator), None)?;
        Ok(Self::from_core(Arc::new(core)))
    }

    /// Take a new counted reference on `core`.
    pub(crate) fn from_core(core: Arc<BitmapCore>) -> Self {
        core.refs.acquire(&*core);
        Self { core }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.core.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.core.height
    }

    /// Pixel layout
    pub fn format(&self) -> PixelFormat {
        self.core.format
    }

    /// Bytes per row
    pub fn bytes_per_row(&self) -> usize {
        self.core.stride
    }

    /// Storage size in bytes (`bytes_per_row * height`)
    pub fn length(&self) -> usize {
        self.core.length
    }

    /// Start of the pixel data. Valid only while this handle lives.
    pub fn bits(&self) -> *mut u8 {
        self.core.storage.ptr().as_ptr()
    }

    /// Read-only view of the pixel data
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: storage spans `length` bytes and outlives `self`.
        unsafe { std::slice::from_raw_parts(self.bits(), self.length()) }
    }

    /// Mutable view of the pixel data.
    ///
    /// # Safety
    ///
    /// No other view of this bitmap's pixels, through this or any other
    /// handle, may be alive while the returned slice is used.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.bits(), self.length())
    }

    /// True when storage exists and the dimensions are positive
    pub fn is_valid(&self) -> bool {
        self.core.width > 0 && self.core.height > 0 && self.core.length > 0
    }

    /// Where the storage came from
    pub fn origin(&self) -> Origin {
        self.core.origin
    }

    /// What happens when the last handle drops
    pub fn release_policy(&self) -> ReleasePolicy {
        self.core.policy()
    }

    /// Allocator block backing this bitmap, if area-backed
    pub fn block(&self) -> Option<BlockHandle> {
        match &self.core.storage {
            Storage::Block { handle, .. } => Some(*handle),
            Storage::Heap { .. } => None,
        }
    }

    /// Live handles. Diagnostics only.
    pub fn ref_count(&self) -> usize {
        self.core.ref_count()
    }

    /// True when both handles refer to the same surface
    pub fn ptr_eq(&self, other: &Bitmap) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Clone for Bitmap {
    fn clone(&self) -> Self {
        Self::from_core(Arc::clone(&self.core))
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        self.core.refs.release(&*self.core);
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.core.width)
            .field("height", &self.core.height)
            .field("format", &self.core.format)
            .field("bytes_per_row", &self.core.stride)
            .field("origin", &self.core.origin)
            .field("block", &self.block())
            .field("refs", &self.core.refs.count())
            .finish()
    }
}

//! Coherent DMA memory for bare-metal device drivers.
//!
//! Drivers that share memory with a bus-mastering device need two things:
//! a region that both the CPU and the device can see without cache
//! maintenance, and the *bus address* the device must be programmed with.
//! This crate provides:
//!
//! - [`DmaRegion`]: one coherent allocation (CPU pointer + bus address + size)
//! - [`CoherentAllocator`]: the seam a driver allocates through
//! - [`RegionPool`]: a page-granular allocator carving regions out of a
//!   caller-supplied memory window
//!
//! # Usage
//!
//! ```ignore
//! use dma_pool::{CoherentAllocator, RegionPool};
//!
//! // Identity-mapped window handed over by firmware.
//! let pool = unsafe { RegionPool::new(base as *mut u8, base as u64, size)? };
//!
//! let region = pool.alloc_coherent(2048 * 16)?;
//! // ... program region.bus_base() into the device ...
//! unsafe { pool.free_coherent(region) };
//! ```

#![no_std]

use core::fmt;
use core::ptr::NonNull;

use spin::Mutex;

/// Page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Maximum allocation tracking entries per pool.
pub const MAX_ALLOCATIONS: usize = 128;

// ============================================================================
// Utility functions
// ============================================================================

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Convert pages to bytes.
#[inline]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

/// Convert bytes to pages (rounded up).
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}

// ============================================================================
// Error types
// ============================================================================

/// DMA memory errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Pool has no backing memory.
    NotInitialized,
    /// Requested 0 bytes.
    ZeroPages,
    /// Not enough memory in pool.
    OutOfMemory,
    /// Backing window is unusable (null, unaligned or too small).
    InvalidRegion,
    /// Region being freed was not handed out by this pool.
    UnknownAllocation,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "DMA pool not initialized"),
            Self::ZeroPages => write!(f, "zero-sized DMA allocation"),
            Self::OutOfMemory => write!(f, "out of coherent DMA memory"),
            Self::InvalidRegion => write!(f, "invalid DMA memory region"),
            Self::UnknownAllocation => write!(f, "region not owned by this pool"),
        }
    }
}

/// Result type for DMA operations.
pub type Result<T> = core::result::Result<T, DmaError>;

// ============================================================================
// Memory regions
// ============================================================================

/// A raw memory window suitable for carving DMA allocations from.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Base address (CPU view).
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Get the page-aligned part of this region.
    pub fn aligned(&self) -> Self {
        let aligned_base = align_up(self.base, PAGE_SIZE);
        let adjustment = aligned_base - self.base;
        let aligned_size = align_down(self.size.saturating_sub(adjustment), PAGE_SIZE);
        Self {
            base: aligned_base,
            size: aligned_size,
        }
    }
}

/// One coherent DMA allocation.
///
/// Carries both the CPU-accessible pointer and the device-visible bus
/// address. The allocation is not freed on drop; it must be handed back to
/// the [`CoherentAllocator`] that produced it once the device can no
/// longer touch it.
pub struct DmaRegion {
    cpu_ptr: NonNull<u8>,
    bus_addr: u64,
    size: usize,
}

impl DmaRegion {
    /// Create a new DMA region.
    ///
    /// # Safety
    /// - `cpu_ptr` must point to `size` bytes of valid DMA-capable memory
    /// - `bus_addr` must be the corresponding device-visible address
    pub const unsafe fn new(cpu_ptr: NonNull<u8>, bus_addr: u64, size: usize) -> Self {
        Self { cpu_ptr, bus_addr, size }
    }

    /// CPU base pointer.
    #[inline]
    pub const fn cpu_base(&self) -> *mut u8 {
        self.cpu_ptr.as_ptr()
    }

    /// Bus base address (what devices see).
    #[inline]
    pub const fn bus_base(&self) -> u64 {
        self.bus_addr
    }

    /// Total size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Get bus address at offset.
    #[inline]
    pub const fn bus_at(&self, offset: usize) -> u64 {
        self.bus_addr + offset as u64
    }

    /// Zero the whole region.
    pub fn zero(&mut self) {
        // SAFETY: the region invariant covers `size` bytes from `cpu_ptr`.
        unsafe { core::ptr::write_bytes(self.cpu_ptr.as_ptr(), 0, self.size) }
    }
}

// SAFETY: the region is plain memory; access discipline is up to the owner.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu_ptr", &self.cpu_ptr)
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

/// Source of coherent, device-addressable memory.
///
/// Implemented by the platform (or by [`RegionPool`]). Returned regions
/// are zero-initialized.
pub trait CoherentAllocator: Send + Sync {
    /// Allocate at least `size` bytes of zeroed coherent memory.
    fn alloc_coherent(&self, size: usize) -> Result<DmaRegion>;

    /// Return a region to the allocator.
    ///
    /// # Safety
    /// `region` must come from this allocator, and the device must not
    /// access it any more.
    unsafe fn free_coherent(&self, region: DmaRegion);
}

// ============================================================================
// Allocation tracking
// ============================================================================

#[derive(Clone, Copy)]
struct Allocation {
    offset: usize,
    pages: usize,
    in_use: bool,
}

impl Allocation {
    const fn empty() -> Self {
        Self { offset: 0, pages: 0, in_use: false }
    }
}

struct PoolState {
    /// Bump offset for fresh pages.
    offset: usize,
    /// Tracked allocations, freed slots are reused first-fit.
    allocations: [Allocation; MAX_ALLOCATIONS],
    /// Number of tracked slots ever used.
    alloc_count: usize,
}

// ============================================================================
// RegionPool
// ============================================================================

/// Page allocator over one identity- or offset-mapped memory window.
///
/// Freed allocations are recycled first-fit (without splitting). When
/// everything has been freed the bump offset rewinds to the start.
pub struct RegionPool {
    cpu_base: usize,
    bus_base: u64,
    size: usize,
    state: Mutex<PoolState>,
}

impl RegionPool {
    /// Create a pool over `[cpu_base, cpu_base + size)`.
    ///
    /// The usable part is trimmed to whole pages.
    ///
    /// # Safety
    /// - The window must be valid, writable memory not used by anything else
    ///   for the lifetime of the pool.
    /// - `bus_base` must be the device-visible address of `cpu_base`.
    pub unsafe fn new(cpu_base: *mut u8, bus_base: u64, size: usize) -> Result<Self> {
        let region = MemoryRegion::new(cpu_base as usize, size);
        let aligned = region.aligned();
        if cpu_base.is_null() || aligned.size == 0 {
            return Err(DmaError::InvalidRegion);
        }
        let bus_base = bus_base + (aligned.base - region.base) as u64;

        Ok(Self {
            cpu_base: aligned.base,
            bus_base,
            size: aligned.size,
            state: Mutex::new(PoolState {
                offset: 0,
                allocations: [Allocation::empty(); MAX_ALLOCATIONS],
                alloc_count: 0,
            }),
        })
    }

    /// Allocate contiguous zeroed pages.
    pub fn alloc_pages(&self, pages: usize) -> Result<DmaRegion> {
        if self.size == 0 {
            return Err(DmaError::NotInitialized);
        }
        if pages == 0 {
            return Err(DmaError::ZeroPages);
        }

        let offset = {
            let mut state = self.state.lock();
            Self::reserve(&mut state, pages, self.size)?
        };

        let size = pages_to_bytes(pages);
        let cpu_ptr =
            NonNull::new((self.cpu_base + offset) as *mut u8).ok_or(DmaError::OutOfMemory)?;

        // SAFETY: `offset..offset + size` lies inside the window we own.
        let mut region = unsafe { DmaRegion::new(cpu_ptr, self.bus_base + offset as u64, size) };
        region.zero();
        Ok(region)
    }

    fn reserve(state: &mut PoolState, pages: usize, pool_size: usize) -> Result<usize> {
        let count = state.alloc_count;

        // Recycle a freed block first.
        if let Some(slot) = state.allocations[..count]
            .iter_mut()
            .find(|a| !a.in_use && a.pages >= pages)
        {
            slot.in_use = true;
            return Ok(slot.offset);
        }

        let aligned_offset = align_up(state.offset, PAGE_SIZE);
        let new_offset = aligned_offset + pages_to_bytes(pages);
        if new_offset > pool_size {
            return Err(DmaError::OutOfMemory);
        }

        if count == MAX_ALLOCATIONS {
            return Err(DmaError::OutOfMemory);
        }
        let slot = count;
        state.alloc_count += 1;

        state.allocations[slot] = Allocation {
            offset: aligned_offset,
            pages,
            in_use: true,
        };
        state.offset = new_offset;
        Ok(aligned_offset)
    }

    /// Return a region handed out by [`alloc_pages`](Self::alloc_pages).
    pub fn dealloc(&self, region: &DmaRegion) -> Result<()> {
        let offset = (region.cpu_base() as usize).wrapping_sub(self.cpu_base);
        let mut state = self.state.lock();
        let count = state.alloc_count;

        let alloc = state.allocations[..count]
            .iter_mut()
            .find(|a| a.in_use && a.offset == offset)
            .ok_or(DmaError::UnknownAllocation)?;
        alloc.in_use = false;

        if state.allocations[..count].iter().all(|a| !a.in_use) {
            state.offset = 0;
            state.alloc_count = 0;
            for alloc in state.allocations.iter_mut() {
                *alloc = Allocation::empty();
            }
        }
        Ok(())
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        let state = self.state.lock();
        state.allocations[..state.alloc_count].iter().filter(|a| a.in_use).count()
    }

    /// Bytes never yet handed out by the bump allocator.
    pub fn free_space(&self) -> usize {
        self.size.saturating_sub(self.state.lock().offset)
    }

    /// Total pool size in bytes.
    pub fn total_size(&self) -> usize {
        self.size
    }

    /// Bus address of the first pool byte.
    pub fn bus_base(&self) -> u64 {
        self.bus_base
    }
}

impl CoherentAllocator for RegionPool {
    fn alloc_coherent(&self, size: usize) -> Result<DmaRegion> {
        self.alloc_pages(bytes_to_pages(size))
    }

    unsafe fn free_coherent(&self, region: DmaRegion) {
        let freed = self.dealloc(&region);
        debug_assert!(freed.is_ok(), "free_coherent of foreign region {:?}", region);
    }
}

// ============================================================================
// Tests
// ============================================================================

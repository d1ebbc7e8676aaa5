//! Register window access.
//!
//! [`RegisterWindow`] is the only way the driver touches the device. The
//! mapping behind it belongs to the device context and lives exactly as
//! long as the context does, so a window can never be used after unmap.
//!
//! # Ordering
//! Writes are preceded by a release fence so that descriptor memory
//! written before a doorbell is visible to the device first. Reads are
//! followed by an acquire fence so later memory reads are not hoisted
//! above them.

use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};

/// Typed access to a device register window.
///
/// Implementations must perform every access directly and in program
/// order. `&self` is used because MMIO has interior mutability by nature.
pub trait RegisterWindow: Send + Sync {
    /// Read a 16-bit register.
    fn read16(&self, offset: usize) -> u16;

    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Write a 16-bit register.
    fn write16(&self, offset: usize, value: u16);

    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);

    /// Write a 64-bit register as two 32-bit halves, low word first.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// Memory-mapped BAR.
pub struct Mmio {
    base: NonNull<u8>,
    len: usize,
}

impl Mmio {
    /// Wrap a mapped BAR.
    ///
    /// # Safety
    /// - `base` must be a valid MMIO mapping of at least `len` bytes
    /// - The mapping must stay valid until this value is dropped
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Mapping length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn reg<T>(&self, offset: usize) -> *mut T {
        debug_assert!(
            offset + core::mem::size_of::<T>() <= self.len,
            "register {:#x} outside BAR",
            offset
        );
        debug_assert!(offset % core::mem::align_of::<T>() == 0, "unaligned register {:#x}", offset);
        // SAFETY: bounds checked above in debug builds, offsets are compile-time constants.
        unsafe { self.base.as_ptr().add(offset) as *mut T }
    }
}

impl RegisterWindow for Mmio {
    fn read16(&self, offset: usize) -> u16 {
        // SAFETY: see `Mmio::new`.
        let value = unsafe { core::ptr::read_volatile(self.reg::<u16>(offset)) };
        fence(Ordering::Acquire);
        u16::from_le(value)
    }

    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: see `Mmio::new`.
        let value = unsafe { core::ptr::read_volatile(self.reg::<u32>(offset)) };
        fence(Ordering::Acquire);
        u32::from_le(value)
    }

    fn write16(&self, offset: usize, value: u16) {
        fence(Ordering::Release);
        // SAFETY: see `Mmio::new`.
        unsafe { core::ptr::write_volatile(self.reg::<u16>(offset), value.to_le()) }
    }

    fn write32(&self, offset: usize, value: u32) {
        fence(Ordering::Release);
        // SAFETY: see `Mmio::new`.
        unsafe { core::ptr::write_volatile(self.reg::<u32>(offset), value.to_le()) }
    }
}

// SAFETY: Mmio is only a pointer into device space; all accesses are volatile.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

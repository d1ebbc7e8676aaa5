//! Descriptor ring.
//!
//! A coherent array of [`HwDescriptor`] slots shared with the engine, plus
//! a same-length software array holding the [`PendingJob`] for every slot
//! hardware currently owns.
//!
//! # Indices
//! `head` and `tail` are free-running counters; the slot index is the
//! counter masked by `capacity - 1`. Submission advances `tail`, completion
//! advances `head`, and `tail - head` is the number of outstanding slots.
//!
//! ```text
//!          head                 tail
//!           v                    v
//!   [ done | hw | hw | hw | hw | free | free | done ]
//! ```
//!
//! # Ownership
//! A slot belongs to hardware from the moment its VALID bit is written until
//! the engine clears it during write-back. The ring itself does no locking;
//! the channel serializes both paths.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, Ordering};

use dma_pool::{CoherentAllocator, DmaError, DmaRegion};

use crate::desc::{self, HwDescriptor, DESC_SIZE, FLAG_VALID, SIZE_MASK};
use crate::error::RingError;
use crate::job::{PendingJob, TransferStatus};

/// Descriptor ring plus shadow job array.
pub struct DescriptorRing {
    region: Option<DmaRegion>,
    allocator: Arc<dyn CoherentAllocator>,
    jobs: Vec<Option<PendingJob>>,
    capacity: u32,
    head: u32,
    tail: u32,
}

/// A release refused because hardware still owns slots.
pub struct ReleaseRejected {
    ring: DescriptorRing,
}

impl ReleaseRejected {
    /// Number of slots that were outstanding.
    pub fn outstanding(&self) -> u32 {
        self.ring.outstanding()
    }

    pub fn error(&self) -> RingError {
        RingError::Busy {
            outstanding: self.outstanding(),
        }
    }

    /// Take the ring back.
    pub fn into_ring(self) -> DescriptorRing {
        self.ring
    }
}

impl fmt::Debug for ReleaseRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseRejected")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl DescriptorRing {
    /// Allocate a zeroed ring of `capacity` descriptors.
    ///
    /// Either both the coherent buffer and the shadow array exist
    /// afterwards, or neither does.
    pub fn allocate(
        capacity: u32,
        allocator: Arc<dyn CoherentAllocator>,
    ) -> Result<Self, RingError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(capacity));
        }

        let mut region = allocator.alloc_coherent(capacity as usize * DESC_SIZE)?;
        region.zero();

        let mut jobs = Vec::new();
        if jobs.try_reserve_exact(capacity as usize).is_err() {
            // SAFETY: the ring was never programmed into hardware.
            unsafe { allocator.free_coherent(region) };
            return Err(RingError::Allocation(DmaError::OutOfMemory));
        }
        jobs.resize_with(capacity as usize, || None);

        log::debug!(
            "plx-dma: ring of {} descriptors at bus {:#x}",
            capacity,
            region.bus_base()
        );

        Ok(Self {
            region: Some(region),
            allocator,
            jobs,
            capacity,
            head: 0,
            tail: 0,
        })
    }

    /// Bus address of slot 0.
    pub fn bus_addr(&self) -> u64 {
        self.region.as_ref().map_or(0, |r| r.bus_base())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slot the next completion will be reclaimed from.
    pub fn head(&self) -> u32 {
        self.slot(self.head)
    }

    /// Slot the next submission will be written to.
    pub fn tail(&self) -> u32 {
        self.slot(self.tail)
    }

    /// Filled but not yet reclaimed slots.
    pub fn outstanding(&self) -> u32 {
        self.tail.wrapping_sub(self.head)
    }

    pub fn is_full(&self) -> bool {
        self.outstanding() == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }

    #[inline]
    fn slot(&self, counter: u32) -> u32 {
        counter & (self.capacity - 1)
    }

    /// Write a memcpy descriptor at `index` and hand it to hardware.
    ///
    /// `index` must be the current tail. The shadow slot is populated before
    /// the VALID bit is published so completion always finds its job.
    pub fn fill(
        &mut self,
        index: u32,
        src: u64,
        dst: u64,
        size: u32,
        interrupt: bool,
        job: PendingJob,
    ) -> Result<(), RingError> {
        if self.is_full() {
            return Err(RingError::Full);
        }
        let tail = self.tail();
        if index != tail {
            return Err(RingError::NotAtTail { index, tail });
        }
        if size > SIZE_MASK {
            return Err(RingError::TransferTooLarge(size));
        }

        let slot = &mut self.jobs[index as usize];
        debug_assert!(slot.is_none(), "BUG: filling slot {} that still holds a job", index);
        *slot = Some(job);

        self.write_descriptor(index, &HwDescriptor::memcpy(dst, src, size, interrupt));
        self.tail = self.tail.wrapping_add(1);

        log::trace!("plx-dma: slot {} {:#x} -> {:#x} ({} bytes)", index, src, dst, size);
        Ok(())
    }

    /// Clear the shadow slot at `index` (the current head) and advance head.
    ///
    /// Returns `None`, with a warning, when the slot holds no job or is not
    /// the head.
    pub fn reclaim(&mut self, index: u32) -> Option<PendingJob> {
        if self.is_empty() || index != self.head() {
            log::warn!(
                "plx-dma: reclaim of slot {} ignored (head {}, outstanding {})",
                index,
                self.head(),
                self.outstanding()
            );
            return None;
        }

        let job = self.jobs[index as usize].take();
        self.head = self.head.wrapping_add(1);

        if job.is_none() {
            log::warn!("plx-dma: slot {} completed without a pending job", index);
        }
        job
    }

    /// Reclaim the head slot if hardware has written it back.
    pub fn pop_completed(&mut self) -> Option<(PendingJob, TransferStatus)> {
        while !self.is_empty() {
            let index = self.head();
            let flags = self.read_flags(index);
            if flags & FLAG_VALID != 0 {
                return None;
            }
            if let Some(job) = self.reclaim(index) {
                let status = desc::write_back_status(flags, job.len());
                return Some((job, status));
            }
        }
        None
    }

    /// Reclaim the head slot regardless of hardware state.
    ///
    /// Only meaningful once the engine has been stopped.
    pub fn abort_next(&mut self) -> Option<PendingJob> {
        while !self.is_empty() {
            let index = self.head();
            if let Some(job) = self.reclaim(index) {
                return Some(job);
            }
        }
        None
    }

    /// Free the coherent buffer and the shadow array.
    ///
    /// Refused while any slot is outstanding. The caller guarantees the
    /// engine no longer fetches from the ring.
    pub fn release(mut self) -> Result<(), ReleaseRejected> {
        if !self.is_empty() {
            return Err(ReleaseRejected { ring: self });
        }
        if let Some(region) = self.region.take() {
            // SAFETY: no outstanding slots and the engine is stopped.
            unsafe { self.allocator.free_coherent(region) };
        }
        self.jobs = Vec::new();
        Ok(())
    }

    /// Drop the ring without returning its buffer to the allocator.
    ///
    /// For an engine that never confirmed it stopped: hardware may still
    /// fetch from or write back into the buffer.
    pub fn abandon(mut self) {
        if let Some(region) = self.region.take() {
            log::warn!("plx-dma: engine still live, leaking ring {:?}", region);
            core::mem::forget(region);
        }
    }

    /// Snapshot of the descriptor at `index`.
    pub fn read_descriptor(&self, index: u32) -> HwDescriptor {
        let mut bytes = [0u8; DESC_SIZE];
        let base = self.desc_ptr(index) as *const u32;
        for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
            // SAFETY: `index` is masked into the ring, slots are 4-byte aligned.
            let word = unsafe { core::ptr::read_volatile(base.add(i)) };
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        HwDescriptor::from_bytes(bytes)
    }

    fn read_flags(&self, index: u32) -> u32 {
        // SAFETY: as in `read_descriptor`.
        let word = unsafe { core::ptr::read_volatile(self.desc_ptr(index) as *const u32) };
        // Nothing written back after the flags word may be read before it.
        fence(Ordering::Acquire);
        u32::from_le_bytes(word.to_ne_bytes())
    }

    fn write_descriptor(&mut self, index: u32, desc: &HwDescriptor) {
        let base = self.desc_ptr(index) as *mut u32;
        let bytes = desc.as_bytes();
        let word = |i: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_ne_bytes(w)
        };

        // SAFETY: slot is inside the ring and owned by software (tail).
        unsafe {
            for i in 1..4 {
                core::ptr::write_volatile(base.add(i), word(i));
            }
            // Addresses must be visible before hardware can see VALID.
            fence(Ordering::Release);
            core::ptr::write_volatile(base, word(0));
        }
    }

    #[inline]
    fn desc_ptr(&self, index: u32) -> *mut u8 {
        let index = self.slot(index) as usize;
        match &self.region {
            // SAFETY: masked index stays within `capacity * DESC_SIZE` bytes.
            Some(region) => unsafe { region.cpu_base().add(index * DESC_SIZE) },
            None => unreachable!("descriptor access after release"),
        }
    }
}

impl Drop for DescriptorRing {
    fn drop(&mut self) {
        let Some(region) = self.region.take() else {
            return;
        };
        if self.is_empty() {
            // SAFETY: nothing outstanding, hardware holds no slot.
            unsafe { self.allocator.free_coherent(region) };
        } else {
            // Hardware may still write here.
            log::warn!(
                "plx-dma: ring dropped with {} descriptors outstanding, leaking {:?}",
                self.outstanding(),
                region
            );
            core::mem::forget(region);
        }
    }
}

impl fmt::Debug for DescriptorRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorRing")
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr()))
            .field("capacity", &self.capacity)
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

//! Common test utilities: a simulated PLX DMA function.
//!
//! Coherent memory comes from a heap buffer mapped at bus == CPU address,
//! so the simulated engine can follow descriptor addresses directly.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dma_pool::{CoherentAllocator, DmaError, DmaRegion, RegionPool, PAGE_SIZE};
use plx_dma::desc::{self, HwDescriptor, DESC_SIZE, FLAG_INT_WHEN_DONE};
use plx_dma::pci::{PCI_CLASS_SYSTEM_OTHER, PCI_VENDOR_ID_PLX, PLX_DMA_DEVICE_ID};
use plx_dma::regs::{ctrl, intr_status, offset};
use plx_dma::{
    CompletionFn, Cookie, InterruptHandler, IrqReturn, PciDeviceId, PciError, PciPlatform,
    RegisterWindow, TransferStatus,
};

/// DEVICE_CTRL bits unrelated to max payload, present at power-on.
pub const DEVICE_CTRL_RESET: u32 = 0x0000_2810;

// ============================================================================
// Coherent memory
// ============================================================================

/// Identity-mapped coherent pool over a heap buffer.
pub struct TestPool {
    pool: RegionPool,
    _backing: Vec<u8>,
}

impl TestPool {
    pub fn new(pages: usize) -> Arc<Self> {
        let mut backing = vec![0u8; (pages + 1) * PAGE_SIZE];
        let ptr = backing.as_mut_ptr();
        // SAFETY: the buffer lives as long as the pool and is used by nothing else.
        let pool = unsafe { RegionPool::new(ptr, ptr as u64, backing.len()) }.expect("pool");
        Arc::new(Self { pool, _backing: backing })
    }

    pub fn live_allocations(&self) -> usize {
        self.pool.live_allocations()
    }
}

impl CoherentAllocator for TestPool {
    fn alloc_coherent(&self, size: usize) -> dma_pool::Result<DmaRegion> {
        self.pool.alloc_coherent(size)
    }

    unsafe fn free_coherent(&self, region: DmaRegion) {
        self.pool.free_coherent(region)
    }
}

/// Allocator that is always out of memory.
pub struct FailingAllocator;

impl CoherentAllocator for FailingAllocator {
    fn alloc_coherent(&self, _size: usize) -> dma_pool::Result<DmaRegion> {
        Err(DmaError::OutOfMemory)
    }

    unsafe fn free_coherent(&self, _region: DmaRegion) {
        panic!("nothing was ever allocated");
    }
}

// ============================================================================
// Ring memory helpers
// ============================================================================

fn slot_ptr(ring_base: u64, index: u32) -> *mut u32 {
    (ring_base as usize + index as usize * DESC_SIZE) as *mut u32
}

/// Read the descriptor hardware would fetch.
pub fn read_slot(ring_base: u64, index: u32) -> HwDescriptor {
    let mut bytes = [0u8; DESC_SIZE];
    let base = slot_ptr(ring_base, index);
    for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
        let word = unsafe { std::ptr::read_volatile(base.add(i)) };
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    HwDescriptor::from_bytes(bytes)
}

/// Overwrite a slot's flags word the way the engine does on write-back.
pub fn write_back(ring_base: u64, index: u32, flags: u32) {
    let word = u32::from_ne_bytes(flags.to_le_bytes());
    unsafe { std::ptr::write_volatile(slot_ptr(ring_base, index), word) };
}

/// Write-back flags for a fully successful transfer of `size` bytes.
pub fn wb_success(size: u32) -> u32 {
    desc::WB_SUCCESS | desc::WB_RD_SUCCESS | desc::WB_WR_SUCCESS | size
}

// ============================================================================
// Simulated hardware
// ============================================================================

/// How the simulated engine finishes a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Read side failed after `moved` bytes.
    ReadFail { moved: u32 },
    /// Write side failed after `moved` bytes.
    WriteFail { moved: u32 },
}

/// Register file and engine state of one DMA function.
pub struct SimHw {
    regs: Mutex<HashMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
    /// Next slot the engine will fetch.
    hw_next: Mutex<u32>,
    pause_responds: AtomicBool,
    abort_responds: AtomicBool,
    unmapped: AtomicBool,
    maps: AtomicUsize,
    /// Handler to run once, right after the next CTRL write lands.
    irq_on_ctrl: Mutex<Option<Arc<dyn InterruptHandler>>>,
    irq_on_ctrl_result: Mutex<Option<IrqReturn>>,
}

impl SimHw {
    pub fn new(max_payload_cap: u32) -> Arc<Self> {
        let mut regs = HashMap::new();
        regs.insert(offset::DEVICE_CAP, 0x0000_8000 | max_payload_cap);
        regs.insert(offset::DEVICE_CTRL, DEVICE_CTRL_RESET);
        Arc::new(Self {
            regs: Mutex::new(regs),
            writes: Mutex::new(Vec::new()),
            hw_next: Mutex::new(0),
            pause_responds: AtomicBool::new(true),
            abort_responds: AtomicBool::new(true),
            unmapped: AtomicBool::new(false),
            maps: AtomicUsize::new(0),
            irq_on_ctrl: Mutex::new(None),
            irq_on_ctrl_result: Mutex::new(None),
        })
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.regs.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub fn set_reg(&self, offset: usize, value: u32) {
        self.regs.lock().unwrap().insert(offset, value);
    }

    /// Every register write so far, as (offset, value).
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    /// Values written to one register, in order.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes().into_iter().filter(|(o, _)| *o == offset).map(|(_, v)| v).collect()
    }

    pub fn set_pause_responds(&self, responds: bool) {
        self.pause_responds.store(responds, Ordering::SeqCst);
    }

    pub fn set_abort_responds(&self, responds: bool) {
        self.abort_responds.store(responds, Ordering::SeqCst);
    }

    /// Interrupt the CPU in the middle of the next CTRL write's caller.
    pub fn interrupt_on_ctrl_write(&self, handler: Arc<dyn InterruptHandler>) {
        *self.irq_on_ctrl.lock().unwrap() = Some(handler);
    }

    /// What the handler armed by `interrupt_on_ctrl_write` returned.
    pub fn ctrl_interrupt_result(&self) -> Option<IrqReturn> {
        *self.irq_on_ctrl_result.lock().unwrap()
    }

    pub fn is_unmapped(&self) -> bool {
        self.unmapped.load(Ordering::SeqCst)
    }

    /// Raise interrupt status bits.
    pub fn raise(&self, bits: u16) {
        let mut regs = self.regs.lock().unwrap();
        *regs.entry(offset::INTR_STATUS).or_insert(0) |= bits as u32;
    }

    pub fn ring_base(&self) -> u64 {
        let hi = self.reg(offset::DESC_RING_ADDR + 4) as u64;
        hi << 32 | self.reg(offset::DESC_RING_ADDR) as u64
    }

    pub fn ring_count(&self) -> u32 {
        self.reg(offset::DESC_RING_COUNT)
    }

    /// Finish the next fetched descriptor, if the engine is started and the
    /// descriptor is valid.
    ///
    /// Copies the data (up to `moved` bytes on failure), writes back status
    /// and raises DESC_DONE when the descriptor asked for it.
    pub fn complete_next(&self, outcome: Outcome) -> bool {
        let base = self.ring_base();
        let count = self.ring_count();
        let started = self.reg(offset::CTRL) as u16 & ctrl::START != 0;
        if !started || base == 0 || count == 0 {
            return false;
        }

        let mut next = self.hw_next.lock().unwrap();
        let fetched = read_slot(base, *next);
        if !fetched.is_valid() {
            return false;
        }

        let size = fetched.size();
        let (moved, flags) = match outcome {
            Outcome::Success => (size, wb_success(size)),
            Outcome::ReadFail { moved } => (moved, desc::WB_WR_SUCCESS | moved),
            Outcome::WriteFail { moved } => (moved, desc::WB_RD_SUCCESS | moved),
        };
        unsafe {
            std::ptr::copy(
                fetched.src_addr() as usize as *const u8,
                fetched.dst_addr() as usize as *mut u8,
                moved as usize,
            );
        }
        write_back(base, *next, flags);
        *next = (*next + 1) % count;
        drop(next);

        if fetched.flags_and_size() & FLAG_INT_WHEN_DONE != 0 {
            self.raise(intr_status::DESC_DONE);
        }
        true
    }

    /// Run the engine until it finds a slot it does not own.
    pub fn run(&self) -> usize {
        let mut done = 0;
        while self.complete_next(Outcome::Success) {
            done += 1;
        }
        done
    }

    fn read(&self, offset: usize) -> u32 {
        assert!(!self.is_unmapped(), "register read at {:#x} after unmap", offset);
        self.reg(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        assert!(!self.is_unmapped(), "register write at {:#x} after unmap", offset);
        self.writes.lock().unwrap().push((offset, value));
        self.apply(offset, value);

        if offset == offset::CTRL {
            let armed = self.irq_on_ctrl.lock().unwrap().take();
            if let Some(handler) = armed {
                *self.irq_on_ctrl_result.lock().unwrap() = Some(handler.handle_irq());
            }
        }
    }

    fn apply(&self, offset: usize, value: u32) {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            offset::INTR_STATUS => {
                let cur = regs.entry(offset).or_insert(0);
                *cur &= !value;
            }
            offset::CTRL => {
                let value = value as u16;
                let old = regs.get(&offset).copied().unwrap_or(0) as u16;
                let mut status = old & ctrl::RESET_VAL & !(value & ctrl::RESET_VAL);
                if value & ctrl::GRACEFUL_PAUSE != 0 && self.pause_responds.load(Ordering::SeqCst) {
                    status |= ctrl::GRACEFUL_PAUSE_DONE;
                }
                if value & ctrl::ABORT != 0 && self.abort_responds.load(Ordering::SeqCst) {
                    status |= ctrl::ABORT_DONE;
                }
                regs.insert(offset, ((value & !ctrl::RESET_VAL) | status) as u32);
            }
            offset::DESC_RING_COUNT => {
                regs.insert(offset, value);
                *self.hw_next.lock().unwrap() = 0;
            }
            _ => {
                regs.insert(offset, value);
            }
        }
    }
}

/// BAR 0 mapping of a [`SimHw`].
pub struct SimWindow {
    hw: Arc<SimHw>,
}

impl RegisterWindow for SimWindow {
    fn read16(&self, offset: usize) -> u16 {
        self.hw.read(offset) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        self.hw.read(offset)
    }

    fn write16(&self, offset: usize, value: u16) {
        self.hw.write(offset, value as u32)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.hw.write(offset, value)
    }
}

impl Drop for SimWindow {
    fn drop(&mut self) {
        if self.hw.maps.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.hw.unmapped.store(true, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Mock platform
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Enable,
    DmaMask(u32),
    CoherentMask(u32),
    MapBar(u8),
    AllocVectors,
    SetMaster,
    RequestIrq(u32),
    FreeIrq(u32),
    FreeVectors,
}

pub const TEST_IRQ: u32 = 42;

/// Host platform with one simulated PLX DMA function.
pub struct MockPlatform {
    pub id: PciDeviceId,
    pub hw: Arc<SimHw>,
    pub pool: Arc<TestPool>,
    pub allocator: Arc<dyn CoherentAllocator>,
    pub events: Vec<Event>,
    pub handler: Option<Arc<dyn InterruptHandler>>,
    /// Widest DMA mask the platform accepts; 0 accepts none.
    pub max_dma_bits: u32,
    pub fail_enable: bool,
    pub fail_map: bool,
    pub fail_vectors: bool,
    pub fail_request_irq: bool,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::with_cap(4)
    }

    /// Platform whose device advertises max payload code `cap`.
    pub fn with_cap(cap: u32) -> Self {
        let pool = TestPool::new(16);
        Self {
            id: PciDeviceId::new(PCI_VENDOR_ID_PLX, PLX_DMA_DEVICE_ID, PCI_CLASS_SYSTEM_OTHER),
            hw: SimHw::new(cap),
            allocator: pool.clone(),
            pool,
            events: Vec::new(),
            handler: None,
            max_dma_bits: 64,
            fail_enable: false,
            fail_map: false,
            fail_vectors: false,
            fail_request_irq: false,
        }
    }

    /// Deliver the device interrupt, as the interrupt controller would.
    pub fn fire_irq(&self) -> IrqReturn {
        match &self.handler {
            Some(handler) => handler.handle_irq(),
            None => IrqReturn::None,
        }
    }

    pub fn handler_refs(&self) -> usize {
        self.handler.as_ref().map_or(0, Arc::strong_count)
    }
}

impl PciPlatform for MockPlatform {
    fn id(&self) -> PciDeviceId {
        self.id
    }

    fn enable_device(&mut self) -> Result<(), PciError> {
        self.events.push(Event::Enable);
        if self.fail_enable {
            return Err(PciError::EnableFailed);
        }
        Ok(())
    }

    fn set_dma_mask(&mut self, bits: u32) -> Result<(), PciError> {
        self.events.push(Event::DmaMask(bits));
        if bits > self.max_dma_bits {
            return Err(PciError::DmaMaskUnsupported);
        }
        Ok(())
    }

    fn set_coherent_dma_mask(&mut self, bits: u32) -> Result<(), PciError> {
        self.events.push(Event::CoherentMask(bits));
        if bits > self.max_dma_bits {
            return Err(PciError::DmaMaskUnsupported);
        }
        Ok(())
    }

    fn iomap_bar(&mut self, bar: u8) -> Result<Box<dyn RegisterWindow>, PciError> {
        self.events.push(Event::MapBar(bar));
        if self.fail_map {
            return Err(PciError::MapFailed);
        }
        self.hw.maps.fetch_add(1, Ordering::SeqCst);
        self.hw.unmapped.store(false, Ordering::SeqCst);
        Ok(Box::new(SimWindow { hw: self.hw.clone() }))
    }

    fn dma_allocator(&self) -> Arc<dyn CoherentAllocator> {
        self.allocator.clone()
    }

    fn alloc_irq_vectors(&mut self, min: u32, max: u32) -> Result<u32, PciError> {
        assert_eq!((min, max), (1, 1), "driver wants exactly one vector");
        self.events.push(Event::AllocVectors);
        if self.fail_vectors {
            return Err(PciError::IrqVectorsUnavailable);
        }
        Ok(1)
    }

    fn free_irq_vectors(&mut self) {
        self.events.push(Event::FreeVectors);
    }

    fn irq_vector(&self, index: u32) -> u32 {
        TEST_IRQ + index
    }

    fn set_master(&mut self) {
        self.events.push(Event::SetMaster);
    }

    fn request_irq(
        &mut self,
        irq: u32,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<(), PciError> {
        self.events.push(Event::RequestIrq(irq));
        if self.fail_request_irq {
            return Err(PciError::IrqRequestFailed);
        }
        self.handler = Some(handler);
        Ok(())
    }

    fn free_irq(&mut self, irq: u32) {
        self.events.push(Event::FreeIrq(irq));
        self.handler = None;
    }
}

/// Every (cookie, status) a recorder's handles were called with.
pub type Completions = Arc<Mutex<Vec<(Cookie, TransferStatus)>>>;

/// Completion handle that records what it was called with.
pub fn recorder() -> (Completions, impl Fn() -> CompletionFn) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let make = move || -> CompletionFn {
        let sink = sink.clone();
        Box::new(move |cookie, status| sink.lock().unwrap().push((cookie, status)))
    };
    (log, make)
}

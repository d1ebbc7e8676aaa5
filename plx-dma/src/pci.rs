//! PCI binding.
//!
//! The host platform performs enumeration, BAR mapping and interrupt
//! vector allocation; the driver only sequences those steps through
//! [`PciPlatform`].

use alloc::boxed::Box;
use alloc::sync::Arc;

use dma_pool::CoherentAllocator;

use crate::error::PciError;
use crate::irq::InterruptHandler;
use crate::mmio::RegisterWindow;

/// PLX Technology vendor ID.
pub const PCI_VENDOR_ID_PLX: u16 = 0x10B5;

/// ExpressLane PEX switch DMA function.
pub const PLX_DMA_DEVICE_ID: u16 = 0x87D0;

/// Base class "system peripheral", subclass "other".
pub const PCI_CLASS_SYSTEM_OTHER: u16 = 0x0880;

/// Identity of a PCI function as seen during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceId {
    pub vendor: u16,
    pub device: u16,
    /// Base class and subclass.
    pub class: u16,
}

impl PciDeviceId {
    pub const fn new(vendor: u16, device: u16, class: u16) -> Self {
        Self { vendor, device, class }
    }

    /// Exact match of all three fields.
    pub fn matches(&self, other: &PciDeviceId) -> bool {
        self == other
    }
}

/// Functions this driver binds to.
pub const PLX_DMA_PCI_TABLE: &[PciDeviceId] = &[PciDeviceId::new(
    PCI_VENDOR_ID_PLX,
    PLX_DMA_DEVICE_ID,
    PCI_CLASS_SYSTEM_OTHER,
)];

/// Whether `id` is handled by this driver.
pub fn is_supported(id: &PciDeviceId) -> bool {
    PLX_DMA_PCI_TABLE.iter().any(|entry| entry.matches(id))
}

/// Host services for one PCI function.
///
/// # Contract
/// - `free_irq` must not return while the handler is running, and the
///   handler must never be invoked afterwards; the platform drops its
///   reference to the handler before returning.
/// - Regions from `dma_allocator` must be reachable at the addresses
///   permitted by the DMA mask that was set.
pub trait PciPlatform {
    /// Identity of the function being probed.
    fn id(&self) -> PciDeviceId;

    fn enable_device(&mut self) -> Result<(), PciError>;

    /// Streaming DMA address width.
    fn set_dma_mask(&mut self, bits: u32) -> Result<(), PciError>;

    /// Coherent DMA address width.
    fn set_coherent_dma_mask(&mut self, bits: u32) -> Result<(), PciError>;

    /// Map a BAR. Dropping the returned window unmaps it.
    fn iomap_bar(&mut self, bar: u8) -> Result<Box<dyn RegisterWindow>, PciError>;

    fn dma_allocator(&self) -> Arc<dyn CoherentAllocator>;

    /// Allocate between `min` and `max` vectors, returning the count.
    fn alloc_irq_vectors(&mut self, min: u32, max: u32) -> Result<u32, PciError>;

    fn free_irq_vectors(&mut self);

    /// Platform interrupt number for vector `index`.
    fn irq_vector(&self, index: u32) -> u32;

    fn set_master(&mut self);

    fn request_irq(&mut self, irq: u32, handler: Arc<dyn InterruptHandler>) -> Result<(), PciError>;

    fn free_irq(&mut self, irq: u32);
}

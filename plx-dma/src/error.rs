//! Driver error types

use core::fmt;

use dma_pool::DmaError;

pub type Result<T> = core::result::Result<T, PlxError>;

/// Descriptor ring errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Capacity must be a non-zero power of two.
    InvalidCapacity(u32),
    /// Coherent descriptor memory or shadow slots could not be allocated.
    Allocation(DmaError),
    /// Every slot is owned by hardware.
    Full,
    /// Slots are filled strictly at the tail.
    NotAtTail { index: u32, tail: u32 },
    /// Size does not fit the descriptor size field.
    TransferTooLarge(u32),
    /// Release attempted with slots still outstanding.
    Busy { outstanding: u32 },
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCapacity(n) => write!(f, "invalid ring capacity {}", n),
            Self::Allocation(e) => write!(f, "ring allocation failed: {}", e),
            Self::Full => write!(f, "descriptor ring full"),
            Self::NotAtTail { index, tail } => {
                write!(f, "fill at slot {} but tail is {}", index, tail)
            }
            Self::TransferTooLarge(n) => write!(f, "transfer of {} bytes too large", n),
            Self::Busy { outstanding } => {
                write!(f, "ring busy: {} descriptors outstanding", outstanding)
            }
        }
    }
}

impl From<DmaError> for RingError {
    fn from(err: DmaError) -> Self {
        RingError::Allocation(err)
    }
}

/// Failures reported by the host PCI platform during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// Vendor, device or class not in the match table.
    UnsupportedDevice,
    EnableFailed,
    /// Neither the preferred nor the fallback DMA mask is supported.
    DmaMaskUnsupported,
    MapFailed,
    IrqVectorsUnavailable,
    IrqRequestFailed,
}

impl fmt::Display for PciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedDevice => write!(f, "unsupported PCI device"),
            Self::EnableFailed => write!(f, "failed to enable PCI device"),
            Self::DmaMaskUnsupported => write!(f, "no usable DMA mask"),
            Self::MapFailed => write!(f, "failed to map register BAR"),
            Self::IrqVectorsUnavailable => write!(f, "no interrupt vector available"),
            Self::IrqRequestFailed => write!(f, "failed to request interrupt"),
        }
    }
}

/// PLX DMA driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlxError {
    /// Device bring-up failed.
    Pci(PciError),
    /// Ring allocation or submission failed.
    Ring(RingError),
    /// The single channel is already active or being torn down.
    ChannelBusy,
    /// Channel is not in the activated state.
    NotActive,
    /// Device has been removed from the platform.
    DeviceRemoved,
    /// Source or destination outside the 48-bit bus address range.
    AddressOutOfRange(u64),
}

impl fmt::Display for PlxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pci(e) => write!(f, "PCI: {}", e),
            Self::Ring(e) => write!(f, "ring: {}", e),
            Self::ChannelBusy => write!(f, "DMA channel busy"),
            Self::NotActive => write!(f, "DMA channel not active"),
            Self::DeviceRemoved => write!(f, "device removed"),
            Self::AddressOutOfRange(addr) => write!(f, "bus address {:#x} out of range", addr),
        }
    }
}

impl From<PciError> for PlxError {
    fn from(err: PciError) -> Self {
        PlxError::Pci(err)
    }
}

impl From<RingError> for PlxError {
    fn from(err: RingError) -> Self {
        PlxError::Ring(err)
    }
}

//! Driver for the DMA copy engine in PLX ExpressLane PCIe switches.
//!
//! Each switch exposes one memory-to-memory DMA channel on a dedicated PCI
//! function. The channel is driven through an off-chip descriptor ring in
//! coherent memory:
//!
//! ```text
//!   prep_memcpy ──> DescriptorRing (tail) ──> engine ──> write-back
//!                                                          │
//!   completion handle <── interrupt / poll <── ring (head) ┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use plx_dma::{EngineConfig, PlxDmaDevice, PrepFlags};
//!
//! let dev = PlxDmaDevice::probe(&mut platform, EngineConfig::default())?;
//! let chan = dev.activate_channel()?;
//!
//! let cookie = chan.prep_memcpy(dst_bus, src_bus, len, PrepFlags::INTERRUPT, None)?;
//! chan.issue_pending()?;
//! // ... interrupt fires, or poll ...
//! chan.poll_completions();
//!
//! chan.deactivate();
//! dev.remove(&mut platform);
//! ```

#![no_std]

extern crate alloc;

pub mod config;
pub mod desc;
pub mod error;
pub mod irq;
pub mod job;
pub mod mmio;
pub mod negotiate;
pub mod pci;
pub mod regs;
pub mod ring;

mod chan;
mod device;

pub use chan::{ActiveChannel, ChannelState};
pub use config::{EngineConfig, PLX_DMA_RING_COUNT};
pub use device::{ChannelFaults, PlxDmaDevice};
pub use error::{PciError, PlxError, Result, RingError};
pub use irq::{InterruptHandler, IrqReturn, IrqStatus};
pub use job::{CompletionFn, Cookie, PrepFlags, TransferResult, TransferStatus, TxState};
pub use mmio::{Mmio, RegisterWindow};
pub use negotiate::MaxPayload;
pub use pci::{PciDeviceId, PciPlatform};
pub use ring::DescriptorRing;

pub use dma_pool::{CoherentAllocator, DmaError, DmaRegion};

//! Device context and PCI probe/remove.
//!
//! # Ownership
//! The context is shared between two owners:
//!
//! ```text
//!   PlxDmaDevice (platform)  ──┐
//!     └─ IRQ registration    ──┼──> Arc<DeviceContext> ──> register window
//!   ActiveChannel (channel)  ──┘
//! ```
//!
//! The register window is unmapped when the last owner lets go, which is
//! only after the platform has removed the device *and* the channel has
//! been deactivated, in whichever order those happen.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use dma_pool::CoherentAllocator;

use crate::chan::{ActiveChannel, ChanInner, ChannelState};
use crate::config::EngineConfig;
use crate::error::{PciError, PlxError, Result};
use crate::irq::InterruptHandler;
use crate::mmio::RegisterWindow;
use crate::negotiate::{negotiate_max_payload, MaxPayload};
use crate::pci::{self, PciPlatform};
use crate::regs::Regs;

// ═══════════════════════════════════════════════════════════════════════════
// DEVICE CONTEXT
// ═══════════════════════════════════════════════════════════════════════════

/// Hardware-reported faults seen by the interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelFaults {
    /// ERROR status interrupts.
    pub errors: u32,
    /// INV_DESC status interrupts.
    pub invalid_descriptors: u32,
}

#[derive(Default)]
pub(crate) struct FaultCounters {
    pub errors: AtomicU32,
    pub invalid_descriptors: AtomicU32,
}

impl FaultCounters {
    pub fn snapshot(&self) -> ChannelFaults {
        ChannelFaults {
            errors: self.errors.load(Ordering::Relaxed),
            invalid_descriptors: self.invalid_descriptors.load(Ordering::Relaxed),
        }
    }
}

/// Everything one adapter owns.
pub(crate) struct DeviceContext {
    bar: Box<dyn RegisterWindow>,
    pub allocator: Arc<dyn CoherentAllocator>,
    pub config: EngineConfig,
    pub max_payload: MaxPayload,
    pub chan: spin::Mutex<ChanInner>,
    /// Set once the platform has detached; no register access afterwards.
    pub removed: AtomicBool,
    /// An interrupt found the channel lock taken and left the reap to its holder.
    pub reap_deferred: AtomicBool,
    pub faults: FaultCounters,
}

impl DeviceContext {
    /// Bring a freshly mapped device to `Configured`.
    fn configure(
        bar: Box<dyn RegisterWindow>,
        allocator: Arc<dyn CoherentAllocator>,
        config: EngineConfig,
    ) -> Self {
        let mut chan = ChanInner::new();
        let max_payload = negotiate_max_payload(Regs::new(&*bar));
        chan.state = ChannelState::Configured;

        Self {
            bar,
            allocator,
            config,
            max_payload,
            chan: spin::Mutex::new(chan),
            removed: AtomicBool::new(false),
            reap_deferred: AtomicBool::new(false),
            faults: FaultCounters::default(),
        }
    }

    pub fn regs(&self) -> Regs<'_> {
        Regs::new(&*self.bar)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("plx-dma: device context released, unmapping registers");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PLATFORM HANDLE
// ═══════════════════════════════════════════════════════════════════════════

/// A probed PLX DMA adapter, owned by the platform.
///
/// Must be handed back through [`remove`](Self::remove): the interrupt
/// registration holds a reference to the context until then.
pub struct PlxDmaDevice {
    ctx: Arc<DeviceContext>,
    irq: u32,
}

impl PlxDmaDevice {
    /// Bring up the DMA function of a PLX switch.
    ///
    /// # Sequence
    /// 1. Enable the PCI function
    /// 2. Set DMA masks (preferred width, then fallback)
    /// 3. Map BAR 0
    /// 4. Allocate one interrupt vector
    /// 5. Enable bus mastering
    /// 6. Negotiate max payload and register the interrupt handler
    ///
    /// Failures unwind whatever was already set up.
    pub fn probe(platform: &mut dyn PciPlatform, config: EngineConfig) -> Result<Self> {
        let id = platform.id();
        if !pci::is_supported(&id) {
            return Err(PciError::UnsupportedDevice.into());
        }

        platform.enable_device()?;
        Self::set_dma_masks(platform, &config)?;

        let bar = platform.iomap_bar(0)?;
        platform.alloc_irq_vectors(1, 1)?;
        platform.set_master();

        match Self::create(platform, bar, config) {
            Ok(dev) => {
                log::info!(
                    "plx-dma: PLX DMA Channel Registered ({:04x}:{:04x})",
                    id.vendor,
                    id.device
                );
                Ok(dev)
            }
            Err(err) => {
                platform.free_irq_vectors();
                Err(err)
            }
        }
    }

    fn set_dma_masks(platform: &mut dyn PciPlatform, config: &EngineConfig) -> Result<()> {
        for bits in [config.dma_mask_bits, config.fallback_dma_mask_bits] {
            if platform.set_dma_mask(bits).is_ok() && platform.set_coherent_dma_mask(bits).is_ok() {
                log::debug!("plx-dma: using {}-bit DMA addressing", bits);
                return Ok(());
            }
        }
        Err(PciError::DmaMaskUnsupported.into())
    }

    fn create(
        platform: &mut dyn PciPlatform,
        bar: Box<dyn RegisterWindow>,
        config: EngineConfig,
    ) -> Result<Self> {
        let ctx = Arc::new(DeviceContext::configure(bar, platform.dma_allocator(), config));

        let irq = platform.irq_vector(0);
        let handler: Arc<dyn InterruptHandler> = ctx.clone();
        platform.request_irq(irq, handler)?;

        Ok(Self { ctx, irq })
    }

    /// Detach from the platform.
    ///
    /// The interrupt handler is gone and a running engine is stopped once
    /// this returns. The register window stays mapped until an active
    /// channel, if any, is released.
    pub fn remove(self, platform: &mut dyn PciPlatform) {
        let Self { ctx, irq } = self;

        platform.free_irq(irq);
        ctx.halt_for_removal();
        ctx.removed.store(true, Ordering::Release);

        if Arc::strong_count(&ctx) > 1 {
            log::info!("plx-dma: device removed, waiting for channel release");
        }
        drop(ctx);

        platform.free_irq_vectors();
    }

    /// Allocate ring resources and start the engine.
    pub fn activate_channel(&self) -> Result<ActiveChannel> {
        if self.ctx.is_removed() {
            return Err(PlxError::DeviceRemoved);
        }
        ActiveChannel::activate(&self.ctx)
    }

    pub fn channel_state(&self) -> ChannelState {
        self.ctx.lock_chan().state
    }

    pub fn max_payload(&self) -> MaxPayload {
        self.ctx.max_payload
    }

    pub fn faults(&self) -> ChannelFaults {
        self.ctx.faults.snapshot()
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Current number of owners of the device context.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.ctx)
    }
}

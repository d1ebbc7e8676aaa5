//! Engine configuration.

use crate::regs::pref_limit;

/// Descriptors in the hardware ring.
pub const PLX_DMA_RING_COUNT: u32 = 2048;

/// Default busy-wait budget for graceful pause, in register polls.
pub const DEFAULT_PAUSE_POLL_LIMIT: u32 = 100_000;

/// PLX DMA engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of ring descriptors (power of two).
    pub ring_count: u32,
    /// Descriptor prefetch limit register value.
    pub prefetch_limit: u32,
    /// Register polls to wait for graceful pause before giving up.
    pub pause_poll_limit: u32,
    /// Preferred DMA address width in bits.
    pub dma_mask_bits: u32,
    /// Width tried when the preferred one is refused.
    pub fallback_dma_mask_bits: u32,
}

impl EngineConfig {
    /// Create configuration with default values.
    pub const fn new() -> Self {
        Self {
            ring_count: PLX_DMA_RING_COUNT,
            prefetch_limit: pref_limit::PREF_FOUR,
            pause_poll_limit: DEFAULT_PAUSE_POLL_LIMIT,
            dma_mask_bits: 48,
            fallback_dma_mask_bits: 32,
        }
    }

    pub const fn with_ring_count(mut self, ring_count: u32) -> Self {
        self.ring_count = ring_count;
        self
    }

    pub const fn with_pause_poll_limit(mut self, polls: u32) -> Self {
        self.pause_poll_limit = polls;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

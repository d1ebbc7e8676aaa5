//! PLX DMA register definitions and typed accessors.
//!
//! Offsets are bytes into BAR 0 of the switch's DMA function.

use crate::mmio::RegisterWindow;

/// Register offsets (from BAR 0).
pub mod offset {
    /// PCIe Device Capability
    pub const DEVICE_CAP: usize = 0x6C;
    /// PCIe Device Control
    pub const DEVICE_CTRL: usize = 0x70;
    /// Descriptor Ring Base Address (64-bit)
    pub const DESC_RING_ADDR: usize = 0x214;
    /// Descriptor Ring Next Address (low 32 bits)
    pub const DESC_RING_NEXT_ADDR: usize = 0x21C;
    /// Descriptor Ring Entry Count
    pub const DESC_RING_COUNT: usize = 0x220;
    /// Descriptor Prefetch Limit
    pub const PREF_LIMIT: usize = 0x234;
    /// DMA Engine Control (16-bit)
    pub const CTRL: usize = 0x238;
    /// DMA Engine Control 2 (16-bit)
    pub const CTRL2: usize = 0x23A;
    /// Interrupt Control (16-bit)
    pub const INTR_CTRL: usize = 0x23C;
    /// Interrupt Status (16-bit, write-1-to-clear)
    pub const INTR_STATUS: usize = 0x23E;
}

/// Device Capability fields
pub mod device_cap {
    pub const MAX_PAYLOAD_MASK: u32 = 7;
    pub const MAX_PAYLOAD_128B: u32 = 0;
    pub const MAX_PAYLOAD_256B: u32 = 1;
    pub const MAX_PAYLOAD_512B: u32 = 2;
    pub const MAX_PAYLOAD_1KB: u32 = 3;
    pub const MAX_PAYLOAD_2KB: u32 = 4;
}

/// Device Control bits
pub mod device_ctrl {
    pub const CORR_ERR_RPT: u32 = 1 << 0;
    pub const NON_FATAL_ERR_RPT: u32 = 1 << 1;
    pub const FATAL_ERR_RPT: u32 = 1 << 2;
    pub const UNSUP_REQ_RPT: u32 = 1 << 3;
    pub const RELAX_ORDERING: u32 = 1 << 4;
    pub const MAX_PAYLOAD_SHIFT: u32 = 5;
    pub const MAX_PAYLOAD_MASK: u32 = 7 << MAX_PAYLOAD_SHIFT;
    pub const MAX_PAYLOAD_128B: u32 = 0 << MAX_PAYLOAD_SHIFT;
    pub const MAX_PAYLOAD_256B: u32 = 1 << MAX_PAYLOAD_SHIFT;
    pub const MAX_PAYLOAD_512B: u32 = 2 << MAX_PAYLOAD_SHIFT;
    pub const MAX_PAYLOAD_1KB: u32 = 3 << MAX_PAYLOAD_SHIFT;
    pub const MAX_PAYLOAD_2KB: u32 = 4 << MAX_PAYLOAD_SHIFT;
    pub const EXT_TAG_EN: u32 = 1 << 8;
    pub const EN_NO_SNOOP: u32 = 1 << 11;
}

/// Prefetch limit values
pub mod pref_limit {
    /// Prefetch four descriptors at a time
    pub const PREF_FOUR: u32 = 8;
}

/// Engine Control bits
pub mod ctrl {
    pub const GRACEFUL_PAUSE: u16 = 1 << 0;
    pub const ABORT: u16 = 1 << 1;
    pub const WRITE_BACK_EN: u16 = 1 << 2;
    pub const START: u16 = 1 << 3;
    pub const RING_STOP_MODE: u16 = 1 << 4;
    pub const DESC_MODE_BLOCK: u16 = 0 << 5;
    pub const DESC_MODE_ON_CHIP: u16 = 1 << 5;
    pub const DESC_MODE_OFF_CHIP: u16 = 2 << 5;
    pub const DESC_INVALID: u16 = 1 << 8;
    pub const GRACEFUL_PAUSE_DONE: u16 = 1 << 9;
    pub const ABORT_DONE: u16 = 1 << 10;
    pub const IMM_PAUSE_DONE: u16 = 1 << 12;

    /// Value written to kick the engine.
    pub const START_VAL: u16 = WRITE_BACK_EN | DESC_MODE_OFF_CHIP | START;

    /// Latched status bits, cleared by writing them back.
    pub const RESET_VAL: u16 = DESC_INVALID | GRACEFUL_PAUSE_DONE | ABORT_DONE | IMM_PAUSE_DONE;
}

/// Engine Control 2: maximum transfer size encoding
pub mod ctrl2 {
    pub const MAX_TXFR_SIZE_64B: u16 = 0;
    pub const MAX_TXFR_SIZE_128B: u16 = 1;
    pub const MAX_TXFR_SIZE_256B: u16 = 2;
    pub const MAX_TXFR_SIZE_512B: u16 = 3;
    pub const MAX_TXFR_SIZE_1KB: u16 = 4;
    pub const MAX_TXFR_SIZE_2KB: u16 = 5;
    pub const MAX_TXFR_SIZE_4B: u16 = 7;
}

/// Interrupt Control enable bits
pub mod intr_ctrl {
    pub const ERROR_EN: u16 = 1 << 0;
    pub const INV_DESC_EN: u16 = 1 << 1;
    pub const ABORT_DONE_EN: u16 = 1 << 3;
    pub const PAUSE_DONE_EN: u16 = 1 << 4;
    pub const IMM_PAUSE_DONE_EN: u16 = 1 << 5;
}

/// Interrupt Status bits
pub mod intr_status {
    pub const ERROR: u16 = 1 << 0;
    pub const INV_DESC: u16 = 1 << 1;
    pub const DESC_DONE: u16 = 1 << 2;
    pub const ABORT_DONE: u16 = 1 << 3;
}

// ═══════════════════════════════════════════════════════════════════════════
// TYPED ACCESS
// ═══════════════════════════════════════════════════════════════════════════

/// Typed view over the DMA register window.
///
/// Every call is a direct device access; nothing is cached.
#[derive(Clone, Copy)]
pub struct Regs<'a> {
    bar: &'a dyn RegisterWindow,
}

impl<'a> Regs<'a> {
    pub fn new(bar: &'a dyn RegisterWindow) -> Self {
        Self { bar }
    }

    /// 3-bit max payload capability code.
    pub fn max_payload_cap(&self) -> u32 {
        self.bar.read32(offset::DEVICE_CAP) & device_cap::MAX_PAYLOAD_MASK
    }

    pub fn device_ctrl(&self) -> u32 {
        self.bar.read32(offset::DEVICE_CTRL)
    }

    pub fn set_device_ctrl(&self, value: u32) {
        self.bar.write32(offset::DEVICE_CTRL, value)
    }

    /// Program ring base, next pointer and entry count in one go.
    pub fn set_ring(&self, bus_addr: u64, count: u32) {
        self.bar.write64(offset::DESC_RING_ADDR, bus_addr);
        self.bar.write32(offset::DESC_RING_NEXT_ADDR, bus_addr as u32);
        self.bar.write32(offset::DESC_RING_COUNT, count);
    }

    pub fn set_prefetch_limit(&self, value: u32) {
        self.bar.write32(offset::PREF_LIMIT, value)
    }

    pub fn ctrl(&self) -> u16 {
        self.bar.read16(offset::CTRL)
    }

    pub fn set_ctrl(&self, value: u16) {
        self.bar.write16(offset::CTRL, value)
    }

    pub fn set_ctrl2(&self, value: u16) {
        self.bar.write16(offset::CTRL2, value)
    }

    pub fn set_intr_ctrl(&self, value: u16) {
        self.bar.write16(offset::INTR_CTRL, value)
    }

    pub fn intr_status(&self) -> u16 {
        self.bar.read16(offset::INTR_STATUS)
    }

    /// Clear exactly the given status bits.
    pub fn ack_intr_status(&self, bits: u16) {
        self.bar.write16(offset::INTR_STATUS, bits)
    }
}

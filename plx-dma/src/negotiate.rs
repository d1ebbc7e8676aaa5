//! Maximum payload negotiation.
//!
//! The PCIe device control block and the DMA engine each carry their own
//! max-transfer field, with different encodings. Both are programmed from
//! the capability code read once at bring-up.

use core::fmt;

use crate::regs::{ctrl2, device_cap, device_ctrl, Regs};

/// Negotiated maximum payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxPayload {
    B128,
    B256,
    B512,
    K1,
    K2,
}

impl MaxPayload {
    /// Map a 3-bit capability code; unknown codes fall back to 128 bytes.
    pub fn from_cap(code: u32) -> Self {
        match code & device_cap::MAX_PAYLOAD_MASK {
            device_cap::MAX_PAYLOAD_256B => MaxPayload::B256,
            device_cap::MAX_PAYLOAD_512B => MaxPayload::B512,
            device_cap::MAX_PAYLOAD_1KB => MaxPayload::K1,
            device_cap::MAX_PAYLOAD_2KB => MaxPayload::K2,
            _ => MaxPayload::B128,
        }
    }

    /// Device control max-payload field (bits 5-7).
    pub fn device_ctrl_field(self) -> u32 {
        match self {
            MaxPayload::B128 => device_ctrl::MAX_PAYLOAD_128B,
            MaxPayload::B256 => device_ctrl::MAX_PAYLOAD_256B,
            MaxPayload::B512 => device_ctrl::MAX_PAYLOAD_512B,
            MaxPayload::K1 => device_ctrl::MAX_PAYLOAD_1KB,
            MaxPayload::K2 => device_ctrl::MAX_PAYLOAD_2KB,
        }
    }

    /// Engine control 2 max-transfer value.
    pub fn ctrl2_value(self) -> u16 {
        match self {
            MaxPayload::B128 => ctrl2::MAX_TXFR_SIZE_128B,
            MaxPayload::B256 => ctrl2::MAX_TXFR_SIZE_256B,
            MaxPayload::B512 => ctrl2::MAX_TXFR_SIZE_512B,
            MaxPayload::K1 => ctrl2::MAX_TXFR_SIZE_1KB,
            MaxPayload::K2 => ctrl2::MAX_TXFR_SIZE_2KB,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            MaxPayload::B128 => 128,
            MaxPayload::B256 => 256,
            MaxPayload::B512 => 512,
            MaxPayload::K1 => 1024,
            MaxPayload::K2 => 2048,
        }
    }
}

impl fmt::Display for MaxPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxPayload::B128 => write!(f, "128B"),
            MaxPayload::B256 => write!(f, "256B"),
            MaxPayload::B512 => write!(f, "512B"),
            MaxPayload::K1 => write!(f, "1KB"),
            MaxPayload::K2 => write!(f, "2KB"),
        }
    }
}

/// Read the capability code and program both max-transfer fields.
///
/// Other device control bits are preserved.
pub fn negotiate_max_payload(regs: Regs<'_>) -> MaxPayload {
    let payload = MaxPayload::from_cap(regs.max_payload_cap());

    let dev_ctrl =
        (regs.device_ctrl() & !device_ctrl::MAX_PAYLOAD_MASK) | payload.device_ctrl_field();
    regs.set_device_ctrl(dev_ctrl);
    regs.set_ctrl2(payload.ctrl2_value());

    log::info!("plx-dma: Maximum Transfer Size set to {}", payload);
    payload
}

//! Hardware descriptor layout.
//!
//! # Layout (16 bytes, little-endian)
//! ```text
//! Offset  Size  Field
//! 0x00    4     flags_and_size   bit 31 VALID, bit 30 INT_WHEN_DONE, bits 0-26 size
//! 0x04    2     dst_addr_hi      address bits 32-47
//! 0x06    2     src_addr_hi
//! 0x08    4     dst_addr_lo      address bits 0-31
//! 0x0C    4     src_addr_lo
//! ```
//!
//! On completion the engine clears VALID and overlays SUCCESS / RD_SUCCESS /
//! WR_SUCCESS into bits 30/29/28 of the flags word, with the size field
//! holding the byte count it actually moved.

use crate::job::{TransferResult, TransferStatus};

/// Size of one hardware descriptor in bytes.
pub const DESC_SIZE: usize = 16;

/// Descriptor is owned by hardware.
pub const FLAG_VALID: u32 = 1 << 31;
/// Raise DESC_DONE when this descriptor completes.
pub const FLAG_INT_WHEN_DONE: u32 = 1 << 30;

/// Write-back: transfer succeeded.
pub const WB_SUCCESS: u32 = 1 << 30;
/// Write-back: read side succeeded.
pub const WB_RD_SUCCESS: u32 = 1 << 29;
/// Write-back: write side succeeded.
pub const WB_WR_SUCCESS: u32 = 1 << 28;

/// Largest transfer one descriptor can carry.
pub const SIZE_MASK: u32 = 0x07FF_FFFF;

/// Widest bus address a descriptor can hold (48 bits).
pub const ADDR_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Byte-exact image of one ring slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HwDescriptor {
    bytes: [u8; DESC_SIZE],
}

impl HwDescriptor {
    /// Build a valid memcpy descriptor.
    ///
    /// Addresses are truncated to 48 bits and `size` to [`SIZE_MASK`];
    /// callers validate both beforehand.
    pub fn memcpy(dst: u64, src: u64, size: u32, interrupt: bool) -> Self {
        let mut flags = FLAG_VALID | (size & SIZE_MASK);
        if interrupt {
            flags |= FLAG_INT_WHEN_DONE;
        }

        let mut bytes = [0u8; DESC_SIZE];
        bytes[0..4].copy_from_slice(&flags.to_le_bytes());
        bytes[4..6].copy_from_slice(&((dst >> 32) as u16).to_le_bytes());
        bytes[6..8].copy_from_slice(&((src >> 32) as u16).to_le_bytes());
        bytes[8..12].copy_from_slice(&(dst as u32).to_le_bytes());
        bytes[12..16].copy_from_slice(&(src as u32).to_le_bytes());
        Self { bytes }
    }

    pub const fn from_bytes(bytes: [u8; DESC_SIZE]) -> Self {
        Self { bytes }
    }

    pub const fn as_bytes(&self) -> &[u8; DESC_SIZE] {
        &self.bytes
    }

    #[inline]
    fn word(&self, at: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[at..at + 4]);
        u32::from_le_bytes(word)
    }

    #[inline]
    fn half(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    pub fn flags_and_size(&self) -> u32 {
        self.word(0)
    }

    pub fn size(&self) -> u32 {
        self.flags_and_size() & SIZE_MASK
    }

    pub fn is_valid(&self) -> bool {
        self.flags_and_size() & FLAG_VALID != 0
    }

    pub fn dst_addr(&self) -> u64 {
        (self.half(4) as u64) << 32 | self.word(8) as u64
    }

    pub fn src_addr(&self) -> u64 {
        (self.half(6) as u64) << 32 | self.word(12) as u64
    }
}

/// Decode a written-back flags word for a job of `requested` bytes.
pub fn write_back_status(flags: u32, requested: u32) -> TransferStatus {
    let done = flags & SIZE_MASK;
    let result = if flags & WB_SUCCESS != 0 {
        TransferResult::Success
    } else if flags & WB_WR_SUCCESS == 0 {
        TransferResult::WriteFailed
    } else {
        TransferResult::ReadFailed
    };

    TransferStatus {
        result,
        residue: requested.saturating_sub(done),
    }
}

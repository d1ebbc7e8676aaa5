//! Interrupt handling.
//!
//! The engine raises a single vector. Status bits are write-1-to-clear;
//! the handler acknowledges exactly what it read before doing any work so
//! that a completion racing with the acknowledge raises a fresh interrupt.

use core::fmt;
use core::sync::atomic::Ordering;

use crate::device::DeviceContext;
use crate::regs::intr_status;

/// Whether an interrupt was raised by this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not ours; nothing was touched.
    None,
    Handled,
}

/// Registered with the platform for the device's vector.
pub trait InterruptHandler: Send + Sync {
    fn handle_irq(&self) -> IrqReturn;
}

/// Decoded interrupt status register.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IrqStatus(pub u16);

impl IrqStatus {
    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn error(self) -> bool {
        self.0 & intr_status::ERROR != 0
    }

    pub fn invalid_descriptor(self) -> bool {
        self.0 & intr_status::INV_DESC != 0
    }

    pub fn descriptor_done(self) -> bool {
        self.0 & intr_status::DESC_DONE != 0
    }

    pub fn abort_done(self) -> bool {
        self.0 & intr_status::ABORT_DONE != 0
    }

    /// Whether ring slots may have been written back.
    pub fn needs_completion(self) -> bool {
        self.descriptor_done() || self.error() || self.invalid_descriptor()
    }
}

impl fmt::Debug for IrqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IrqStatus({:#06x}", self.0)?;
        for (set, name) in [
            (self.error(), "ERROR"),
            (self.invalid_descriptor(), "INV_DESC"),
            (self.descriptor_done(), "DESC_DONE"),
            (self.abort_done(), "ABORT_DONE"),
        ] {
            if set {
                write!(f, " {}", name)?;
            }
        }
        write!(f, ")")
    }
}

impl InterruptHandler for DeviceContext {
    fn handle_irq(&self) -> IrqReturn {
        if self.is_removed() {
            return IrqReturn::None;
        }

        let regs = self.regs();
        let status = IrqStatus(regs.intr_status());
        if status.is_empty() {
            return IrqReturn::None;
        }
        regs.ack_intr_status(status.bits());

        if status.error() {
            self.faults.errors.fetch_add(1, Ordering::Relaxed);
            log::error!("plx-dma: engine reported an error ({:?})", status);
        }
        if status.invalid_descriptor() {
            self.faults.invalid_descriptors.fetch_add(1, Ordering::Relaxed);
            log::error!("plx-dma: engine fetched an invalid descriptor ({:?})", status);
        }
        if status.abort_done() {
            log::debug!("plx-dma: abort done");
        }

        if status.needs_completion() {
            match self.try_process_completions() {
                Some(done) => log::trace!("plx-dma: {} completions", done),
                None => log::trace!("plx-dma: channel busy, completions deferred"),
            }
        }

        IrqReturn::Handled
    }
}

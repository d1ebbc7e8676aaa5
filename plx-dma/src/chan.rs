//! DMA channel lifecycle and submission.
//!
//! # States
//! ```text
//!   Uninitialized ──probe──> Configured ──activate──> Activated
//!                                ^                        │
//!                                │                   deactivate
//!                                │                        v
//!                            (activate) <── Released <── Deactivating
//! ```
//!
//! One channel per device. The ring and the bookkeeping around it live
//! under a single lock shared by submission, completion and teardown.
//! Completion handles always run after that lock is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::Ordering;

use crate::desc::{ADDR_MASK, SIZE_MASK};
use crate::device::{ChannelFaults, DeviceContext};
use crate::error::{PlxError, RingError, Result};
use crate::job::{
    CompletionFn, Cookie, PendingJob, PrepFlags, TransferResult, TransferStatus, TxState,
};
use crate::negotiate::MaxPayload;
use crate::regs::{ctrl, intr_ctrl, Regs};
use crate::ring::DescriptorRing;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    /// Payload negotiated, no ring.
    Configured,
    /// Ring programmed, engine running.
    Activated,
    /// Teardown in progress; submissions are refused.
    Deactivating,
    /// Ring freed. May be activated again.
    Released,
}

/// What the engine is known to be doing with the current ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Engine {
    Idle,
    Running,
    /// A teardown path has claimed the stop.
    Stopping,
    Stopped,
    /// Neither pause nor abort was acknowledged.
    Wedged,
}

pub(crate) struct ChanInner {
    pub state: ChannelState,
    pub engine: Engine,
    pub ring: Option<DescriptorRing>,
    pub next_cookie: Cookie,
    /// Last cookie handed out, `Cookie::NONE` before the first.
    pub last_used: Cookie,
    pub last_completed: Cookie,
}

impl ChanInner {
    pub const fn new() -> Self {
        Self {
            state: ChannelState::Uninitialized,
            engine: Engine::Idle,
            ring: None,
            next_cookie: Cookie::FIRST,
            last_used: Cookie::NONE,
            last_completed: Cookie::NONE,
        }
    }
}

/// Channel lock held from thread context.
///
/// Unlocking runs any reap the interrupt handler deferred while the lock
/// was held.
pub(crate) struct ChanGuard<'a> {
    ctx: &'a DeviceContext,
    inner: ManuallyDrop<spin::MutexGuard<'a, ChanInner>>,
}

impl Deref for ChanGuard<'_> {
    type Target = ChanInner;

    fn deref(&self) -> &ChanInner {
        &self.inner
    }
}

impl DerefMut for ChanGuard<'_> {
    fn deref_mut(&mut self) -> &mut ChanInner {
        &mut self.inner
    }
}

impl Drop for ChanGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: `inner` is not touched again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        self.ctx.run_deferred();
    }
}

type Finished = Vec<(PendingJob, TransferStatus)>;

fn deliver(finished: Finished) {
    for (job, status) in finished {
        if !status.is_success() {
            log::warn!(
                "plx-dma: job {} finished {:?}, residue {}",
                job.cookie(),
                status.result,
                status.residue
            );
        }
        job.complete(status);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COMPLETION AND TEARDOWN
// ═══════════════════════════════════════════════════════════════════════════

impl DeviceContext {
    /// Lock the channel from thread context.
    pub(crate) fn lock_chan(&self) -> ChanGuard<'_> {
        ChanGuard {
            ctx: self,
            inner: ManuallyDrop::new(self.chan.lock()),
        }
    }

    /// Reclaim every written-back slot from the head and run the handles.
    ///
    /// Returns the number of jobs completed.
    pub(crate) fn process_completions(&self) -> usize {
        self.reap_deferred.store(false, Ordering::SeqCst);
        let done = self.reap(self.chan.lock());
        self.run_deferred();
        done
    }

    /// Interrupt-context variant: never spins on the channel lock.
    ///
    /// If the lock is held, the reap is left to the holder, which runs it
    /// when it unlocks. Returns `None` in that case.
    pub(crate) fn try_process_completions(&self) -> Option<usize> {
        if let Some(guard) = self.chan.try_lock() {
            return Some(self.reap(guard));
        }
        self.reap_deferred.store(true, Ordering::SeqCst);

        // The holder may have unlocked before the flag was set.
        let guard = self.chan.try_lock()?;
        self.reap_deferred.store(false, Ordering::SeqCst);
        Some(self.reap(guard))
    }

    /// Run the reaps an interrupt could not do itself.
    ///
    /// Must be called with the channel lock released.
    fn run_deferred(&self) {
        while self.reap_deferred.swap(false, Ordering::SeqCst) {
            let done = self.reap(self.chan.lock());
            log::trace!("plx-dma: {} deferred completions", done);
        }
    }

    fn reap(&self, mut guard: spin::MutexGuard<'_, ChanInner>) -> usize {
        let mut finished = Finished::new();
        let chan = &mut *guard;
        if let Some(ring) = chan.ring.as_mut() {
            while let Some((job, status)) = ring.pop_completed() {
                chan.last_completed = job.cookie();
                finished.push((job, status));
            }
        }
        drop(guard);

        let count = finished.len();
        deliver(finished);
        count
    }

    /// Stop a running engine while the platform still owns the device.
    ///
    /// The channel lock is held across the stop so no submission can
    /// restart the engine; the interrupt handler is already unregistered.
    pub(crate) fn halt_for_removal(&self) {
        let mut chan = self.lock_chan();
        if chan.engine != Engine::Running {
            return;
        }
        chan.engine = self.stop_engine();
        log::info!("plx-dma: engine halted for removal ({:?})", chan.engine);
    }

    /// Stop the engine, abort what it never finished and free the ring.
    ///
    /// The ring is freed only once the engine acknowledged the stop.
    /// Otherwise its memory is leaked.
    fn deactivate(&self) {
        let claimed = {
            let mut chan = self.lock_chan();
            if chan.state != ChannelState::Activated {
                log::warn!("plx-dma: deactivate in state {:?} ignored", chan.state);
                return;
            }
            chan.state = ChannelState::Deactivating;
            let claimed = chan.engine == Engine::Running;
            if claimed {
                chan.engine = Engine::Stopping;
            }
            claimed
        };

        // The poll can be long, so the stop runs unlocked.
        if claimed {
            let engine = self.stop_engine();
            self.lock_chan().engine = engine;
        }

        let mut finished = Finished::new();
        {
            let mut guard = self.lock_chan();
            let chan = &mut *guard;
            if let Some(mut ring) = chan.ring.take() {
                while let Some(entry) = ring.pop_completed() {
                    finished.push(entry);
                }
                while let Some(job) = ring.abort_next() {
                    let status = job.aborted_status();
                    finished.push((job, status));
                }
                if let Some((job, _)) = finished.last() {
                    chan.last_completed = job.cookie();
                }
                if chan.engine == Engine::Wedged {
                    ring.abandon();
                } else if let Err(rejected) = ring.release() {
                    log::error!("plx-dma: ring release refused: {}", rejected.error());
                }
            }
            chan.engine = Engine::Idle;
            chan.state = ChannelState::Released;
        }

        let aborted = finished
            .iter()
            .filter(|(_, s)| s.result == TransferResult::Aborted)
            .count();
        deliver(finished);

        log::info!("plx-dma: channel released ({} jobs aborted)", aborted);
    }

    /// Mask interrupts, stop the engine and clear the ring registers.
    ///
    /// Tries a graceful pause first and falls back to an abort.
    fn stop_engine(&self) -> Engine {
        let regs = self.regs();
        regs.set_intr_ctrl(0);

        let mut engine = Engine::Stopped;
        if regs.ctrl() & !ctrl::GRACEFUL_PAUSE != 0 {
            regs.set_ctrl(ctrl::RESET_VAL | ctrl::GRACEFUL_PAUSE);
            if !self.poll_ctrl(regs, ctrl::GRACEFUL_PAUSE_DONE) {
                log::warn!("plx-dma: Timeout waiting for graceful pause, aborting");
                regs.set_ctrl(ctrl::RESET_VAL | ctrl::ABORT);
                if !self.poll_ctrl(regs, ctrl::ABORT_DONE) {
                    log::error!("plx-dma: engine ignored abort, ring memory will not be freed");
                    engine = Engine::Wedged;
                }
            }

            // Clear the latched status, keep the engine paused.
            regs.set_ctrl(ctrl::RESET_VAL | ctrl::GRACEFUL_PAUSE);
        }

        regs.set_ring(0, 0);
        engine
    }

    fn poll_ctrl(&self, regs: Regs<'_>, done: u16) -> bool {
        for _ in 0..self.config.pause_poll_limit {
            if regs.ctrl() & done != 0 {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ACTIVE CHANNEL
// ═══════════════════════════════════════════════════════════════════════════

/// The channel while it is activated.
///
/// Holds a reference to the device context, so the register window stays
/// mapped even if the device is removed first. Dropping the handle
/// deactivates the channel.
pub struct ActiveChannel {
    ctx: Arc<DeviceContext>,
}

impl ActiveChannel {
    /// Allocate the ring, program it and start the engine.
    ///
    /// On failure the channel stays `Configured` and no reference is taken.
    pub(crate) fn activate(ctx: &Arc<DeviceContext>) -> Result<Self> {
        let mut chan = ctx.lock_chan();
        match chan.state {
            ChannelState::Configured | ChannelState::Released => {}
            ChannelState::Uninitialized => return Err(PlxError::NotActive),
            ChannelState::Activated | ChannelState::Deactivating => {
                return Err(PlxError::ChannelBusy)
            }
        }

        let ring = DescriptorRing::allocate(ctx.config.ring_count, Arc::clone(&ctx.allocator))?;

        let regs = ctx.regs();
        regs.set_ring(ring.bus_addr(), ring.capacity());
        regs.set_prefetch_limit(ctx.config.prefetch_limit);
        regs.set_intr_ctrl(intr_ctrl::ERROR_EN | intr_ctrl::INV_DESC_EN);
        regs.set_ctrl(ctrl::START_VAL);

        log::info!(
            "plx-dma: channel activated, {} descriptors at {:#x}",
            ring.capacity(),
            ring.bus_addr()
        );

        chan.ring = Some(ring);
        chan.engine = Engine::Running;
        chan.state = ChannelState::Activated;
        drop(chan);

        Ok(Self { ctx: Arc::clone(ctx) })
    }

    /// Queue a copy of `len` bytes from `src` to `dst`.
    ///
    /// The engine may pick it up immediately; [`issue_pending`](Self::issue_pending)
    /// makes sure it does.
    pub fn prep_memcpy(
        &self,
        dst: u64,
        src: u64,
        len: u32,
        flags: PrepFlags,
        callback: Option<CompletionFn>,
    ) -> Result<Cookie> {
        if self.ctx.is_removed() {
            return Err(PlxError::DeviceRemoved);
        }
        if len > SIZE_MASK {
            return Err(RingError::TransferTooLarge(len).into());
        }
        for addr in [dst, src] {
            if addr & !ADDR_MASK != 0 {
                return Err(PlxError::AddressOutOfRange(addr));
            }
        }

        let mut chan = self.ctx.lock_chan();
        Self::submit(&mut chan, dst, src, len, flags, callback)
    }

    fn submit(
        chan: &mut ChanInner,
        dst: u64,
        src: u64,
        len: u32,
        flags: PrepFlags,
        callback: Option<CompletionFn>,
    ) -> Result<Cookie> {
        if chan.state != ChannelState::Activated {
            return Err(PlxError::NotActive);
        }
        let ring = chan.ring.as_mut().ok_or(PlxError::NotActive)?;

        let cookie = chan.next_cookie;
        let index = ring.tail();
        ring.fill(
            index,
            src,
            dst,
            len,
            flags.contains(PrepFlags::INTERRUPT),
            PendingJob::new(cookie, len, callback),
        )?;
        chan.last_used = cookie;
        chan.next_cookie = cookie.next();

        Ok(cookie)
    }

    /// Kick the engine.
    pub fn issue_pending(&self) -> Result<()> {
        if self.ctx.is_removed() {
            return Err(PlxError::DeviceRemoved);
        }
        let chan = self.ctx.lock_chan();
        if chan.state != ChannelState::Activated {
            return Err(PlxError::NotActive);
        }
        self.ctx.regs().set_ctrl(ctrl::START_VAL);
        Ok(())
    }

    pub fn tx_status(&self, cookie: Cookie) -> TxState {
        let chan = self.ctx.lock_chan();
        if cookie.is_complete(chan.last_completed, chan.last_used) {
            TxState::Complete
        } else {
            TxState::InProgress
        }
    }

    /// Reap completions without waiting for an interrupt.
    pub fn poll_completions(&self) -> usize {
        self.ctx.process_completions()
    }

    /// Descriptors currently owned by hardware or awaiting reclaim.
    pub fn outstanding(&self) -> u32 {
        self.ctx.lock_chan().ring.as_ref().map_or(0, |r| r.outstanding())
    }

    pub fn capacity(&self) -> u32 {
        self.ctx.lock_chan().ring.as_ref().map_or(0, |r| r.capacity())
    }

    pub fn state(&self) -> ChannelState {
        self.ctx.lock_chan().state
    }

    pub fn max_payload(&self) -> MaxPayload {
        self.ctx.max_payload
    }

    pub fn faults(&self) -> ChannelFaults {
        self.ctx.faults.snapshot()
    }

    /// Deactivate and release the channel's device reference.
    pub fn deactivate(self) {
        drop(self);
    }
}

impl Drop for ActiveChannel {
    fn drop(&mut self) {
        self.ctx.deactivate();
    }
}

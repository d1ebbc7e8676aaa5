//! Pending jobs and their completion results.

use alloc::boxed::Box;
use core::fmt;

/// Identifier handed back for every submitted copy.
///
/// Cookies increase by one per submission starting at 1 and skip 0 when
/// they wrap. Jobs complete in submission order, so completion is decided
/// against the last completed and last issued cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cookie(pub u32);

impl Cookie {
    /// Placeholder before anything was issued or completed.
    pub const NONE: Cookie = Cookie(0);
    /// First cookie a fresh channel hands out.
    pub const FIRST: Cookie = Cookie(1);

    pub(crate) fn next(self) -> Cookie {
        match self.0.wrapping_add(1) {
            0 => Cookie::FIRST,
            n => Cookie(n),
        }
    }

    /// Whether this cookie is done, given the last completed and last
    /// issued cookies of its channel.
    ///
    /// Holds across the wrap: once `last_used` has wrapped past
    /// `last_completed`, the window still in flight is
    /// `(last_completed, MAX] ∪ [FIRST, last_used]`.
    pub fn is_complete(self, last_completed: Cookie, last_used: Cookie) -> bool {
        if last_completed <= last_used {
            self <= last_completed || self > last_used
        } else {
            self <= last_completed && self > last_used
        }
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    /// Engine reported success.
    Success,
    /// Source read failed.
    ReadFailed,
    /// Destination write failed.
    WriteFailed,
    /// Channel was torn down before the engine finished the job.
    Aborted,
}

/// Result delivered to a job's completion handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    pub result: TransferResult,
    /// Bytes the engine did not move.
    pub residue: u32,
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        self.result == TransferResult::Success
    }
}

/// Completion handle: invoked exactly once, never with the ring lock held.
pub type CompletionFn = Box<dyn FnOnce(Cookie, TransferStatus) + Send>;

/// Submission flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepFlags(u32);

impl PrepFlags {
    pub const NONE: PrepFlags = PrepFlags(0);
    /// Raise an interrupt when this copy completes.
    pub const INTERRUPT: PrepFlags = PrepFlags(1 << 0);

    pub const fn contains(self, other: PrepFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for PrepFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        PrepFlags(self.0 | rhs.0)
    }
}

/// Software shadow of one ring slot.
pub struct PendingJob {
    cookie: Cookie,
    len: u32,
    callback: Option<CompletionFn>,
}

impl PendingJob {
    pub fn new(cookie: Cookie, len: u32, callback: Option<CompletionFn>) -> Self {
        Self { cookie, len, callback }
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Requested transfer length.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Consume the job, invoking its completion handle.
    pub fn complete(self, status: TransferStatus) {
        if let Some(callback) = self.callback {
            callback(self.cookie, status);
        }
    }

    /// Status reported for a job that never ran to completion.
    pub fn aborted_status(&self) -> TransferStatus {
        TransferStatus {
            result: TransferResult::Aborted,
            residue: self.len,
        }
    }
}

impl fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingJob")
            .field("cookie", &self.cookie)
            .field("len", &self.len)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Progress of a submitted cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Completed (successfully or not, see the completion handle).
    Complete,
    /// Issued and still owned by hardware.
    InProgress,
}

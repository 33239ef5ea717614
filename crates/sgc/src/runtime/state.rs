//! Thread State Word
//!
//! Every thread control block carries one 32-bit atomic state word:
//!
//! ```text
//!  31        15   14    13    12   11   10   9..6      5    4    3    2    1    0
//! ┌───┬─────┬────┬────┬─────┬─────┬────┬────┬────────┬────┬────┬────┬────┬────┬────┐
//! │REQ│ ... │STK │ GC │ SP  │NAT  │UNP │INT │reasons │TMO │IND │WAIT│RUN │TERM│ALV │
//! └───┴─────┴────┴────┴─────┴─────┴────┴────┴────────┴────┴────┴────┴────┴────┴────┘
//! ```
//!
//! The aggregate request bit is the sign bit, so a poll point is a single
//! "is the word negative" test.

use std::fmt;

/// Snapshot of a thread state word
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ThreadState(u32);

impl ThreadState {
    pub const ALIVE: u32 = 1 << 0;
    pub const TERMINATED: u32 = 1 << 1;
    pub const RUNNABLE: u32 = 1 << 2;
    pub const WAITING: u32 = 1 << 3;
    pub const WAITING_INDEFINITELY: u32 = 1 << 4;
    pub const WAITING_WITH_TIMEOUT: u32 = 1 << 5;
    pub const SLEEPING: u32 = 1 << 6;
    pub const IN_OBJECT_WAIT: u32 = 1 << 7;
    pub const PARKED: u32 = 1 << 8;
    pub const BLOCKED_ON_MONITOR: u32 = 1 << 9;
    pub const INTERRUPTED: u32 = 1 << 10;
    pub const UNPARK: u32 = 1 << 11;
    pub const IN_NATIVE: u32 = 1 << 12;
    pub const IN_SAFEPOINT: u32 = 1 << 13;
    pub const SAFEPOINT_REQUEST_GC: u32 = 1 << 14;
    pub const SAFEPOINT_REQUEST_STACK: u32 = 1 << 15;
    pub const SAFEPOINT_REQUEST: u32 = 1 << 31;

    pub const TIMEOUT_MASK: u32 = Self::WAITING_INDEFINITELY | Self::WAITING_WITH_TIMEOUT;
    pub const WAIT_REASON_MASK: u32 =
        Self::SLEEPING | Self::IN_OBJECT_WAIT | Self::PARKED | Self::BLOCKED_ON_MONITOR;
    /// Everything that only makes sense while WAITING
    pub const WAITING_MASK: u32 = Self::WAITING | Self::TIMEOUT_MASK | Self::WAIT_REASON_MASK;
    pub const REQUEST_REASON_MASK: u32 = Self::SAFEPOINT_REQUEST_GC | Self::SAFEPOINT_REQUEST_STACK;

    const NAMES: [(u32, &'static str); 17] = [
        (Self::ALIVE, "ALIVE"),
        (Self::TERMINATED, "TERMINATED"),
        (Self::RUNNABLE, "RUNNABLE"),
        (Self::WAITING, "WAITING"),
        (Self::WAITING_INDEFINITELY, "WAITING_INDEFINITELY"),
        (Self::WAITING_WITH_TIMEOUT, "WAITING_WITH_TIMEOUT"),
        (Self::SLEEPING, "SLEEPING"),
        (Self::IN_OBJECT_WAIT, "IN_OBJECT_WAIT"),
        (Self::PARKED, "PARKED"),
        (Self::BLOCKED_ON_MONITOR, "BLOCKED_ON_MONITOR"),
        (Self::INTERRUPTED, "INTERRUPTED"),
        (Self::UNPARK, "UNPARK"),
        (Self::IN_NATIVE, "IN_NATIVE"),
        (Self::IN_SAFEPOINT, "IN_SAFEPOINT"),
        (Self::SAFEPOINT_REQUEST_GC, "SAFEPOINT_REQUEST_GC"),
        (Self::SAFEPOINT_REQUEST_STACK, "SAFEPOINT_REQUEST_STACK"),
        (Self::SAFEPOINT_REQUEST, "SAFEPOINT_REQUEST"),
    ];

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if every bit of `mask` is set
    #[inline]
    pub const fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    /// Check if any bit of `mask` is set
    #[inline]
    pub const fn intersects(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    #[inline]
    pub const fn is_alive(self) -> bool {
        self.contains(Self::ALIVE)
    }

    #[inline]
    pub const fn is_terminated(self) -> bool {
        self.contains(Self::TERMINATED)
    }

    #[inline]
    pub const fn is_runnable(self) -> bool {
        self.contains(Self::RUNNABLE)
    }

    #[inline]
    pub const fn is_waiting(self) -> bool {
        self.contains(Self::WAITING)
    }

    #[inline]
    pub const fn in_safepoint(self) -> bool {
        self.contains(Self::IN_SAFEPOINT)
    }

    /// Check the aggregate request bit (the sign bit)
    #[inline]
    pub const fn safepoint_requested(self) -> bool {
        (self.0 as i32) < 0
    }

    /// Outstanding request reason bits
    #[inline]
    pub const fn pending_reasons(self) -> u32 {
        self.0 & Self::REQUEST_REASON_MASK
    }

    /// Check the state word invariants
    ///
    /// - at most one of ALIVE / TERMINATED
    /// - while alive, exactly one of RUNNABLE / WAITING
    /// - timeout flavor and wait reason only while WAITING, one of each at most
    /// - the aggregate request bit set exactly when a reason bit is set
    pub fn is_consistent(self) -> bool {
        if self.contains(Self::ALIVE | Self::TERMINATED) {
            return false;
        }
        let mode = self.0 & (Self::RUNNABLE | Self::WAITING);
        if self.is_alive() && mode.count_ones() != 1 {
            return false;
        }
        if !self.is_waiting() && self.intersects(Self::TIMEOUT_MASK | Self::WAIT_REASON_MASK) {
            return false;
        }
        if (self.0 & Self::TIMEOUT_MASK).count_ones() > 1
            || (self.0 & Self::WAIT_REASON_MASK).count_ones() > 1
        {
            return false;
        }
        self.safepoint_requested() == (self.pending_reasons() != 0)
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ThreadState({})", names.join(" | "))
    }
}

/// Why a safepoint was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafepointReason {
    /// Stop-the-world collection
    Gc,
    /// Capturing the thread's stack
    StackTrace,
}

impl SafepointReason {
    /// Request bit for this reason
    #[inline]
    pub const fn bit(self) -> u32 {
        match self {
            SafepointReason::Gc => ThreadState::SAFEPOINT_REQUEST_GC,
            SafepointReason::StackTrace => ThreadState::SAFEPOINT_REQUEST_STACK,
        }
    }
}

/// Why a thread is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitReason {
    Sleeping,
    ObjectWait,
    Parked,
    BlockedOnMonitor,
}

impl WaitReason {
    #[inline]
    pub const fn bit(self) -> u32 {
        match self {
            WaitReason::Sleeping => ThreadState::SLEEPING,
            WaitReason::ObjectWait => ThreadState::IN_OBJECT_WAIT,
            WaitReason::Parked => ThreadState::PARKED,
            WaitReason::BlockedOnMonitor => ThreadState::BLOCKED_ON_MONITOR,
        }
    }
}

// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Futex backed bit flags used to signal message queue readiness between
//! threads without taking a lock.

use std::{
    ptr,
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use nix::errno::Errno;
use thiserror::Error as ThisError;

/// Set by the producer once a message queue has data to read.
pub const NOT_EMPTY: u32 = 1 << 0;
/// Set by the consumer once a message queue has room for more data.
pub const NOT_FULL: u32 = 1 << 1;

/// Longest single futex sleep, `wait()` loops for longer timeouts.
const MAX_FUTEX_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("Empty event flag mask")]
    EmptyMask,
    #[error("Failed to wait on event flag: {0}")]
    Wait(Errno),
    #[error("Failed to wake event flag waiters: {0}")]
    Wake(Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A 32-bit word of event bits.
///
/// [`wake`](Self::wake) sets bits and wakes every waiter, [`wait`](Self::wait)
/// blocks until one of the requested bits is set and consumes it.
#[derive(Debug, Default)]
pub struct EventFlag {
    bits: AtomicU32,
}

impl EventFlag {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    pub fn wake(&self, bits: u32) -> Result<()> {
        if bits == 0 {
            return Err(Error::EmptyMask);
        }
        self.bits.fetch_or(bits, Ordering::Release);
        self.futex_wake()
    }

    /// Wait up to `timeout` for any bit of `mask`. Returns the bits which were
    /// set and cleared, or `0` on timeout.
    pub fn wait(&self, mask: u32, timeout: Duration) -> Result<u32> {
        if mask == 0 {
            return Err(Error::EmptyMask);
        }
        // No deadline if it can not be represented.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let current = self.bits.load(Ordering::Acquire);
            if current & mask != 0 {
                let taken = self.bits.fetch_and(!mask, Ordering::AcqRel) & mask;
                if taken != 0 {
                    return Ok(taken);
                }
                continue;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return Ok(0);
            }
            match self.futex_wait(current, remaining) {
                Ok(()) | Err(Errno::EAGAIN | Errno::EINTR | Errno::ETIMEDOUT) => {}
                Err(err) => return Err(Error::Wait(err)),
            }
        }
    }

    fn futex_wait(&self, expected: u32, timeout: Duration) -> std::result::Result<(), Errno> {
        let timeout = timeout.min(MAX_FUTEX_TIMEOUT);
        let timeout = libc::timespec {
            tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
            tv_nsec: timeout.subsec_nanos().into(),
        };
        // SAFETY: `bits` is a valid, aligned 32-bit word for the lifetime of
        // `self` and `timeout` outlives the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.bits.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ptr::addr_of!(timeout),
                ptr::null::<u32>(),
                0u32,
            )
        };
        Errno::result(ret).map(drop)
    }

    fn futex_wake(&self) -> Result<()> {
        // SAFETY: see futex_wait().
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.bits.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                0u32,
            )
        };
        Errno::result(ret).map(drop).map_err(Error::Wake)
    }
}

// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Naming and scheduling helpers applied by a worker thread to itself.

use std::ffi::{CString, NulError};

use nix::{
    errno::Errno,
    sys::prctl,
    unistd::{self, Pid},
};
use thiserror::Error as ThisError;

/// Nice value which leaves the scheduling of the thread untouched.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Nice value used by threads doing audio processing.
pub const PRIORITY_AUDIO: i32 = -16;
/// Nice value used by threads feeding the audio hardware directly.
pub const PRIORITY_URGENT_AUDIO: i32 = -19;

/// Longest thread name the kernel keeps, without the trailing NUL.
pub const MAX_THREAD_NAME_LEN: usize = 15;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("Failed to set thread name: {0}")]
    InvalidName(NulError),
    #[error("Failed to set thread name: {0}")]
    SetName(Errno),
    #[error("Failed to set thread priority: {0}")]
    SetPriority(Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Cut `name` down to [`MAX_THREAD_NAME_LEN`] bytes without splitting a
/// character.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_THREAD_NAME_LEN {
        return name;
    }
    let mut end = MAX_THREAD_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Set the OS-level name of the calling thread.
pub fn set_current_thread_name(name: &str) -> Result<()> {
    let name = CString::new(truncate_name(name)).map_err(Error::InvalidName)?;
    prctl::set_name(&name).map_err(Error::SetName)
}

/// Set the nice value of the calling thread.
pub fn set_current_thread_priority(priority: i32) -> Result<()> {
    // SAFETY: setpriority() only reads its scalar arguments. A `who` of 0 with
    // PRIO_PROCESS targets the calling thread on Linux.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
    Errno::result(ret).map(drop).map_err(Error::SetPriority)
}

/// Kernel thread id of the calling thread.
pub fn current_thread_id() -> Pid {
    unistd::gettid()
}

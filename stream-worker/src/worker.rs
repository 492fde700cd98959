// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Binding of a [`StreamLogic`] to its [`ThreadController`].

use std::{fmt, ops::Deref};

use nix::unistd::Pid;

use crate::controller::{ThreadController, WorkerConfig, WorkerState};

/// Outcome of one [`StreamLogic::cycle`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Keep looping.
    Continue,
    /// Stop the worker and record an error.
    Abort,
    /// Stop the worker, this is not an error.
    Exit,
}

/// Subsystem specific work driven by a [`StreamWorker`].
///
/// `init()` and `cycle()` are only ever called on the worker thread and must not
/// call back into the controller. `cycle()` is expected to return promptly: a
/// cycle that never returns makes `stop()` hang.
pub trait StreamLogic: Send + 'static {
    /// Domain API which stays reachable from the driving thread while the
    /// logic itself is owned by the worker thread. Usually an `Arc` over
    /// atomics.
    type Handle;

    fn handle(&self) -> Self::Handle;

    /// Called once on the worker thread before the first cycle. The error
    /// string is reported by [`StreamWorker::error`].
    fn init(&mut self) -> Result<(), String>;

    fn cycle(&mut self) -> WorkerStatus;
}

/// A [`StreamLogic`] together with the thread running it.
///
/// Derefs to the logic's [`StreamLogic::Handle`], so callers use one object for
/// both the domain API and the lifecycle controls. Dropping the worker stops
/// and joins the thread before the logic is released.
pub struct StreamWorker<L: StreamLogic> {
    handle: L::Handle,
    controller: ThreadController<L>,
}

impl<L: StreamLogic> fmt::Debug for StreamWorker<L> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct(stringify!(StreamWorker))
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl<L: StreamLogic> StreamWorker<L> {
    pub fn new(logic: L) -> Self {
        Self::with_config(logic, WorkerConfig::default())
    }

    pub fn with_config(logic: L, config: WorkerConfig) -> Self {
        Self {
            handle: logic.handle(),
            controller: ThreadController::new(logic, config),
        }
    }

    pub fn start(&mut self, name: &str, priority: i32) -> bool {
        self.controller.start(name, priority)
    }

    pub fn pause(&self) -> WorkerState {
        self.controller.pause()
    }

    pub fn resume(&self) -> WorkerState {
        self.controller.resume()
    }

    pub fn wait_for_at_least_one_cycle(&self) -> bool {
        self.controller.wait_for_at_least_one_cycle()
    }

    pub fn stop(&mut self) {
        self.controller.stop();
    }

    pub fn join(&mut self) {
        self.controller.join();
    }

    pub fn has_error(&self) -> bool {
        self.controller.has_error()
    }

    pub fn error(&self) -> String {
        self.controller.error()
    }

    pub fn tid(&self) -> Option<Pid> {
        self.controller.tid()
    }

    pub fn state(&self) -> WorkerState {
        self.controller.state()
    }
}

impl<L: StreamLogic> Deref for StreamWorker<L> {
    type Target = L::Handle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<L: StreamLogic> Drop for StreamWorker<L> {
    fn drop(&mut self) {
        self.controller.stop();
    }
}

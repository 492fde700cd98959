// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Lifecycle control of the dedicated thread running a [`StreamLogic`].
//!
//! The worker thread calls [`StreamLogic::cycle`] back to back. The driving
//! thread talks to it through a mutex protected [`WorkerState`] and a lock-free
//! "state change requested" flag. As long as the flag is clear the worker never
//! touches the mutex, so a low priority driving thread holding the lock can not
//! stall a real-time worker.
//!
//! Pause and resume are synchronous round trips:
//!
//! ```text
//!   driving thread                          worker thread
//!   --------------                          -------------
//!   pause():
//!     lock, RUNNING -> PAUSE_REQUESTED
//!     set flag, wait on cv                  cycle() completes
//!                                           flag set: lock, -> PAUSED
//!                                           clear flag, notify
//!     wakes up, returns PAUSED              yields until the flag is set
//!   resume():
//!     lock, PAUSED -> RESUME_REQUESTED
//!     set flag, wait on cv                  flag set: lock, -> RUNNING
//!                                           (no notification yet)
//!                                           cycle() completes
//!                                           lock, clear flag, notify
//!     wakes up, returns RUNNING
//! ```
//!
//! Memory ordering: the flag is only set while the state mutex is held, with
//! `Release`, and the worker loads it with `Acquire` before deciding to lock.
//! The worker clears it under the mutex right before notifying, and the driving
//! thread keeps waiting while it is set. A transition is therefore never
//! reported before the worker acknowledged it, spurious wakeups included.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle, ThreadId},
};

#[cfg(test)]
use std::sync::atomic::AtomicUsize;

use log::{error, trace, warn};
use nix::unistd::Pid;

use crate::{
    thread_setup::{self, PRIORITY_DEFAULT},
    worker::{StreamLogic, WorkerStatus},
};

/// Error recorded when [`StreamLogic::cycle`] returns [`WorkerStatus::Abort`].
pub const ABORT_ERROR: &str = "Received ABORT from the logic cycle";
/// Error recorded when the worker thread unwinds.
pub const PANIC_ERROR: &str = "Worker thread panicked";
const SPAWN_ERROR: &str = "Failed to spawn worker thread";
const INIT_ERROR: &str = "Logic init failed";

/// State of the worker thread.
///
/// ```text
/// INITIAL -> RUNNING -> PAUSE_REQUESTED -> PAUSED -> RESUME_REQUESTED -> RUNNING
///
/// any state -> STOPPED (terminal until the next start())
/// ```
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Initial,
    Running,
    PauseRequested,
    Paused,
    ResumeRequested,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Running => "running",
            Self::PauseRequested => "pause_requested",
            Self::Paused => "paused",
            Self::ResumeRequested => "resume_requested",
            Self::Stopped => "stopped",
        };
        fmt.write_str(name)
    }
}

/// What to do when the worker can not name itself or set its priority.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SetupErrorPolicy {
    /// Record the failure and stop before calling [`StreamLogic::init`].
    #[default]
    Fatal,
    /// Log the failure and carry on. It only ends up in the error string when
    /// `init()` fails as well.
    Cosmetic,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
/// Knobs of a [`ThreadController`].
pub struct WorkerConfig {
    setup_error_policy: SetupErrorPolicy,
    run_synchronously: bool,
}

impl WorkerConfig {
    pub const fn with_setup_error_policy(mut self, policy: SetupErrorPolicy) -> Self {
        self.setup_error_policy = policy;
        self
    }

    /// Run the whole worker loop on the thread calling `start()`.
    ///
    /// Only meant for tests with a logic that finishes on its own: it
    /// reproduces a worker completing before the starter waits for it.
    pub const fn with_synchronous_start(mut self, run_synchronously: bool) -> Self {
        self.run_synchronously = run_synchronously;
        self
    }

    pub const fn setup_error_policy(&self) -> SetupErrorPolicy {
        self.setup_error_policy
    }

    pub const fn runs_synchronously(&self) -> bool {
        self.run_synchronously
    }
}

#[derive(Debug, Default)]
struct WorkerInfo {
    state: WorkerState,
    error: String,
    tid: Option<Pid>,
    thread_id: Option<ThreadId>,
}

#[derive(Debug, Default)]
struct Shared {
    info: Mutex<WorkerInfo>,
    cv: Condvar,
    state_change_requested: AtomicBool,
    #[cfg(test)]
    lock_count: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkerInfo> {
        #[cfg(test)]
        self.lock_count.fetch_add(1, Ordering::Relaxed);
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_state_change(&self) {
        self.state_change_requested.store(true, Ordering::Release);
    }

    fn state_change_requested(&self) -> bool {
        self.state_change_requested.load(Ordering::Acquire)
    }

    /// Clear the request and wake the driving thread. Takes the guard so the
    /// flag can not be cleared between the driver's check and its wait.
    fn acknowledge(&self, guard: MutexGuard<'_, WorkerInfo>) {
        self.state_change_requested.store(false, Ordering::Release);
        drop(guard);
        self.cv.notify_one();
    }
}

/// Marks the worker as failed if its thread unwinds, so nobody waits on it
/// forever.
struct PanicGuard<'a>(&'a Shared);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let mut info = self.0.lock();
            info.state = WorkerState::Stopped;
            info.error = PANIC_ERROR.to_string();
            self.0.acknowledge(info);
        }
    }
}

struct ThreadSetup {
    name: String,
    priority: i32,
    policy: SetupErrorPolicy,
}

impl ThreadSetup {
    fn apply(&self) -> String {
        let mut errors = Vec::new();
        if !self.name.is_empty() {
            if let Err(err) = thread_setup::set_current_thread_name(&self.name) {
                errors.push(err.to_string());
            }
        }
        let keep_going = errors.is_empty() || self.policy == SetupErrorPolicy::Cosmetic;
        if keep_going && self.priority != PRIORITY_DEFAULT {
            if let Err(err) = thread_setup::set_current_thread_priority(self.priority) {
                errors.push(err.to_string());
            }
        }
        errors.join("; ")
    }
}

fn init_logic<L: StreamLogic>(logic: &mut L, setup: &ThreadSetup) -> String {
    let setup_error = setup.apply();
    if !setup_error.is_empty() {
        match setup.policy {
            SetupErrorPolicy::Fatal => return setup_error,
            SetupErrorPolicy::Cosmetic => warn!("worker {:?}: {}", setup.name, setup_error),
        }
    }
    match logic.init() {
        Ok(()) => String::new(),
        Err(err) => {
            let err = if err.is_empty() {
                INIT_ERROR.to_string()
            } else {
                err
            };
            if setup_error.is_empty() {
                err
            } else {
                format!("{setup_error}; {err}")
            }
        }
    }
}

fn worker_thread<L: StreamLogic>(shared: &Shared, logic: &mut L, setup: &ThreadSetup) {
    let _guard = PanicGuard(shared);

    let error = init_logic(logic, setup);
    {
        let mut info = shared.lock();
        info.tid = Some(thread_setup::current_thread_id());
        info.thread_id = Some(thread::current().id());
        info.state = if error.is_empty() {
            WorkerState::Running
        } else {
            WorkerState::Stopped
        };
        info.error.clone_from(&error);
    }
    shared.cv.notify_one();
    if !error.is_empty() {
        error!("worker {:?} failed to start: {}", setup.name, error);
        return;
    }
    trace!("worker {:?} running", setup.name);

    // `state` mirrors the shared state as seen by this thread. It holds
    // ResumeRequested for exactly one cycle after a resume was accepted, which
    // defers the notification until that cycle completed.
    let mut state = WorkerState::Running;
    while state != WorkerState::Stopped {
        let status = if state == WorkerState::Paused {
            thread::yield_now();
            WorkerStatus::Continue
        } else {
            logic.cycle()
        };

        if status != WorkerStatus::Continue {
            let mut info = shared.lock();
            let notify = state == WorkerState::ResumeRequested || shared.state_change_requested();
            info.state = WorkerState::Stopped;
            state = WorkerState::Stopped;
            if status == WorkerStatus::Abort {
                info.error = ABORT_ERROR.to_string();
                error!("worker {:?}: {}", setup.name, ABORT_ERROR);
            } else {
                trace!("worker {:?} exited", setup.name);
            }
            if notify {
                shared.acknowledge(info);
            }
            continue;
        }

        let mut notify = false;
        if state == WorkerState::ResumeRequested {
            state = WorkerState::Running;
            notify = true;
        }
        if shared.state_change_requested() {
            let mut info = shared.lock();
            match info.state {
                WorkerState::PauseRequested => {
                    info.state = WorkerState::Paused;
                    state = WorkerState::Paused;
                    notify = true;
                }
                WorkerState::ResumeRequested => {
                    info.state = WorkerState::Running;
                    state = WorkerState::ResumeRequested;
                }
                WorkerState::Stopped => state = WorkerState::Stopped,
                _ => {}
            }
            trace!("worker {:?} now {}", setup.name, info.state);
            if notify {
                shared.acknowledge(info);
            }
        } else if notify {
            shared.acknowledge(shared.lock());
        }
    }
}

/// Owns the worker thread of one [`StreamLogic`].
///
/// The logic is moved into the worker thread by [`start`](Self::start) and
/// handed back by [`join`](Self::join), so it is never touched by two threads
/// and never outlives its thread.
pub struct ThreadController<L: StreamLogic> {
    shared: Arc<Shared>,
    config: WorkerConfig,
    logic: Option<L>,
    worker: Option<JoinHandle<L>>,
}

impl<L: StreamLogic> fmt::Debug for ThreadController<L> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct(stringify!(ThreadController))
            .field("config", &self.config)
            .field("has_logic", &self.logic.is_some())
            .field("has_worker", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl<L: StreamLogic> ThreadController<L> {
    pub fn new(logic: L, config: WorkerConfig) -> Self {
        Self {
            shared: Arc::default(),
            config,
            logic: Some(logic),
            worker: None,
        }
    }

    /// Spawn the worker thread and wait until it either runs or failed.
    ///
    /// `priority` is a nice value, see
    /// [`PRIORITY_DEFAULT`](crate::thread_setup::PRIORITY_DEFAULT). Returns
    /// `true` when no error was recorded.
    pub fn start(&mut self, name: &str, priority: i32) -> bool {
        if self.worker.is_some() {
            warn!("worker {:?} is already started", name);
            return false;
        }
        let Some(mut logic) = self.logic.take() else {
            error!("worker {:?} can not be restarted: its logic was lost", name);
            return false;
        };
        {
            let mut info = self.shared.lock();
            *info = WorkerInfo::default();
            self.shared
                .state_change_requested
                .store(false, Ordering::Release);
        }

        let setup = ThreadSetup {
            name: name.to_string(),
            priority,
            policy: self.config.setup_error_policy(),
        };
        if self.config.runs_synchronously() {
            worker_thread(&self.shared, &mut logic, &setup);
            self.logic = Some(logic);
        } else {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new().spawn(move || {
                worker_thread(&shared, &mut logic, &setup);
                logic
            });
            match spawned {
                Ok(handle) => self.worker = Some(handle),
                Err(err) => {
                    error!("worker {:?}: {}: {}", name, SPAWN_ERROR, err);
                    let mut info = self.shared.lock();
                    info.state = WorkerState::Stopped;
                    info.error = format!("{SPAWN_ERROR}: {err}");
                    return false;
                }
            }
        }

        let info = self
            .shared
            .cv
            .wait_while(self.shared.lock(), |info| info.state == WorkerState::Initial)
            .unwrap_or_else(PoisonError::into_inner);
        info.error.is_empty()
    }

    /// Ask a running worker to pause. Returns once the worker finished its
    /// current cycle and entered [`WorkerState::Paused`]. In any other state
    /// nothing happens and the current state is returned.
    pub fn pause(&self) -> WorkerState {
        self.switch_worker_state_sync(WorkerState::Running, WorkerState::PauseRequested)
    }

    /// Ask a paused worker to resume. Returns once at least one cycle
    /// completed after the worker left [`WorkerState::Paused`].
    pub fn resume(&self) -> WorkerState {
        self.switch_worker_state_sync(WorkerState::Paused, WorkerState::ResumeRequested)
    }

    /// Returns `true` if at least one full cycle ran during the call.
    pub fn wait_for_at_least_one_cycle(&self) -> bool {
        self.pause() == WorkerState::Paused && self.resume() == WorkerState::Running
    }

    /// Request the worker to stop and join it. A cycle in progress is allowed
    /// to finish.
    pub fn stop(&mut self) {
        {
            let mut info = self.shared.lock();
            if info.state != WorkerState::Stopped {
                info.state = WorkerState::Stopped;
                self.shared.request_state_change();
            }
        }
        self.join();
    }

    /// Wait for the worker thread to terminate. Without a prior
    /// [`stop`](Self::stop) this only returns if the logic ends the loop itself.
    pub fn join(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(logic) => self.logic = Some(logic),
            Err(_) => {
                error!("{}", PANIC_ERROR);
                let mut info = self.shared.lock();
                info.state = WorkerState::Stopped;
                info.error = PANIC_ERROR.to_string();
            }
        }
    }

    pub fn has_error(&self) -> bool {
        !self.shared.lock().error.is_empty()
    }

    pub fn error(&self) -> String {
        self.shared.lock().error.clone()
    }

    /// Kernel thread id of the worker, once it started.
    pub fn tid(&self) -> Option<Pid> {
        self.shared.lock().tid
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lock().state
    }

    fn switch_worker_state_sync(&self, old: WorkerState, new: WorkerState) -> WorkerState {
        let mut info = self.shared.lock();
        if info.state != old {
            trace!("ignoring request for {} in state {}", new, info.state);
            return info.state;
        }
        if info.thread_id == Some(thread::current().id()) {
            warn!("{} requested from the worker thread itself, ignoring", new);
            return info.state;
        }
        info.state = new;
        self.shared.request_state_change();
        let info = self
            .shared
            .cv
            .wait_while(info, |info| {
                info.state == new || self.shared.state_change_requested()
            })
            .unwrap_or_else(PoisonError::into_inner);
        info.state
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.shared.lock_count.load(Ordering::Relaxed)
    }
}

impl<L: StreamLogic> Drop for ThreadController<L> {
    fn drop(&mut self) {
        self.stop();
    }
}

// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use crate::worker::{StreamLogic, WorkerStatus};

/// Upper bound for anything a test polls for.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            return false;
        }
        sleep(Duration::from_millis(1));
    }
    true
}

const NO_OVERRIDE: u8 = 0;
const OVERRIDE_ABORT: u8 = 1;
const OVERRIDE_EXIT: u8 = 2;

/// Driving-thread view of a [`CountingLogic`].
#[derive(Clone, Debug, Default)]
pub struct Probe {
    cycles: Arc<AtomicUsize>,
    inits: Arc<AtomicUsize>,
    next_status: Arc<AtomicU8>,
}

impl Probe {
    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    /// Make the next cycle return `status` instead of continuing.
    pub fn set_next_status(&self, status: WorkerStatus) {
        let value = match status {
            WorkerStatus::Continue => NO_OVERRIDE,
            WorkerStatus::Abort => OVERRIDE_ABORT,
            WorkerStatus::Exit => OVERRIDE_EXIT,
        };
        self.next_status.store(value, Ordering::SeqCst);
    }
}

/// Counts its cycles and optionally fails in a scripted way.
#[derive(Debug, Default)]
pub struct CountingLogic {
    probe: Probe,
    init_error: Option<String>,
    finish_at: Option<(usize, WorkerStatus)>,
    panic_at: Option<usize>,
    cycle_delay: Duration,
    cycles_since_init: usize,
}

impl CountingLogic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_init_error(mut self, error: &str) -> Self {
        self.init_error = Some(error.to_string());
        self
    }

    /// Return `status` from the `cycle`-th cycle after each init.
    pub fn finishing_at(mut self, cycle: usize, status: WorkerStatus) -> Self {
        self.finish_at = Some((cycle, status));
        self
    }

    pub fn panicking_at(mut self, cycle: usize) -> Self {
        self.panic_at = Some(cycle);
        self
    }

    pub fn with_cycle_delay(mut self, delay: Duration) -> Self {
        self.cycle_delay = delay;
        self
    }
}

impl StreamLogic for CountingLogic {
    type Handle = Probe;

    fn handle(&self) -> Probe {
        self.probe.clone()
    }

    fn init(&mut self) -> Result<(), String> {
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        self.cycles_since_init = 0;
        match &self.init_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn cycle(&mut self) -> WorkerStatus {
        if !self.cycle_delay.is_zero() {
            sleep(self.cycle_delay);
        }
        self.cycles_since_init += 1;
        self.probe.cycles.fetch_add(1, Ordering::SeqCst);
        if self.panic_at == Some(self.cycles_since_init) {
            panic!("scripted panic in cycle {}", self.cycles_since_init);
        }
        match self.probe.next_status.swap(NO_OVERRIDE, Ordering::SeqCst) {
            OVERRIDE_ABORT => return WorkerStatus::Abort,
            OVERRIDE_EXIT => return WorkerStatus::Exit,
            _ => {}
        }
        match self.finish_at {
            Some((at, status)) if self.cycles_since_init >= at => status,
            _ => WorkerStatus::Continue,
        }
    }
}

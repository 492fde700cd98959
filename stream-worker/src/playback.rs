// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Playback of silence into a null sink, used to exercise both threading
//! models end to end.

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use log::{error, trace};

use crate::{
    worker::{StreamLogic, WorkerStatus},
    write_thread::{OutputDriver, PresentationPosition},
};

/// Bytes per frame: stereo, 16-bit samples.
pub const FRAME_SIZE: u32 = 4;
pub const SAMPLE_RATE: u32 = 48000;

/// Number of frames played at [`SAMPLE_RATE`] during `period`.
pub fn frames_per_period(period: Duration) -> u32 {
    let frames = period.as_micros() * u128::from(SAMPLE_RATE) / 1_000_000;
    u32::try_from(frames).unwrap_or(u32::MAX).max(1)
}

/// Discards everything written to it.
#[derive(Debug)]
pub struct NullOutput {
    frame_size: u32,
    latency_ms: u32,
    frames_written: u64,
    started: Instant,
}

impl NullOutput {
    pub fn new(frame_size: u32, latency_ms: u32) -> Self {
        Self {
            frame_size,
            latency_ms,
            frames_written: 0,
            started: Instant::now(),
        }
    }

    pub const fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl OutputDriver for NullOutput {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        if self.frame_size == 0 || buffer.len() % self.frame_size as usize != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.frames_written += (buffer.len() / self.frame_size as usize) as u64;
        trace!("NullOutput write {} bytes", buffer.len());
        Ok(buffer.len())
    }

    fn presentation_position(&mut self) -> io::Result<PresentationPosition> {
        Ok(PresentationPosition {
            frames: self.frames_written,
            timestamp: self.started.elapsed(),
        })
    }

    fn latency_ms(&self) -> u32 {
        self.latency_ms
    }
}

/// Counters of a [`PlaybackLogic`], readable from the driving thread.
#[derive(Debug, Default)]
pub struct PlaybackStats {
    cycles: AtomicU64,
    frames: AtomicU64,
}

impl PlaybackStats {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Writes one period of silence per cycle.
pub struct PlaybackLogic<D: OutputDriver> {
    driver: D,
    period: Duration,
    max_cycles: u64,
    silence: Vec<u8>,
    stats: Arc<PlaybackStats>,
}

impl<D: OutputDriver> PlaybackLogic<D> {
    /// Exit after `max_cycles` cycles.
    pub fn new(driver: D, period: Duration, max_cycles: u64) -> Self {
        Self {
            driver,
            period,
            max_cycles,
            silence: Vec::new(),
            stats: Arc::default(),
        }
    }
}

impl<D: OutputDriver> StreamLogic for PlaybackLogic<D> {
    type Handle = Arc<PlaybackStats>;

    fn handle(&self) -> Self::Handle {
        self.stats.clone()
    }

    fn init(&mut self) -> Result<(), String> {
        if self.max_cycles == 0 {
            return Err("Playback needs at least one cycle".to_string());
        }
        let bytes = frames_per_period(self.period) as usize * FRAME_SIZE as usize;
        self.silence = vec![0; bytes];
        self.stats.cycles.store(0, Ordering::Relaxed);
        self.stats.frames.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn cycle(&mut self) -> WorkerStatus {
        // Stands in for waiting on the hardware.
        sleep(self.period);
        match self.driver.write(&self.silence) {
            Ok(written) => {
                self.stats
                    .frames
                    .fetch_add((written / FRAME_SIZE as usize) as u64, Ordering::Relaxed);
            }
            Err(err) => {
                error!("playback write failed: {}", err);
                return WorkerStatus::Abort;
            }
        }
        let cycles = self.stats.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if cycles >= self.max_cycles {
            WorkerStatus::Exit
        } else {
            WorkerStatus::Continue
        }
    }
}

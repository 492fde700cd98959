// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//
#![deny(
    /* groups */
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::style,
    clippy::nursery,
    //* restriction */
    clippy::dbg_macro,
    clippy::rc_buffer,
    clippy::as_underscore,
    clippy::assertions_on_result_states,
    //* pedantic */
    clippy::cast_possible_wrap,
    clippy::ptr_as_ptr,
    clippy::bool_to_int_with_if,
    clippy::borrow_as_ptr,
    clippy::cast_ptr_alignment,
)]
#![allow(
    clippy::significant_drop_in_scrutinee,
    clippy::significant_drop_tightening
)]

pub mod args;
pub mod controller;
pub mod event_flag;
pub mod playback;
pub mod thread_setup;
pub mod worker;
pub mod write_thread;

#[cfg(test)]
pub(crate) mod test_utils;

use std::{convert::TryFrom, thread::sleep, time::Duration};

pub use args::WorkerMode;
pub use controller::{SetupErrorPolicy, ThreadController, WorkerConfig, WorkerState};
use log::{debug, info};
use thiserror::Error as ThisError;
pub use worker::{StreamLogic, StreamWorker, WorkerStatus};
pub use write_thread::{OutputDriver, StreamOut, WriteClient};

use crate::{
    args::StreamArgs,
    playback::{frames_per_period, NullOutput, PlaybackLogic, FRAME_SIZE},
    write_thread::{WriteCommand, WriteReply, WriteResult},
};

/// Latency reported by the null sink.
const NULL_OUTPUT_LATENCY_MS: u32 = 20;
/// How long the legacy client waits for the writer to answer a command.
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

pub type Result<T> = std::result::Result<T, Error>;

/// Custom error types
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Stream name must not be empty")]
    EmptyName,
    #[error("Period must be at least one millisecond")]
    ZeroPeriod,
    #[error("Number of cycles must be at least one")]
    ZeroCycles,
    #[error("Stream worker failed: {0}")]
    WorkerFailed(String),
    #[error("Failed to prepare for writing: {0}")]
    PrepareFailed(write_thread::Error),
    #[error("Writer client error: {0}")]
    Writer(write_thread::Error),
    #[error("Writer reported {0:?}")]
    WriteFailed(WriteResult),
    #[error("Writer did not answer within {0:?}")]
    StatusTimeout(Duration),
}

impl From<write_thread::Error> for Error {
    fn from(val: write_thread::Error) -> Self {
        Self::Writer(val)
    }
}

/// Validated settings of a demo stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfiguration {
    name: String,
    priority: i32,
    period: Duration,
    cycles: u64,
    mode: WorkerMode,
}

impl StreamConfiguration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn priority(&self) -> i32 {
        self.priority
    }

    pub const fn period(&self) -> Duration {
        self.period
    }

    pub const fn cycles(&self) -> u64 {
        self.cycles
    }

    pub const fn mode(&self) -> WorkerMode {
        self.mode
    }
}

impl TryFrom<StreamArgs> for StreamConfiguration {
    type Error = Error;

    fn try_from(args: StreamArgs) -> Result<Self> {
        if args.name.is_empty() {
            return Err(Error::EmptyName);
        }
        if args.period_ms == 0 {
            return Err(Error::ZeroPeriod);
        }
        if args.cycles == 0 {
            return Err(Error::ZeroCycles);
        }
        Ok(Self {
            name: args.name,
            priority: args.priority,
            period: Duration::from_millis(args.period_ms),
            cycles: args.cycles,
            mode: args.mode,
        })
    }
}

/// Play `config.cycles()` periods of silence into a null sink. Returns the
/// number of frames played.
pub fn run_stream(config: &StreamConfiguration) -> Result<u64> {
    match config.mode() {
        WorkerMode::Controller => run_controller(config),
        WorkerMode::Legacy => run_legacy(config),
    }
}

fn run_controller(config: &StreamConfiguration) -> Result<u64> {
    let logic = PlaybackLogic::new(
        NullOutput::new(FRAME_SIZE, NULL_OUTPUT_LATENCY_MS),
        config.period(),
        config.cycles(),
    );
    // Raising the priority needs CAP_SYS_NICE, the demo runs without it.
    let worker_config =
        WorkerConfig::default().with_setup_error_policy(SetupErrorPolicy::Cosmetic);
    let mut worker = StreamWorker::with_config(logic, worker_config);

    if !worker.start(config.name(), config.priority()) {
        return Err(Error::WorkerFailed(worker.error()));
    }
    info!("stream {:?} running on tid {:?}", config.name(), worker.tid());
    if worker.wait_for_at_least_one_cycle() {
        debug!("stream {:?} completed a cycle", config.name());
    }

    worker.join();
    if worker.has_error() {
        return Err(Error::WorkerFailed(worker.error()));
    }
    info!(
        "stream {:?} played {} frames in {} cycles",
        config.name(),
        worker.frames(),
        worker.cycles()
    );
    Ok(worker.frames())
}

fn run_legacy(config: &StreamConfiguration) -> Result<u64> {
    let frames_count = frames_per_period(config.period());
    let mut stream = StreamOut::new(NullOutput::new(FRAME_SIZE, NULL_OUTPUT_LATENCY_MS));
    let mut client = stream
        .prepare_for_writing(FRAME_SIZE, frames_count)
        .map_err(Error::PrepareFailed)?;
    info!(
        "stream {:?} writing on tid {}",
        config.name(),
        client.thread_info.tid
    );

    let silence = vec![0u8; frames_count as usize * FRAME_SIZE as usize];
    let mut played = 0;
    for _ in 0..config.cycles() {
        sleep(config.period());
        client.write(&silence)?;
        let status = client
            .wait_status(STATUS_TIMEOUT)?
            .ok_or(Error::StatusTimeout(STATUS_TIMEOUT))?;
        if status.retval != WriteResult::Ok {
            return Err(Error::WriteFailed(status.retval));
        }
        if let WriteReply::Written(bytes) = status.reply {
            played += bytes / u64::from(FRAME_SIZE);
        }
    }

    client.send(WriteCommand::GetPresentationPosition)?;
    if let Some(status) = client.wait_status(STATUS_TIMEOUT)? {
        debug!("stream {:?} position {:?}", config.name(), status.reply);
    }
    stream.close();
    info!("stream {:?} played {} frames", config.name(), played);
    Ok(played)
}

#[cfg(test)]
pub(crate) fn init_logger() {
    std::env::set_var("RUST_LOG", "trace");
    let _ = env_logger::builder().is_test(true).try_init();
}

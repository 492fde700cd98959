// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! An arguments type for the binary interface of this library.

use clap::{Parser, ValueEnum};

use crate::thread_setup::PRIORITY_AUDIO;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct StreamArgs {
    /// Name given to the stream thread.
    #[clap(long, default_value = "stream_out")]
    pub name: String,
    /// Nice value of the stream thread, 0 leaves it untouched.
    #[clap(long, default_value_t = PRIORITY_AUDIO, allow_hyphen_values = true)]
    pub priority: i32,
    /// Duration of one period in milliseconds.
    #[clap(long, default_value_t = 10)]
    pub period_ms: u64,
    /// Number of periods to play before exiting.
    #[clap(long, default_value_t = 100)]
    pub cycles: u64,
    /// Threading model used to drive the stream.
    #[clap(long)]
    #[clap(value_enum, default_value_t)]
    pub mode: WorkerMode,
}

#[derive(ValueEnum, Clone, Copy, Default, Debug, Eq, PartialEq)]
pub enum WorkerMode {
    /// Pausable worker driven by a thread controller.
    #[default]
    Controller,
    /// Single purpose writer thread fed through message queues.
    Legacy,
}

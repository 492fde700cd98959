// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::process::exit;

use clap::Parser;
use log::error;
use stream_worker::{args::StreamArgs, run_stream, StreamConfiguration};

fn start_stream(args: StreamArgs) -> stream_worker::Result<u64> {
    let config = StreamConfiguration::try_from(args)?;
    run_stream(&config)
}

fn main() {
    env_logger::init_from_env(env_logger::Env::default().filter_or("RUST_LOG", "info"));

    if let Err(e) = start_stream(StreamArgs::parse()) {
        error!("{e}");
        exit(1);
    }
}

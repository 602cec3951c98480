// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Drain, Level, Logger};
use std::fs::File;
use std::io::Write;

/// Async channel depth for log records. Routing churn can produce bursts of
/// records from a single dispatch iteration.
const LOG_CHANNEL_SIZE: usize = 0x8000;

/// Log to stdout, dropping records less severe than `level`.
pub fn init_logger(level: Level) -> Logger {
    build_filtered_logger(std::io::stdout(), level)
}

pub fn init_file_logger(filename: &str) -> Logger {
    build_logger(File::create(filename).expect("build logger"))
}

pub fn build_logger<W: Write + Send + 'static>(w: W) -> Logger {
    build_filtered_logger(w, Level::Trace)
}

/// Build a bunyan logger that drops records less severe than `level`.
pub fn build_filtered_logger<W: Write + Send + 'static>(
    w: W,
    level: Level,
) -> Logger {
    let drain = slog_bunyan::new(w).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOG_CHANNEL_SIZE)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mrt::config::DEFAULT_TIMER_INTERVAL;
use mrt::Dispatcher;
use pim_common::log::{build_filtered_logger, init_logger};
use slog::{Level, Logger};

use crate::config::DaemonConfig;
use crate::log::dlog;
use crate::lower::MemoryKernel;

mod config;
mod daemon;
mod error;
mod log;
mod lower;
mod protocol;
mod signal;

const COMPONENT_PIMD: &str = "pimd";
const MOD_DAEMON: &str = "daemon";
const MOD_LOWER: &str = "lower";
const UNIT_DAEMON: &str = "daemon";
const UNIT_KERNEL: &str = "kernel";
const UNIT_PROTOCOL: &str = "protocol";
const UNIT_SIGNAL: &str = "signal";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, styles = get_styles())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the multicast routing daemon.
    Run(RunArgs),
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        /// Path to the JSON configuration.
        config: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to the JSON configuration.
    #[arg(long)]
    config: PathBuf,

    /// Write the log here instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Least severe log level to record.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between aging passes.
    #[arg(
        long,
        default_value_t = DEFAULT_TIMER_INTERVAL,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    tick_secs: u16,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let cfg = DaemonConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    println!(
        "{}: {} vifs, {} routes, {} rp-set entries, {} members",
        path.display(),
        cfg.vifs.len(),
        cfg.routes.len(),
        cfg.rp_set.len(),
        cfg.members.len(),
    );
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let level: Level = args
        .log_level
        .parse()
        .map_err(|_| anyhow!("unknown log level {}", args.log_level))?;
    let log = match &args.log_file {
        Some(path) => {
            let f = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            build_filtered_logger(f, level)
        }
        None => init_logger(level),
    };

    let cfg = DaemonConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let kernel = Arc::new(MemoryKernel::new(log.clone()));
    let engine = daemon::build_engine(&cfg, kernel.clone(), log.clone())?;

    let (tx, rx) = channel();
    signal::termination_handler(tx, log.clone())?;

    dlog!(log, info, "pimd starting";
        "vifs" => cfg.vifs.len(),
        "routes" => engine.route_count(),
        "tick_secs" => args.tick_secs
    );
    let mut dispatcher =
        Dispatcher::new(engine, Duration::from_secs(args.tick_secs.into()));
    dispatcher.run(rx);

    shutdown(dispatcher, &kernel, &log);
    Ok(())
}

/// Remove every route so no forwarding state outlives the daemon.
fn shutdown(dispatcher: Dispatcher, kernel: &MemoryKernel, log: &Logger) {
    let mut engine = dispatcher.into_engine();
    let n = engine.clear_routes();
    let left = kernel.entries();
    for (source, group, e) in &left {
        dlog!(log, warn, "forwarding entry left behind";
            "source" => source.to_string(),
            "group" => group.to_string(),
            "iif" => e.iif,
            "oifs" => e.oifs.to_string(),
            "rp" => format!("{:?}", e.rp),
            "packets" => e.count.packets
        );
    }
    dlog!(log, info, "pimd stopped";
        "routes_removed" => n,
        "cache_left" => left.len()
    );
}

/// Help output colors.
fn get_styles() -> clap::builder::Styles {
    let bold = |r, g, b| {
        anstyle::Style::new()
            .bold()
            .fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(r, g, b))))
    };
    let heading = bold(245, 207, 101);
    let accent = bold(72, 213, 151);
    clap::builder::Styles::styled()
        .header(heading.underline())
        .usage(heading)
        .literal(accent)
        .valid(accent)
        .placeholder(bold(140, 170, 238))
        .invalid(bold(232, 104, 134))
        .error(bold(232, 104, 134))
}

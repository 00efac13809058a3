mod cli;
mod config;
mod diagnostics;
mod injector;
mod local_loader;
mod proc_maps;
mod ptrace;
mod thunk;

use crate::cli::Cli;
use crate::config::Config;
use anyhow::Result;
use log::{info, LevelFilter};

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse_args();
    init_logger(args.verbose);

    Config::init(&args)?;
    let config = Config::instance();

    let handle = injector::inject(config.pid, &config.agent_path)?;
    info!("agent loaded in pid {}, handle = 0x{handle:x}", config.pid);

    Ok(())
}

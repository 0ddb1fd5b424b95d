mod cli;
mod commands;
mod config;
mod paths;
mod ui;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use config::Config;

/// Global context for the application
pub struct Context {
    pub quiet: bool,
    pub config: Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        quiet: cli.quiet,
        config: Config::load(cli.config.as_deref())?,
    };

    match cli.command {
        Command::Inspect { instance } => commands::inspect::inspect(&ctx, &instance),
        Command::Diff(args) => commands::inspect::diff(&ctx, args),
        Command::Apply(args) => commands::apply::run(&ctx, args),
        Command::Rollback(args) => commands::rollback::run(&ctx, args),
        Command::Layers {
            instance,
            checkpoints,
        } => commands::inspect::layers(&ctx, &instance, checkpoints),
    }
}

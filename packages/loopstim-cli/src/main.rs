use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod output;
mod session;

use cli::Cli;

/// `-v` raises the level step by step; `LOOPSTIM_LOG` filters override it
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("LOOPSTIM_LOG")
        .format_timestamp_millis()
        .format_target(verbose >= 2)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    std::process::exit(commands::dispatch(cli.command).await);
}

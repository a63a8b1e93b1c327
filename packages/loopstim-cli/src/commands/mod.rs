pub mod config;
pub mod postprocess;
pub mod run;

use crate::cli::Command;

/// Run one subcommand to completion and return its exit code
pub async fn dispatch(command: Command) -> i32 {
    match command {
        Command::Run(args) => run::execute(args).await,
        Command::Config(args) => config::execute(args),
        Command::Postprocess(args) => postprocess::execute(args),
    }
}

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "loopstim",
    version,
    about = "Closed-loop acquisition and stimulation command-line tool",
    long_about = "Acquire analog channels, detect threshold crossings and trigger stimulus pulses.\n\
                  Sessions are described by a JSON file; see `loopstim config default`."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run an acquisition session
    Run(RunArgs),
    /// Print, convert or validate session files
    Config(ConfigArgs),
    /// Recompute the derived columns of recorded files
    Postprocess(PostprocessArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Session file (JSON)
    #[arg(long, env = "LOOPSTIM_SESSION")]
    pub session: String,

    /// Seconds to acquire before stopping (Ctrl-C stops earlier)
    #[arg(long, default_value_t = 10.0)]
    pub duration: f64,

    /// Record to this folder, overriding the session file
    #[arg(long)]
    pub record: Option<String>,

    /// Base name of recorded files
    #[arg(long)]
    pub base_name: Option<String>,

    /// Skip the post-pass on recorded files
    #[arg(long, default_value_t = false)]
    pub no_post_pass: bool,

    /// Summary output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print a session file with default settings
    Default {
        /// Compact JSON output (no indentation)
        #[arg(long, default_value_t = false)]
        compact: bool,
    },
    /// Check a session file
    Validate {
        /// Session file (JSON)
        #[arg(long)]
        file: String,

        /// Output as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Convert front-panel settings (milliseconds, cycle buttons) to a run configuration
    FromPanel {
        /// Panel settings file (JSON)
        #[arg(long)]
        file: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Args)]
pub struct PostprocessArgs {
    /// Recorded CSV files
    #[arg(required = true, num_args = 1..)]
    pub files: Vec<String>,

    /// Sample rate the files were recorded at, in Hz
    #[arg(long)]
    pub sample_rate: f64,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

/// Parse an acquisition duration in seconds
pub fn validate_duration(seconds: f64) -> Result<std::time::Duration, String> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!(
            "Invalid duration '{}': expected a positive number of seconds",
            seconds
        ));
    }
    Ok(std::time::Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_duration() {
        assert_eq!(
            validate_duration(1.5).unwrap(),
            std::time::Duration::from_millis(1500)
        );
        assert!(validate_duration(0.0).is_err());
        assert!(validate_duration(-2.0).is_err());
        assert!(validate_duration(f64::INFINITY).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "loopstim",
            "run",
            "--session",
            "s.json",
            "--duration",
            "2",
            "--record",
            "/tmp/out",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.session, "s.json");
                assert_eq!(args.duration, 2.0);
                assert_eq!(args.record.as_deref(), Some("/tmp/out"));
                assert!(!args.no_post_pass);
            }
            _ => panic!("expected run"),
        }
    }
}

use crate::cli::PostprocessArgs;
use crate::exit_codes;
use crate::output::JsonSink;
use loopstim::persistence::PostPassReport;
use loopstim::post_process_file;
use std::path::Path;

pub fn execute(args: PostprocessArgs) -> i32 {
    if !args.sample_rate.is_finite() || args.sample_rate <= 0.0 {
        eprintln!(
            "Error: Invalid sample rate '{}': expected a positive number of Hz",
            args.sample_rate
        );
        return exit_codes::INPUT_ERROR;
    }
    if let Some(missing) = args.files.iter().find(|f| !Path::new(f).is_file()) {
        eprintln!("Error: File not found: {}", missing);
        return exit_codes::INPUT_ERROR;
    }

    let mut reports: Vec<PostPassReport> = Vec::with_capacity(args.files.len());
    let mut failed = false;
    for file in &args.files {
        match post_process_file(file, args.sample_rate) {
            Ok(report) => reports.push(report),
            Err(e) => {
                eprintln!("Error: {}", e);
                failed = true;
            }
        }
    }

    let code = JsonSink::stdout(args.compact).emit(&reports);
    if failed {
        exit_codes::EXECUTION_ERROR
    } else {
        code
    }
}

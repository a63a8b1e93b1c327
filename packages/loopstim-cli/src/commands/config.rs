use crate::cli::{ConfigAction, ConfigArgs};
use crate::exit_codes;
use crate::output::JsonSink;
use crate::session::SessionFile;
use loopstim::PanelSettings;
use serde::Serialize;

#[derive(Serialize)]
struct ValidateOutput {
    file: String,
    valid: bool,
    device: Option<String>,
    sample_rate: Option<f64>,
    capacity: Option<usize>,
    recording: bool,
    error: Option<String>,
}

pub fn execute(args: ConfigArgs) -> i32 {
    match args.action {
        ConfigAction::Default { compact } => {
            JsonSink::stdout(compact).emit(&SessionFile::default())
        }
        ConfigAction::Validate { file, json } => validate(&file, json),
        ConfigAction::FromPanel { file, output } => from_panel(&file, output.as_deref()),
    }
}

fn validate(file: &str, json: bool) -> i32 {
    let loaded = SessionFile::load(file);
    let session = loaded.as_ref().ok();
    let error = loaded.as_ref().err().cloned();

    let result = ValidateOutput {
        file: file.to_string(),
        valid: session.is_some(),
        device: session.map(|s| s.run.device.clone()),
        sample_rate: session.map(|s| s.run.sample_rate),
        capacity: session.map(|s| (s.run.sample_rate * s.run.max_duration).round() as usize),
        recording: session.map(|s| s.recording.is_some()).unwrap_or(false),
        error: error.clone(),
    };

    if json {
        let code = JsonSink::stdout(false).emit(&result);
        if code != exit_codes::SUCCESS {
            return code;
        }
    } else if let Some(ref err) = error {
        eprintln!("Error: {}", err);
    } else {
        println!(
            "Session '{}' is valid ({}, {} Hz, {} samples per channel)",
            file,
            result.device.clone().unwrap_or_default(),
            result.sample_rate.unwrap_or_default(),
            result.capacity.unwrap_or_default()
        );
    }

    if error.is_some() {
        exit_codes::INPUT_ERROR
    } else {
        exit_codes::SUCCESS
    }
}

fn from_panel(file: &str, output_path: Option<&str>) -> i32 {
    let panel: PanelSettings = match std::fs::read_to_string(file)
        .map_err(|e| format!("Failed to read panel settings '{}': {}", file, e))
        .and_then(|text| {
            serde_json::from_str(&text)
                .map_err(|e| format!("Invalid panel settings '{}': {}", file, e))
        }) {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let run = match panel.into_run_configuration() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let session = SessionFile {
        run,
        ..Default::default()
    };
    JsonSink {
        compact: false,
        file: output_path,
    }
    .emit(&session)
}

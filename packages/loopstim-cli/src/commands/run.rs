use crate::cli::{self, RunArgs};
use crate::exit_codes;
use crate::output::JsonSink;
use crate::session::SessionFile;
use loopstim::device::create_device;
use loopstim::dispatcher::PulseOutcome;
use loopstim::{AcquisitionEngine, EngineError, EngineEvent, EngineOptions, PersistenceConfig};
use std::time::Duration;

const DEFAULT_BASE_NAME: &str = "recording";

pub async fn execute(args: RunArgs) -> i32 {
    let duration = match cli::validate_duration(args.duration) {
        Ok(d) => d,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };

    let mut session = match SessionFile::load(&args.session) {
        Ok(s) => s,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };
    apply_recording_overrides(&mut session, &args);

    let device = create_device(&session.run.device, session.device.clone());
    let options = EngineOptions {
        recording: session.recording.clone(),
        record_on_start: session.recording.is_some(),
        ..Default::default()
    };
    let mut engine = AcquisitionEngine::new(session.run.clone(), device, options);
    let quiet = args.quiet;
    engine.set_event_callback(move |event| report_event(&event, quiet));

    if !args.quiet {
        eprintln!(
            "Acquiring on {} at {} Hz for {:.1} s...",
            session.run.device,
            session.run.sample_rate,
            duration.as_secs_f64()
        );
        eprintln!(
            "  Channel: {}  Threshold: {} V (+{} / -{})",
            session.run.active_channel,
            session.run.threshold,
            session.run.hysteresis_up,
            session.run.hysteresis_down
        );
    }

    if let Err(e) = engine.start().await {
        eprintln!("Error: {}", e);
        return match e {
            EngineError::Device(_) => exit_codes::DEVICE_ERROR,
            EngineError::InvalidConfig(_) => exit_codes::INPUT_ERROR,
            _ => exit_codes::EXECUTION_ERROR,
        };
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => {
            if !args.quiet {
                eprintln!("Interrupted, stopping...");
            }
        }
        _ = loop_exited(&engine) => {}
    }

    let summary = match engine.stop().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    let sink = JsonSink {
        compact: args.compact,
        file: args.output.as_deref(),
    };
    let code = sink.emit(&summary);
    if code != exit_codes::SUCCESS {
        return code;
    }
    if !args.quiet {
        if let Some(ref path) = args.output {
            eprintln!("Summary written to {}", path);
        }
        if let Some(recording) = &summary.recording {
            for file in &recording.files {
                eprintln!("Recorded {}", file.display());
            }
        }
    }

    match summary.error {
        Some(message) => {
            eprintln!("Acquisition failed: {}", message);
            exit_codes::EXECUTION_ERROR
        }
        None => exit_codes::SUCCESS,
    }
}

fn apply_recording_overrides(session: &mut SessionFile, args: &RunArgs) {
    if let Some(folder) = &args.record {
        let base_name = args
            .base_name
            .clone()
            .or_else(|| session.recording.as_ref().map(|r| r.base_name.clone()))
            .unwrap_or_else(|| DEFAULT_BASE_NAME.to_string());
        session.recording = Some(PersistenceConfig::new(folder, base_name));
    } else if let (Some(base_name), Some(recording)) = (&args.base_name, session.recording.as_mut())
    {
        recording.base_name = base_name.clone();
    }
    if args.no_post_pass {
        if let Some(recording) = session.recording.as_mut() {
            recording.post_pass = false;
        }
    }
}

/// Resolves once the producer thread has ended on its own
async fn loop_exited(engine: &AcquisitionEngine) {
    while engine.is_acquiring() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn report_event(event: &EngineEvent, quiet: bool) {
    match event {
        EngineEvent::Crossing { crossing, .. } => {
            log::debug!("{:?} crossing at {:.4} s", crossing.kind, crossing.time);
        }
        EngineEvent::CycleAdvanced {
            cycle,
            fired,
            tagged,
            ..
        } => {
            log::info!("Cycle {}: fired {:?}, tagged {:?}", cycle, fired, tagged);
        }
        EngineEvent::Pulse {
            outcome: PulseOutcome::Fired {
                stimulator,
                latency_ms,
                ..
            },
            ..
        } => {
            log::debug!(
                "Stimulator {} pulsed {:.2} ms after detection",
                stimulator.number(),
                latency_ms
            );
        }
        EngineEvent::StatsUpdate { stats, .. } => {
            log::info!(
                "{} chunks, {} ascending, {} pulses",
                stats.chunks_acquired,
                stats.ascending_crossings,
                stats.pulses_fired
            );
        }
        EngineEvent::RecordingStarted { folder, .. } if !quiet => {
            eprintln!("Recording to {}", folder.display());
        }
        EngineEvent::Error { error, .. } if !quiet => {
            eprintln!("Acquisition error: {}", error);
        }
        _ => {}
    }
}

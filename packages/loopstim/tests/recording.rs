use loopstim::persistence::{
    PersistenceMessage, PersistenceWorker, ACTIVE_CYCLE_LABEL, CYCLE_TIME_LABEL, FREQUENCY_LABEL,
    TIME_LABEL,
};
use loopstim::{
    post_process_file, AcquisitionPipeline, HoldOffClock, PersistenceConfig, RunConfiguration,
    Stimulator, Waveform, ANALOG_CHANNELS, MARK_SET, MARK_TAG,
};
use std::path::Path;

fn config(sample_rate: f64, max_duration: f64, samples_per_iteration: usize) -> RunConfiguration {
    RunConfiguration {
        sample_rate,
        max_duration,
        samples_per_iteration,
        threshold: 1.0,
        hold_off_clock: HoldOffClock::Samples,
        ..Default::default()
    }
}

/// Record `total` samples of `waveform` on channel 0 through a persistence worker
fn record(
    pipeline: &mut AcquisitionPipeline,
    waveform: &Waveform,
    total: u64,
    folder: &Path,
) -> loopstim::persistence::PersistenceSummary {
    let worker = PersistenceWorker::spawn(PersistenceConfig::new(folder, "run")).unwrap();
    let sender = worker.sender();
    let rate = pipeline.geometry().sample_rate;
    let k = pipeline.geometry().samples_per_iteration as u64;

    pipeline.set_recording(true);
    sender
        .send(PersistenceMessage::Open { sample_rate: rate })
        .unwrap();
    let mut tick = 0;
    while tick < total {
        let mut samples = vec![vec![0.0; k as usize]; ANALOG_CHANNELS];
        samples[0] = (tick..tick + k).map(|t| waveform.value_at(t, rate)).collect();
        let report = pipeline.process_chunk(samples).unwrap();
        sender
            .send(PersistenceMessage::Chunk(report.persisted.unwrap()))
            .unwrap();
        tick += k;
    }
    drop(sender);
    worker.finish().unwrap()
}

fn column(path: &Path, label: &str) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let index = reader
        .headers()
        .unwrap()
        .iter()
        .position(|h| h == label)
        .unwrap();
    reader
        .records()
        .map(|r| r.unwrap()[index].to_string())
        .collect()
}

#[test]
fn test_recorded_run_gets_derived_columns() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = AcquisitionPipeline::with_sample_clock(config(1000.0, 1.0, 10)).unwrap();
    let square = Waveform::Square {
        low: 0.0,
        high: 2.0,
        high_samples: 20,
        low_samples: 20,
    };

    let summary = record(&mut pipeline, &square, 400, dir.path());
    assert_eq!(summary.files, vec![dir.path().join("run_1.csv")]);
    assert_eq!(summary.rows_written, 400);

    let report = &summary.reports[0];
    assert_eq!(report.rows, 400);
    assert_eq!((report.ascending, report.descending), (10, 10));
    assert!((report.mean_active_cycle.unwrap() - 0.02).abs() < 1e-9);
    assert!((report.mean_inactive_cycle.unwrap() - 0.02).abs() < 1e-9);
    assert!((report.mean_cycle_time.unwrap() - 0.04).abs() < 1e-9);
    assert!((report.frequency.unwrap() - 25.0).abs() < 1e-6);

    let path = &summary.files[0];
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(header.len(), 1 + 18 + 4);
    assert_eq!(header[0], TIME_LABEL);
    assert_eq!(header[1], "CH 1");
    assert_eq!(header[13], "TAG OUT");
    assert_eq!(header[22], FREQUENCY_LABEL);

    let active = column(path, ACTIVE_CYCLE_LABEL);
    assert!((active[20].parse::<f64>().unwrap() - 0.02).abs() < 1e-12);
    assert!(active[0].is_empty());
    let cycle_time = column(path, CYCLE_TIME_LABEL);
    assert!((cycle_time[0].parse::<f64>().unwrap() - 0.04).abs() < 1e-12);
    assert!(cycle_time[360].is_empty());
}

#[test]
fn test_stimulus_track_separates_pulses_from_tags() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = RunConfiguration {
        max_cycle_count: 2,
        trigger_delay: 0.0,
        ..config(1000.0, 1.0, 10)
    };
    run.stimulator_mut(Stimulator::S1).fire_on = [1].into_iter().collect();
    let mut pipeline = AcquisitionPipeline::with_sample_clock(run).unwrap();
    let square = Waveform::Square {
        low: 0.0,
        high: 2.0,
        high_samples: 20,
        low_samples: 20,
    };

    let summary = record(&mut pipeline, &square, 160, dir.path());
    let stim: Vec<f64> = column(&summary.files[0], "STIM 1")
        .iter()
        .map(|v| v.parse().unwrap())
        .collect();
    // Rises at 0, 40, 80, 120 alternate between cycle 1 (pulse) and cycle 2 (tag)
    assert_eq!(
        [stim[0], stim[40], stim[80], stim[120]],
        [MARK_SET, MARK_TAG, MARK_SET, MARK_TAG]
    );
    assert_eq!(MARK_TAG, 1.5);
    assert_eq!(stim.iter().filter(|&&v| v != 0.0).count(), 4);
}

#[test]
fn test_post_pass_is_idempotent_on_recorded_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = AcquisitionPipeline::with_sample_clock(config(1000.0, 1.0, 10)).unwrap();
    let triangle = Waveform::Triangle {
        low: 0.0,
        high: 2.0,
        rise_samples: 50,
        fall_samples: 50,
    };
    let summary = record(&mut pipeline, &triangle, 500, dir.path());
    let path = &summary.files[0];

    let first = std::fs::read_to_string(path).unwrap();
    let again = post_process_file(path, 1000.0).unwrap();
    let second = std::fs::read_to_string(path).unwrap();
    assert_eq!(first, second);
    assert_eq!(again, summary.reports[0]);
}

#[test]
fn test_recording_follows_buffer_wrap() {
    // 30-sample chunks in a 100-sample window wrap on most writes
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = AcquisitionPipeline::with_sample_clock(config(100.0, 1.0, 30)).unwrap();
    let ramp = Waveform::Samples {
        data: (0..600).map(|v| v as f64 / 100.0).collect(),
        repeat: false,
    };

    let summary = record(&mut pipeline, &ramp, 600, dir.path());
    assert_eq!(summary.rows_written, 600);

    let recorded: Vec<f64> = column(&summary.files[0], "CH 1")
        .iter()
        .map(|v| v.parse().unwrap())
        .collect();
    let expected: Vec<f64> = (0..600).map(|v| v as f64 / 100.0).collect();
    assert_eq!(recorded, expected);
}

#[test]
fn test_new_recordings_never_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("run_1.csv"), "keep me\n").unwrap();

    let mut pipeline = AcquisitionPipeline::with_sample_clock(config(1000.0, 1.0, 10)).unwrap();
    let summary = record(&mut pipeline, &Waveform::default(), 50, dir.path());

    assert_eq!(summary.files, vec![dir.path().join("run_2.csv")]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("run_1.csv")).unwrap(),
        "keep me\n"
    );
}

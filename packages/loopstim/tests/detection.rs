use loopstim::{
    AcquisitionPipeline, Crossing, CrossingKind, HoldOffClock, MarkerChannel, RunConfiguration,
    Stimulator, Waveform, ANALOG_CHANNELS, MARK_SET, MARK_TAG,
};

fn triangle() -> Waveform {
    Waveform::Triangle {
        low: 0.0,
        high: 2.0,
        rise_samples: 1000,
        fall_samples: 1000,
    }
}

fn square(high_samples: u64, low_samples: u64) -> Waveform {
    Waveform::Square {
        low: 0.0,
        high: 2.0,
        high_samples,
        low_samples,
    }
}

fn reference_config(samples_per_iteration: usize) -> RunConfiguration {
    RunConfiguration {
        sample_rate: 3300.0,
        max_duration: 20.0,
        samples_per_iteration,
        active_channel: 0,
        threshold: 1.0,
        hysteresis_up: 0.2,
        hysteresis_down: 0.1,
        hold_off: 0.05,
        hold_off_clock: HoldOffClock::Samples,
        max_cycle_count: 1,
        ..Default::default()
    }
}

/// Feed `total` samples of `waveform` on the active channel, chunk by chunk
fn replay(pipeline: &mut AcquisitionPipeline, waveform: &Waveform, total: u64) -> Vec<Crossing> {
    let k = pipeline.geometry().samples_per_iteration as u64;
    let rate = pipeline.geometry().sample_rate;
    let channel = pipeline.config().active_channel;
    let mut crossings = Vec::new();
    let mut tick = 0;
    while tick < total {
        let mut samples = vec![vec![0.0; k as usize]; ANALOG_CHANNELS];
        samples[channel] = (tick..tick + k).map(|t| waveform.value_at(t, rate)).collect();
        let report = pipeline.process_chunk(samples).unwrap();
        crossings.extend(report.crossing);
        tick += k;
    }
    crossings
}

fn ticks(crossings: &[Crossing], kind: CrossingKind) -> Vec<u64> {
    crossings
        .iter()
        .filter(|c| c.kind == kind)
        .map(|c| c.tick)
        .collect()
}

#[test]
fn test_reference_triangle_scenario() {
    let config = reference_config(10);
    let upper = config.threshold + config.hysteresis_up;
    let lower = config.threshold - config.hysteresis_down;
    let mut pipeline = AcquisitionPipeline::with_sample_clock(config).unwrap();
    assert_eq!(pipeline.geometry().capacity, 66000);

    let wave = triangle();
    let crossings = replay(&mut pipeline, &wave, 6000);

    // First qualifying sample of each half period
    let expected_up: Vec<u64> = (0..3u64)
        .map(|p| {
            (2000 * p..2000 * p + 1000)
                .find(|&t| wave.value_at(t, 3300.0) >= upper)
                .unwrap()
        })
        .collect();
    let expected_down: Vec<u64> = (0..3u64)
        .map(|p| {
            (2000 * p + 1000..2000 * p + 2000)
                .find(|&t| wave.value_at(t, 3300.0) <= lower)
                .unwrap()
        })
        .collect();
    assert_eq!(expected_up, vec![600, 2600, 4600]);
    assert_eq!(expected_down, vec![1550, 3550, 5550]);

    assert_eq!(ticks(&crossings, CrossingKind::Ascending), expected_up);
    assert_eq!(ticks(&crossings, CrossingKind::Descending), expected_down);

    let buffer = pipeline.buffer();
    for &t in &expected_up {
        assert_eq!(buffer.marker_at(MarkerChannel::CrossUp, t as usize), MARK_SET);
    }
    for &t in &expected_down {
        assert_eq!(buffer.marker_at(MarkerChannel::CrossDown, t as usize), MARK_SET);
    }
    let ups = buffer.marker(MarkerChannel::CrossUp).iter().filter(|&&v| v != 0.0).count();
    let downs = buffer.marker(MarkerChannel::CrossDown).iter().filter(|&&v| v != 0.0).count();
    assert_eq!((ups, downs), (3, 3));

    let crossing = crossings[0];
    assert!((crossing.time - 600.0 / 3300.0).abs() < 1e-12);
    assert_eq!(crossing.cycle, Some(1));
}

#[test]
fn test_crossings_consistent_across_chunk_sizes() {
    for k in [1usize, 3, 7, 10, 20, 64, 128] {
        let mut pipeline = AcquisitionPipeline::with_sample_clock(reference_config(k)).unwrap();
        let crossings = replay(&mut pipeline, &triangle(), 6000);

        let kinds: Vec<CrossingKind> = crossings.iter().map(|c| c.kind).collect();
        let alternating: Vec<CrossingKind> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    CrossingKind::Ascending
                } else {
                    CrossingKind::Descending
                }
            })
            .collect();
        assert_eq!(kinds, alternating, "chunk size {}", k);

        // Chunk-mean gating can only delay a crossing, and by less than one chunk
        for (p, t) in ticks(&crossings, CrossingKind::Ascending).into_iter().enumerate() {
            let exact = 600 + 2000 * p as u64;
            assert!(t >= exact && t < exact + k as u64, "k={} ascending at {}", k, t);
        }
        for (p, t) in ticks(&crossings, CrossingKind::Descending).into_iter().enumerate() {
            let exact = 1550 + 2000 * p as u64;
            assert!(t >= exact && t < exact + k as u64, "k={} descending at {}", k, t);
        }
    }
}

fn square_config(hold_off: f64) -> RunConfiguration {
    RunConfiguration {
        sample_rate: 1000.0,
        max_duration: 1.0,
        samples_per_iteration: 10,
        threshold: 1.0,
        hold_off,
        hold_off_clock: HoldOffClock::Samples,
        ..Default::default()
    }
}

#[test]
fn test_hold_off_excludes_fast_toggling() {
    let wave = square(20, 20);

    let mut free = AcquisitionPipeline::with_sample_clock(square_config(0.0)).unwrap();
    let free_up = ticks(&replay(&mut free, &wave, 400), CrossingKind::Ascending);
    assert_eq!(free_up, (0..10).map(|i| i * 40).collect::<Vec<u64>>());

    let mut refractory = AcquisitionPipeline::with_sample_clock(square_config(0.1)).unwrap();
    let crossings = replay(&mut refractory, &wave, 400);
    let up = ticks(&crossings, CrossingKind::Ascending);
    let down = ticks(&crossings, CrossingKind::Descending);
    assert_eq!(up, vec![0, 120, 240, 360]);
    assert_eq!(down, vec![100, 220, 340]);
    for pair in up.windows(2) {
        assert!(pair[1] - pair[0] >= 100);
    }
}

#[test]
fn test_cycle_counter_wraps_and_marks_stimulators() {
    let mut config = square_config(0.0);
    config.max_cycle_count = 3;
    config.stimulator_mut(Stimulator::S1).fire_on = [1].into_iter().collect();
    config.stimulator_mut(Stimulator::S2).fire_on = [2, 3].into_iter().collect();
    let mut pipeline = AcquisitionPipeline::with_sample_clock(config).unwrap();

    let crossings = replay(&mut pipeline, &square(20, 20), 280);
    let ascending: Vec<&Crossing> = crossings
        .iter()
        .filter(|c| c.kind == CrossingKind::Ascending)
        .collect();
    let cycles: Vec<u32> = ascending.iter().filter_map(|c| c.cycle).collect();
    assert_eq!(cycles, vec![1, 2, 3, 1, 2, 3, 1]);

    let buffer = pipeline.buffer();
    for crossing in ascending {
        let i = crossing.sample_index;
        let cycle = crossing.cycle.unwrap();
        let s1 = buffer.marker_at(MarkerChannel::Stim1, i);
        let s2 = buffer.marker_at(MarkerChannel::Stim2, i);
        assert_eq!(s1, if cycle == 1 { MARK_SET } else { MARK_TAG });
        assert_eq!(s2, if cycle == 1 { MARK_TAG } else { MARK_SET });
        assert_eq!(buffer.marker_at(MarkerChannel::Stim3, i), 0.0);
    }
}

#[test]
fn test_channel_switch_restarts_detection() {
    let mut pipeline = AcquisitionPipeline::with_sample_clock(square_config(0.0)).unwrap();
    let mut samples = vec![vec![0.0; 10]; ANALOG_CHANNELS];
    samples[0] = vec![2.0; 10];
    samples[4] = vec![2.0; 10];
    assert!(pipeline.process_chunk(samples.clone()).unwrap().crossing.is_some());
    assert_eq!(pipeline.cycle(), 1);

    pipeline.set_active_channel(4).unwrap();
    assert_eq!(pipeline.cycle(), 0);
    let crossing = pipeline.process_chunk(samples).unwrap().crossing.unwrap();
    assert_eq!(crossing.kind, CrossingKind::Ascending);
    assert_eq!(crossing.cycle, Some(1));

    assert!(pipeline.set_active_channel(ANALOG_CHANNELS).is_err());
}

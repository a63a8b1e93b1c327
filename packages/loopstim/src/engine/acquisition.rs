// Acquisition pipeline and producer loop
//
// `AcquisitionPipeline` is the frame state guarded by the engine's single
// mutex: ring buffer, detector, coordinator and the write position. One call
// to `process_chunk` is one producer iteration under the lock; the loop below
// only adds the blocking hardware read, control commands and hand-off to the
// other workers.

use super::events::{EngineEvent, EventSink};
use super::EngineCounters;
use crate::buffer::{BufferWindow, CircularSampleBuffer, DropOldestQueue};
use crate::config::{validate_channel, RunConfiguration};
use crate::coordinator::{CycleOutcome, StimulationCoordinator};
use crate::detector::{CrossDetector, DetectorLevels, DetectorPhase};
use crate::device::{AnalogSession, ClockMode};
use crate::dispatcher::PulseSender;
use crate::error::{EngineError, EngineResult};
use crate::geometry::SampleGeometry;
use crate::holdoff::HoldOffTimer;
use crate::persistence::{PersistenceMessage, PersistenceSender};
use crate::types::{
    Crossing, CrossingKind, DataChunk, EngineState, MarkerChannel, PersistedChunk, RenderFrame,
    Stimulator, ANALOG_CHANNELS, MARK_SET,
};
use crossbeam::channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runtime commands applied by the loop between two chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    SetSampleRate { sample_rate: f64 },
    SetDuration { max_duration: f64 },
    SetActiveChannel { channel: usize },
    StartRecording,
    StopRecording,
    SetStimulatorArmed { stimulator: Stimulator, armed: bool },
}

/// Everything one producer iteration produced
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub crossing: Option<Crossing>,
    pub cycle: Option<CycleOutcome>,
    pub frame: RenderFrame,
    pub persisted: Option<PersistedChunk>,
}

pub struct AcquisitionPipeline {
    config: RunConfiguration,
    geometry: SampleGeometry,
    buffer: CircularSampleBuffer,
    detector: CrossDetector,
    coordinator: StimulationCoordinator,
    tick: u64,
    sequence: u64,
    /// Stimulus marks due in a chunk not yet acquired, keyed by absolute tick
    pending_marks: BTreeMap<u64, Vec<(MarkerChannel, f64)>>,
    recording: bool,
}

impl AcquisitionPipeline {
    pub fn new(config: RunConfiguration, hold_off: HoldOffTimer) -> EngineResult<Self> {
        config.validate()?;
        let geometry = SampleGeometry::from_config(&config)?;
        let detector = CrossDetector::new(
            DetectorLevels::from_config(&config),
            config.active_channel,
            hold_off,
        );
        let coordinator = StimulationCoordinator::new(&config);

        Ok(Self {
            buffer: CircularSampleBuffer::new(geometry.capacity),
            geometry,
            detector,
            coordinator,
            config,
            tick: 0,
            sequence: 0,
            pending_marks: BTreeMap::new(),
            recording: false,
        })
    }

    /// Pipeline timing its hold-off on the sample clock; needs no runtime
    pub fn with_sample_clock(config: RunConfiguration) -> EngineResult<Self> {
        let hold_off = HoldOffTimer::sample_clock(config.hold_off, config.sample_rate);
        Self::new(config, hold_off)
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn geometry(&self) -> &SampleGeometry {
        &self.geometry
    }

    pub fn buffer(&self) -> &CircularSampleBuffer {
        &self.buffer
    }

    pub fn write_index(&self) -> usize {
        self.buffer.write_index()
    }

    /// Samples per channel acquired since the last geometry reset
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn detector_phase(&self) -> DetectorPhase {
        self.detector.phase()
    }

    pub fn cycle(&self) -> u32 {
        self.coordinator.cycle()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn set_stimulator_armed(&mut self, stimulator: Stimulator, armed: bool) {
        self.coordinator.set_armed(stimulator, armed);
        self.config.stimulator_mut(stimulator).armed = armed;
    }

    /// Rebind detection to `channel`; detector and cycle counter start over
    pub fn set_active_channel(&mut self, channel: usize) -> EngineResult<()> {
        validate_channel(channel)?;
        self.config.active_channel = channel;
        self.detector.set_channel(channel);
        self.coordinator.reset();
        Ok(())
    }

    /// Swap in a new geometry: fresh zeroed buffer, index 0, detector IDLE
    pub fn reconfigure(&mut self, geometry: SampleGeometry) {
        log::debug!(
            "Buffer reallocated: {} samples ({} Hz x {} s)",
            geometry.capacity,
            geometry.sample_rate,
            geometry.max_duration
        );
        self.config.sample_rate = geometry.sample_rate;
        self.config.max_duration = geometry.max_duration;
        self.geometry = geometry;
        self.buffer = CircularSampleBuffer::new(geometry.capacity);
        self.tick = 0;
        self.pending_marks.clear();
        self.detector.set_sample_rate(geometry.sample_rate);
    }

    /// Detector back to IDLE with hold-off cancelled; pending marks discarded
    pub fn halt(&mut self) {
        self.detector.reset();
        self.pending_marks.clear();
    }

    /// Copy of the newest `length` samples, oldest first
    pub fn latest(&self, length: usize) -> BufferWindow {
        let capacity = self.geometry.capacity;
        let length = length.min(capacity);
        let from = (self.buffer.write_index() + capacity - length) % capacity;
        self.buffer.read(from, length)
    }

    /// Run one producer iteration on a chunk of `[channel][sample]` data
    pub fn process_chunk(&mut self, samples: Vec<Vec<f64>>) -> EngineResult<ChunkReport> {
        let k = self.geometry.samples_per_iteration;
        if samples.len() != ANALOG_CHANNELS {
            return Err(EngineError::ChannelCountMismatch {
                expected: ANALOG_CHANNELS,
                actual: samples.len(),
            });
        }
        if let Some(channel) = samples.iter().find(|ch| ch.len() != k) {
            return Err(EngineError::ChunkSizeMismatch {
                expected: k,
                actual: channel.len(),
            });
        }

        let start_index = self.buffer.write_index();
        let start_tick = self.tick;

        let (head, tail) = self.geometry.segments(start_index, k);
        let split = head.len();
        self.buffer.clear_markers(head.clone());
        self.buffer.write(head.start, &samples, 0..split);
        if let Some(tail) = tail {
            self.buffer.clear_markers(tail.clone());
            self.buffer.write(tail.start, &samples, split..k);
        }
        self.apply_pending_marks(start_tick, start_index, k);

        let mut crossing = self.detector.evaluate(
            &samples[self.config.active_channel],
            start_tick,
            start_index,
            &self.geometry,
        );

        let mut cycle = None;
        if let Some(c) = crossing.as_mut() {
            self.buffer.mark(c.kind.marker(), c.sample_index, MARK_SET);
            if c.kind == CrossingKind::Ascending {
                let outcome = self.coordinator.on_ascending(c, self.geometry.sample_rate);
                for decision in &outcome.decisions {
                    self.place_mark(
                        decision.mark_tick,
                        decision.marker(),
                        decision.mark_value(),
                        start_tick,
                        start_index,
                        k,
                    );
                }
                cycle = Some(outcome);
            }
        }

        let persisted = self
            .recording
            .then(|| PersistedChunk::from(self.buffer.read(start_index, k)));

        let sequence = self.sequence;
        self.sequence += 1;
        self.tick += k as u64;

        Ok(ChunkReport {
            crossing,
            cycle,
            frame: RenderFrame {
                chunk: Arc::new(DataChunk {
                    samples,
                    start_tick,
                    sequence,
                }),
                write_index: start_index,
            },
            persisted,
        })
    }

    fn place_mark(
        &mut self,
        tick: u64,
        marker: MarkerChannel,
        value: f64,
        start_tick: u64,
        start_index: usize,
        len: usize,
    ) {
        if tick < start_tick + len as u64 {
            let index = (start_index + (tick - start_tick) as usize) % self.geometry.capacity;
            self.buffer.mark(marker, index, value);
        } else {
            self.pending_marks
                .entry(tick)
                .or_default()
                .push((marker, value));
        }
    }

    fn apply_pending_marks(&mut self, start_tick: u64, start_index: usize, len: usize) {
        let later = self.pending_marks.split_off(&(start_tick + len as u64));
        let due = std::mem::replace(&mut self.pending_marks, later);
        for (tick, marks) in due {
            if tick < start_tick {
                continue;
            }
            for (marker, value) in marks {
                self.place_mark(tick, marker, value, start_tick, start_index, len);
            }
        }
    }
}

const STATS_INTERVAL: Duration = Duration::from_millis(500);

/// State moved onto the acquisition thread
pub(crate) struct LoopContext {
    pub run_id: String,
    pub session: Box<dyn AnalogSession>,
    pub pipeline: Arc<Mutex<AcquisitionPipeline>>,
    pub control: Receiver<ControlCommand>,
    pub stop_signal: Arc<AtomicBool>,
    pub pulses: PulseSender,
    pub persistence: Option<PersistenceSender>,
    pub recording_folder: Option<PathBuf>,
    pub render: Arc<DropOldestQueue<RenderFrame>>,
    pub counters: Arc<EngineCounters>,
    pub events: EventSink,
    pub state: Arc<RwLock<EngineState>>,
}

/// Producer thread body; returns when stopped or on the first fatal error
pub(crate) fn run_loop(mut ctx: LoopContext) -> EngineResult<()> {
    log::info!("Acquisition loop started: {}", ctx.run_id);

    let result = acquire(&mut ctx);
    match &result {
        Ok(()) => log::info!("Acquisition loop stopped: {}", ctx.run_id),
        Err(e) => {
            log::error!("Acquisition aborted: {}", e);
            let state = EngineState::Error {
                message: e.to_string(),
            };
            *ctx.state.write() = state.clone();
            ctx.events.emit(EngineEvent::StateChanged {
                run_id: ctx.run_id.clone(),
                state,
            });
            ctx.events.emit(EngineEvent::Error {
                run_id: ctx.run_id.clone(),
                error: e.to_string(),
            });
        }
    }
    result
}

fn acquire(ctx: &mut LoopContext) -> EngineResult<()> {
    let started = Instant::now();
    let mut last_stats = Instant::now();

    while !ctx.stop_signal.load(Ordering::Acquire) {
        apply_control(ctx)?;

        let k = ctx.pipeline.lock().geometry().samples_per_iteration;
        let samples = ctx
            .session
            .read(k)
            .map_err(|e| EngineError::Driver(e.to_string()))?;

        let report = {
            let mut pipeline = ctx.pipeline.lock();
            let mut report = pipeline.process_chunk(samples)?;
            let detected_at = Instant::now();

            if let Some(outcome) = &report.cycle {
                for command in outcome.commands() {
                    if !ctx.pulses.submit(command.clone(), detected_at) {
                        log::warn!(
                            "Pulse dispatcher gone, stimulator {} pulse dropped",
                            command.stimulator.number()
                        );
                        ctx.counters.pulses_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            let mut worker_gone = false;
            if let (Some(chunk), Some(persistence)) = (report.persisted.take(), &ctx.persistence) {
                worker_gone = persistence.send(PersistenceMessage::Chunk(chunk)).is_err();
            }
            if worker_gone {
                log::error!("Persistence worker stopped, recording disabled");
                pipeline.set_recording(false);
                ctx.persistence = None;
            }
            report
        };

        ctx.counters.chunks.fetch_add(1, Ordering::Relaxed);
        ctx.counters.samples.fetch_add(k as u64, Ordering::Relaxed);

        if let Some(crossing) = report.crossing {
            let counter = match crossing.kind {
                CrossingKind::Ascending => &ctx.counters.ascending,
                CrossingKind::Descending => &ctx.counters.descending,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            ctx.events.emit(EngineEvent::Crossing {
                run_id: ctx.run_id.clone(),
                crossing,
            });
        }
        if let Some(outcome) = &report.cycle {
            ctx.events.emit(EngineEvent::CycleAdvanced {
                run_id: ctx.run_id.clone(),
                cycle: outcome.cycle,
                fired: outcome.fired(),
                tagged: outcome.tagged(),
            });
        }

        if ctx.render.push(report.frame) {
            let dropped = ctx.counters.render_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                log::warn!("Render consumer lagging, {} frames dropped", dropped);
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            ctx.events.emit(EngineEvent::StatsUpdate {
                run_id: ctx.run_id.clone(),
                stats: ctx.counters.snapshot(Some(started.elapsed().as_secs_f64())),
            });
            last_stats = Instant::now();
        }
    }
    Ok(())
}

fn apply_control(ctx: &mut LoopContext) -> EngineResult<()> {
    while let Ok(command) = ctx.control.try_recv() {
        log::debug!("Applying {:?}", command);
        let mut pipeline = ctx.pipeline.lock();
        match command {
            ControlCommand::SetSampleRate { .. } | ControlCommand::SetDuration { .. } => {
                let current = *pipeline.geometry();
                let geometry = match command {
                    ControlCommand::SetSampleRate { sample_rate } => {
                        current.with_sample_rate(sample_rate)
                    }
                    ControlCommand::SetDuration { max_duration } => {
                        current.with_duration(max_duration)
                    }
                    _ => Ok(current),
                };
                let geometry = match geometry {
                    Ok(geometry) => geometry,
                    Err(e) => {
                        log::warn!("Ignoring {:?}: {}", command, e);
                        continue;
                    }
                };
                ctx.session
                    .configure_clock(
                        geometry.sample_rate,
                        ClockMode::Continuous,
                        geometry.samples_per_iteration,
                    )
                    .map_err(|e| EngineError::Driver(e.to_string()))?;
                pipeline.reconfigure(geometry);

                // The sample period is fixed within one file
                if pipeline.is_recording() {
                    let opened = notify_persistence(
                        &ctx.persistence,
                        PersistenceMessage::Open {
                            sample_rate: geometry.sample_rate,
                        },
                    );
                    pipeline.set_recording(opened);
                }
                ctx.events.emit(EngineEvent::Reconfigured {
                    run_id: ctx.run_id.clone(),
                    sample_rate: geometry.sample_rate,
                    max_duration: geometry.max_duration,
                    capacity: geometry.capacity,
                });
            }
            ControlCommand::SetActiveChannel { channel } => {
                pipeline.set_active_channel(channel)?;
                ctx.events.emit(EngineEvent::ChannelChanged {
                    run_id: ctx.run_id.clone(),
                    channel,
                });
            }
            ControlCommand::StartRecording => match (&ctx.persistence, &ctx.recording_folder) {
                (Some(_), Some(folder)) => {
                    let opened = notify_persistence(
                        &ctx.persistence,
                        PersistenceMessage::Open {
                            sample_rate: pipeline.geometry().sample_rate,
                        },
                    );
                    pipeline.set_recording(opened);
                    if opened {
                        ctx.events.emit(EngineEvent::RecordingStarted {
                            run_id: ctx.run_id.clone(),
                            folder: folder.clone(),
                        });
                    }
                }
                _ => log::warn!("Recording requested but no output folder is configured"),
            },
            ControlCommand::StopRecording => {
                if pipeline.is_recording() {
                    notify_persistence(&ctx.persistence, PersistenceMessage::Close);
                    pipeline.set_recording(false);
                    ctx.events.emit(EngineEvent::RecordingStopped {
                        run_id: ctx.run_id.clone(),
                    });
                }
            }
            ControlCommand::SetStimulatorArmed { stimulator, armed } => {
                pipeline.set_stimulator_armed(stimulator, armed);
            }
        }
    }
    Ok(())
}

/// Recording failures never stop acquisition
fn notify_persistence(persistence: &Option<PersistenceSender>, message: PersistenceMessage) -> bool {
    match persistence {
        Some(persistence) => match persistence.send(message) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Persistence worker unavailable: {}", e);
                false
            }
        },
        None => false,
    }
}

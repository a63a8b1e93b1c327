// Acquisition engine - owns one closed-loop run
//
// The engine manages:
// - Configuration validation and hardware session setup
// - The hardware-paced producer thread
// - Pulse dispatch and persistence workers
// - Runtime control commands
// - Event emission to the host
// - Ordered shutdown via CancellationToken

mod acquisition;
mod events;

pub use acquisition::{AcquisitionPipeline, ChunkReport, ControlCommand};
pub use events::{EngineEvent, EventSink};

use crate::buffer::{BufferWindow, DropOldestQueue};
use crate::config::{validate_channel, RunConfiguration};
use crate::detector::DetectorPhase;
use crate::device::{ClockMode, DaqDevice, DeviceError};
use crate::dispatcher::{PulseDispatcher, PulseOutcome};
use crate::error::{EngineError, EngineResult};
use crate::geometry::SampleGeometry;
use crate::holdoff::HoldOffTimer;
use crate::persistence::{PersistenceConfig, PersistenceSummary, PersistenceWorker};
use crate::types::{EngineState, EngineStats, RenderFrame, Stimulator, ANALOG_CHANNELS};
use acquisition::LoopContext;
use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Host-side options that are not part of the run configuration
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Frames kept for the render consumer before the oldest is dropped
    pub render_queue_capacity: usize,
    /// Output folder and file naming; `None` disables recording
    pub recording: Option<PersistenceConfig>,
    /// Open the first file as soon as acquisition starts
    pub record_on_start: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            render_queue_capacity: 64,
            recording: None,
            record_on_start: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct EngineCounters {
    pub chunks: AtomicU64,
    pub samples: AtomicU64,
    pub ascending: AtomicU64,
    pub descending: AtomicU64,
    pub pulses_fired: AtomicU64,
    pub pulses_dropped: AtomicU64,
    pub render_dropped: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self, uptime_seconds: Option<f64>) -> EngineStats {
        EngineStats {
            chunks_acquired: self.chunks.load(Ordering::Relaxed),
            samples_acquired: self.samples.load(Ordering::Relaxed),
            ascending_crossings: self.ascending.load(Ordering::Relaxed),
            descending_crossings: self.descending.load(Ordering::Relaxed),
            pulses_fired: self.pulses_fired.load(Ordering::Relaxed),
            pulses_dropped: self.pulses_dropped.load(Ordering::Relaxed),
            render_frames_dropped: self.render_dropped.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }
}

/// Result of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub stats: EngineStats,
    pub recording: Option<PersistenceSummary>,
    /// Fatal error that ended the run, if any
    pub error: Option<String>,
}

pub struct AcquisitionEngine {
    pub id: String,
    config: RunConfiguration,
    options: EngineOptions,
    device: Arc<dyn DaqDevice>,

    // State
    state: Arc<RwLock<EngineState>>,
    is_running: Arc<AtomicBool>,
    stop_signal: Arc<AtomicBool>,
    cancel_token: CancellationToken,

    // Statistics
    counters: Arc<EngineCounters>,
    start_time: Arc<RwLock<Option<Instant>>>,
    started_at: Option<DateTime<Utc>>,

    events: EventSink,
    render_queue: Arc<DropOldestQueue<RenderFrame>>,

    // Per-run workers
    pipeline: Option<Arc<Mutex<AcquisitionPipeline>>>,
    control_tx: Option<Sender<ControlCommand>>,
    loop_handle: Option<JoinHandle<EngineResult<()>>>,
    dispatcher: Option<PulseDispatcher>,
    persistence: Option<PersistenceWorker>,
}

impl AcquisitionEngine {
    pub fn new(config: RunConfiguration, device: Arc<dyn DaqDevice>, options: EngineOptions) -> Self {
        let render_queue = Arc::new(DropOldestQueue::new(options.render_queue_capacity));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            options,
            device,
            state: Arc::new(RwLock::new(EngineState::Idle)),
            is_running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(AtomicBool::new(false)),
            cancel_token: CancellationToken::new(),
            counters: Arc::new(EngineCounters::default()),
            start_time: Arc::new(RwLock::new(None)),
            started_at: None,
            events: EventSink::default(),
            render_queue,
            pipeline: None,
            control_tx: None,
            loop_handle: None,
            dispatcher: None,
            persistence: None,
        }
    }

    /// Set event callback function
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        self.events.set(callback);
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write() = state.clone();
        self.events.emit(EngineEvent::StateChanged {
            run_id: self.id.clone(),
            state,
        });
    }

    /// Validate, open the hardware and start acquiring
    pub async fn start(&mut self) -> EngineResult<()> {
        if self.is_running.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyRunning);
        }

        self.config.validate()?;
        if self.config.device != self.device.name() {
            return Err(DeviceError::NotFound(self.config.device.clone()).into());
        }
        let handle =
            Handle::try_current().map_err(|e| EngineError::RuntimeUnavailable(e.to_string()))?;

        log::info!(
            "Starting acquisition {} on {} at {} Hz ({} s window)",
            self.id,
            self.config.device,
            self.config.sample_rate,
            self.config.max_duration
        );

        // Fresh token and counters for this run
        self.cancel_token = CancellationToken::new();
        self.counters = Arc::new(EngineCounters::default());
        self.render_queue.clear();
        self.set_state(EngineState::Starting);

        match self.launch(&handle) {
            Ok(()) => {
                log::info!("Acquisition started");
                Ok(())
            }
            Err(e) => {
                log::error!("Acquisition failed to start: {}", e);
                self.cancel_token.cancel();
                self.set_state(EngineState::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn launch(&mut self, handle: &Handle) -> EngineResult<()> {
        let mut session = self
            .device
            .open_analog(0..ANALOG_CHANNELS, self.config.voltage_range)?;
        session.configure_clock(
            self.config.sample_rate,
            ClockMode::Continuous,
            self.config.samples_per_iteration,
        )?;

        let hold_off = HoldOffTimer::for_clock(
            self.config.hold_off_clock,
            self.config.hold_off,
            self.config.sample_rate,
            Some((handle.clone(), self.cancel_token.child_token())),
        );
        let pipeline = Arc::new(Mutex::new(AcquisitionPipeline::new(
            self.config.clone(),
            hold_off,
        )?));

        let persistence = self
            .options
            .recording
            .clone()
            .map(PersistenceWorker::spawn)
            .transpose()?;

        let dispatcher = {
            let counters = Arc::clone(&self.counters);
            let events = self.events.clone();
            let run_id = self.id.clone();
            PulseDispatcher::spawn(
                handle,
                Arc::clone(&self.device),
                self.cancel_token.clone(),
                move |outcome: PulseOutcome| {
                    match &outcome {
                        PulseOutcome::Fired { .. } => {
                            counters.pulses_fired.fetch_add(1, Ordering::Relaxed);
                        }
                        PulseOutcome::Dropped {
                            stimulator, reason, ..
                        } => {
                            log::warn!(
                                "Stimulator {} pulse dropped: {}",
                                stimulator.number(),
                                reason
                            );
                            counters.pulses_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        PulseOutcome::Cancelled { stimulator, .. } => {
                            log::debug!("Stimulator {} pulse cancelled", stimulator.number());
                        }
                    }
                    events.emit(EngineEvent::Pulse {
                        run_id: run_id.clone(),
                        outcome,
                    });
                },
            )
        };

        let (control_tx, control_rx) = unbounded();
        if self.options.record_on_start && persistence.is_some() {
            control_tx
                .send(ControlCommand::StartRecording)
                .map_err(|_| EngineError::ChannelClosed)?;
        }

        self.stop_signal.store(false, Ordering::Release);
        self.is_running.store(true, Ordering::Release);
        *self.start_time.write() = Some(Instant::now());
        self.started_at = Some(Utc::now());
        self.set_state(EngineState::Running {
            started_at: Utc::now().timestamp() as f64,
        });

        let context = LoopContext {
            run_id: self.id.clone(),
            session,
            pipeline: Arc::clone(&pipeline),
            control: control_rx,
            stop_signal: Arc::clone(&self.stop_signal),
            pulses: dispatcher.sender(),
            persistence: persistence.as_ref().map(|p| p.sender()),
            recording_folder: persistence.as_ref().map(|p| p.config().folder.clone()),
            render: Arc::clone(&self.render_queue),
            counters: Arc::clone(&self.counters),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
        };
        let loop_handle = std::thread::Builder::new()
            .name("loopstim-acquisition".to_string())
            .spawn(move || acquisition::run_loop(context));
        let loop_handle = match loop_handle {
            Ok(h) => h,
            Err(e) => {
                self.is_running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        self.pipeline = Some(pipeline);
        self.control_tx = Some(control_tx);
        self.loop_handle = Some(loop_handle);
        self.dispatcher = Some(dispatcher);
        self.persistence = persistence;
        Ok(())
    }

    /// Stop acquiring, cancel timers and pulses, flush and post-process recordings
    pub async fn stop(&mut self) -> EngineResult<RunSummary> {
        if !self.is_running.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }

        log::info!("Stopping acquisition: {}", self.id);
        let failed_early = matches!(*self.state.read(), EngineState::Error { .. });
        if !failed_early {
            self.set_state(EngineState::Stopping);
        }

        // (a) no further hardware reads
        self.stop_signal.store(true, Ordering::Release);
        self.control_tx = None;
        let mut error = None;
        if let Some(handle) = self.loop_handle.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error = Some(e.to_string()),
                Ok(Err(_)) => error = Some("acquisition thread panicked".to_string()),
                Err(e) => error = Some(format!("failed to join acquisition thread: {}", e)),
            }
        }

        // (b) hold-off and pending pulses
        self.cancel_token.cancel();
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.lock().halt();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown().await;
        }

        // (c) flush recordings and run the post-pass
        let recording = match self.persistence.take() {
            Some(worker) => match tokio::task::spawn_blocking(move || worker.finish()).await {
                Ok(Ok(summary)) => Some(summary),
                Ok(Err(e)) => {
                    log::error!("Recording finalization failed: {}", e);
                    error.get_or_insert_with(|| e.to_string());
                    None
                }
                Err(e) => {
                    error.get_or_insert_with(|| format!("persistence task failed: {}", e));
                    None
                }
            },
            None => None,
        };

        let uptime = (*self.start_time.read()).map(|t| t.elapsed().as_secs_f64());
        let stats = self.counters.snapshot(uptime);
        self.is_running.store(false, Ordering::Release);

        match &error {
            Some(message) => self.set_state(EngineState::Error {
                message: message.clone(),
            }),
            None => self.set_state(EngineState::Stopped),
        }

        log::info!(
            "Acquisition stopped: {} chunks, {} ascending, {} pulses",
            stats.chunks_acquired,
            stats.ascending_crossings,
            stats.pulses_fired
        );

        Ok(RunSummary {
            run_id: self.id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            stats,
            recording,
            error,
        })
    }

    fn send(&self, command: ControlCommand) -> EngineResult<()> {
        let tx = self.control_tx.as_ref().ok_or(EngineError::NotRunning)?;
        tx.send(command).map_err(|_| EngineError::ChannelClosed)
    }

    /// Change the sample rate; the buffer is reallocated and detection restarts
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> EngineResult<()> {
        SampleGeometry::new(
            sample_rate,
            self.config.max_duration,
            self.config.samples_per_iteration,
        )?;
        self.config.sample_rate = sample_rate;
        if self.is_running() {
            self.send(ControlCommand::SetSampleRate { sample_rate })?;
        }
        Ok(())
    }

    /// Change the window length; the buffer is reallocated and detection restarts
    pub fn set_duration(&mut self, max_duration: f64) -> EngineResult<()> {
        SampleGeometry::new(
            self.config.sample_rate,
            max_duration,
            self.config.samples_per_iteration,
        )?;
        self.config.max_duration = max_duration;
        if self.is_running() {
            self.send(ControlCommand::SetDuration { max_duration })?;
        }
        Ok(())
    }

    pub fn set_active_channel(&mut self, channel: usize) -> EngineResult<()> {
        validate_channel(channel)?;
        self.config.active_channel = channel;
        if self.is_running() {
            self.send(ControlCommand::SetActiveChannel { channel })?;
        }
        Ok(())
    }

    pub fn set_stimulator_armed(&mut self, stimulator: Stimulator, armed: bool) -> EngineResult<()> {
        self.config.stimulator_mut(stimulator).armed = armed;
        if self.is_running() {
            self.send(ControlCommand::SetStimulatorArmed { stimulator, armed })?;
        }
        Ok(())
    }

    /// Open the next rotated output file
    pub fn start_recording(&self) -> EngineResult<()> {
        if self.options.recording.is_none() {
            return Err(EngineError::InvalidConfig(
                "No recording folder configured".to_string(),
            ));
        }
        self.send(ControlCommand::StartRecording)
    }

    pub fn stop_recording(&self) -> EngineResult<()> {
        self.send(ControlCommand::StopRecording)
    }

    pub fn run_id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn get_state(&self) -> EngineState {
        self.state.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Whether the producer thread is still reading from the hardware
    pub fn is_acquiring(&self) -> bool {
        self.loop_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn get_stats(&self) -> EngineStats {
        let uptime = (*self.start_time.read()).map(|t| t.elapsed().as_secs_f64());
        self.counters.snapshot(uptime)
    }

    /// Frames for the render consumer, newest last
    pub fn render_frames(&self) -> Arc<DropOldestQueue<RenderFrame>> {
        Arc::clone(&self.render_queue)
    }

    /// Newest `length` samples of every channel, or `None` when not running
    pub fn latest_window(&self, length: usize) -> Option<BufferWindow> {
        self.pipeline.as_ref().map(|p| p.lock().latest(length))
    }

    pub fn detector_phase(&self) -> Option<DetectorPhase> {
        self.pipeline.as_ref().map(|p| p.lock().detector_phase())
    }

    /// Cycle of the latest ascending crossing
    pub fn current_cycle(&self) -> Option<u32> {
        self.pipeline.as_ref().map(|p| p.lock().cycle())
    }

    /// Get the cancellation token for external cancellation support
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        if self.is_running.load(Ordering::Acquire) {
            log::warn!("Acquisition {} dropped while running", self.id);
            self.stop_signal.store(true, Ordering::Release);
            self.cancel_token.cancel();
        }
    }
}

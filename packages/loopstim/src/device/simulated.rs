// Simulated acquisition device
//
// Produces waveforms at the configured sample clock and records every digital
// write with its wall-clock instant. Useful for:
// - Running the engine without hardware
// - Replaying recorded sessions through the detector
// - Injecting driver faults in tests

use super::{AnalogSession, ClockMode, DaqDevice, DeviceError, DigitalOutput, Waveform};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How the simulated clock paces blocking reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Reads block until the samples would have been digitized
    #[default]
    RealTime,
    /// Reads return immediately
    FreeRunning,
}

/// Faults injected into the simulated driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatedFaults {
    /// Analog sessions cannot be opened
    #[serde(default)]
    pub busy: bool,

    /// Every read after this many successful reads fails
    #[serde(default)]
    pub fail_after_reads: Option<u64>,

    /// The read with this 1-based number returns one sample too few
    #[serde(default)]
    pub short_read_at: Option<u64>,

    /// Digital lines that fail to open
    #[serde(default)]
    pub failing_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedConfig {
    #[serde(default)]
    pub pacing: Pacing,

    /// Clock speed multiplier for real-time pacing
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Waveform per analog channel; unlisted channels read 0 V
    #[serde(default)]
    pub channels: BTreeMap<usize, Waveform>,

    #[serde(default)]
    pub faults: SimulatedFaults,
}

fn default_speed() -> f64 {
    1.0
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::RealTime,
            speed: default_speed(),
            channels: BTreeMap::new(),
            faults: SimulatedFaults::default(),
        }
    }
}

impl SimulatedConfig {
    pub fn with_channel(mut self, channel: usize, waveform: Waveform) -> Self {
        self.channels.insert(channel, waveform);
        self
    }

    pub fn free_running(mut self) -> Self {
        self.pacing = Pacing::FreeRunning;
        self
    }
}

/// One digital write observed by the simulated device
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalWrite {
    pub line: String,
    pub value: bool,
    pub at: Instant,
}

/// Shared log of digital writes, cloneable out of the device before it is handed to the engine
#[derive(Debug, Clone, Default)]
pub struct DigitalRecorder {
    writes: Arc<Mutex<Vec<DigitalWrite>>>,
}

impl DigitalRecorder {
    pub fn writes(&self) -> Vec<DigitalWrite> {
        self.writes.lock().clone()
    }

    /// Instants of rising edges on `line`
    pub fn pulses(&self, line: &str) -> Vec<Instant> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.line == line && w.value)
            .map(|w| w.at)
            .collect()
    }

    fn record(&self, line: &str, value: bool) {
        self.writes.lock().push(DigitalWrite {
            line: line.to_string(),
            value,
            at: Instant::now(),
        });
    }
}

pub struct SimulatedDevice {
    name: String,
    config: SimulatedConfig,
    recorder: DigitalRecorder,
    analog_in_use: Arc<AtomicBool>,
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>, config: SimulatedConfig) -> Self {
        Self {
            name: name.into(),
            config,
            recorder: DigitalRecorder::default(),
            analog_in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn recorder(&self) -> DigitalRecorder {
        self.recorder.clone()
    }
}

impl DaqDevice for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_analog(
        &self,
        channels: Range<usize>,
        voltage_range: (f64, f64),
    ) -> Result<Box<dyn AnalogSession>, DeviceError> {
        if self.config.faults.busy {
            return Err(DeviceError::Busy(self.name.clone()));
        }
        if !self.config.speed.is_finite() || self.config.speed <= 0.0 {
            return Err(DeviceError::Io(format!(
                "{}: clock speed must be > 0, got {}",
                self.name, self.config.speed
            )));
        }
        if self.analog_in_use.swap(true, Ordering::AcqRel) {
            return Err(DeviceError::Busy(format!(
                "{}: analog input already reserved",
                self.name
            )));
        }

        let mut waveforms = Vec::with_capacity(channels.len());
        for channel in channels.clone() {
            let waveform = self
                .config
                .channels
                .get(&channel)
                .cloned()
                .unwrap_or_default()
                .load();
            match waveform {
                Ok(w) => waveforms.push(w),
                Err(e) => {
                    self.analog_in_use.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }

        log::debug!(
            "Opened simulated analog session on {} (ai{}:{}, {:?} V)",
            self.name,
            channels.start,
            channels.end.saturating_sub(1),
            voltage_range
        );

        Ok(Box::new(SimulatedSession {
            waveforms,
            voltage_range,
            pacing: self.config.pacing,
            speed: self.config.speed,
            faults: self.config.faults.clone(),
            sample_rate: None,
            position: 0,
            reads: 0,
            clock_origin: None,
            in_use: Arc::clone(&self.analog_in_use),
        }))
    }

    fn open_digital(&self, line: &str) -> Result<Box<dyn DigitalOutput>, DeviceError> {
        if line.trim().is_empty() {
            return Err(DeviceError::NotFound(format!("{}/<no line>", self.name)));
        }
        if self.config.faults.failing_lines.iter().any(|l| l == line) {
            return Err(DeviceError::Io(format!(
                "{}/{}: line cannot be reserved",
                self.name, line
            )));
        }
        Ok(Box::new(SimulatedLine {
            line: line.to_string(),
            recorder: self.recorder.clone(),
        }))
    }
}

struct SimulatedSession {
    waveforms: Vec<Waveform>,
    voltage_range: (f64, f64),
    pacing: Pacing,
    speed: f64,
    faults: SimulatedFaults,
    sample_rate: Option<f64>,
    /// Samples produced so far; the signal continues across clock changes
    position: u64,
    reads: u64,
    /// (instant, position) the current clock started at
    clock_origin: Option<(Instant, u64)>,
    in_use: Arc<AtomicBool>,
}

impl SimulatedSession {
    fn wait_for_samples(&self, sample_rate: f64, end_position: u64) {
        if self.pacing != Pacing::RealTime {
            return;
        }
        if let Some((origin, base)) = self.clock_origin {
            let elapsed_samples = (end_position - base) as f64;
            let due = origin + Duration::from_secs_f64(elapsed_samples / (sample_rate * self.speed));
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
    }
}

impl AnalogSession for SimulatedSession {
    fn configure_clock(
        &mut self,
        sample_rate: f64,
        mode: ClockMode,
        samples_per_channel: usize,
    ) -> Result<(), DeviceError> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(DeviceError::Io(format!(
                "sample clock rejected rate {}",
                sample_rate
            )));
        }
        if mode != ClockMode::Continuous {
            log::warn!("Simulated device only runs a continuous clock; {:?} ignored", mode);
        }
        self.sample_rate = Some(sample_rate);
        self.clock_origin = Some((Instant::now(), self.position));
        log::debug!(
            "Simulated clock at {} Hz, {} samples per channel",
            sample_rate,
            samples_per_channel
        );
        Ok(())
    }

    fn read(&mut self, samples_per_channel: usize) -> Result<Vec<Vec<f64>>, DeviceError> {
        let sample_rate = self
            .sample_rate
            .ok_or_else(|| DeviceError::Io("sample clock not configured".to_string()))?;

        self.reads += 1;
        if let Some(limit) = self.faults.fail_after_reads {
            if self.reads > limit {
                return Err(DeviceError::Io(format!(
                    "simulated read failure on read {}",
                    self.reads
                )));
            }
        }
        let count = if self.faults.short_read_at == Some(self.reads) {
            samples_per_channel.saturating_sub(1)
        } else {
            samples_per_channel
        };

        let start = self.position;
        let end = start + count as u64;
        self.wait_for_samples(sample_rate, end);

        let (v_min, v_max) = self.voltage_range;
        let samples = self
            .waveforms
            .iter()
            .map(|w| {
                (start..end)
                    .map(|tick| w.value_at(tick, sample_rate).clamp(v_min, v_max))
                    .collect()
            })
            .collect();
        self.position = end;
        Ok(samples)
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
    }
}

struct SimulatedLine {
    line: String,
    recorder: DigitalRecorder,
}

impl DigitalOutput for SimulatedLine {
    fn write(&mut self, value: bool) -> Result<(), DeviceError> {
        self.recorder.record(&self.line, value);
        Ok(())
    }
}

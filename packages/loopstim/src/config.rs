// Run configuration for one acquisition session
//
// `RunConfiguration` is fixed for the lifetime of a run. The only values that
// may change while acquiring are the ones routed through the engine's control
// commands (sample rate, window duration, active channel, recording, arming),
// each of which triggers the documented reset.

use crate::error::{EngineError, EngineResult};
use crate::types::{Stimulator, ANALOG_CHANNELS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Largest cycle count selectable on the front panel
pub const MAX_CYCLE_COUNT_LIMIT: u32 = 10;

/// Clock domain used to time the hold-off window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HoldOffClock {
    /// One-shot timer on the scheduler, measured in wall-clock time
    #[default]
    Wall,
    /// Deadline counted in hardware sample ticks
    Samples,
}

/// Per-stimulator trigger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulatorConfig {
    /// Cycle numbers (1-based) on which this stimulator fires
    #[serde(default)]
    pub fire_on: BTreeSet<u32>,

    /// Output switch; a disarmed stimulator records a tag instead of pulsing
    #[serde(default = "default_armed")]
    pub armed: bool,

    /// Digital line on the acquisition device
    pub line: String,
}

fn default_armed() -> bool {
    true
}

impl StimulatorConfig {
    pub fn for_stimulator(stimulator: Stimulator) -> Self {
        Self {
            fire_on: BTreeSet::new(),
            armed: true,
            line: stimulator.default_line().to_string(),
        }
    }

    /// A stimulator takes part in cycle bookkeeping only if it has at least one cycle selected
    pub fn is_active(&self) -> bool {
        !self.fire_on.is_empty()
    }
}

/// Complete configuration of one acquisition run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Acquisition device name (empty means no device selected)
    pub device: String,

    /// Sample rate in Hz
    pub sample_rate: f64,

    /// Length of the circular window in seconds
    pub max_duration: f64,

    /// Samples per channel returned by each hardware read
    #[serde(default = "default_samples_per_iteration")]
    pub samples_per_iteration: usize,

    /// Analog input range in volts
    #[serde(default = "default_voltage_range")]
    pub voltage_range: (f64, f64),

    /// Channel watched by the crossing detector (0-based)
    pub active_channel: usize,

    /// Detection threshold in volts
    pub threshold: f64,

    /// Extra margin above threshold required to confirm an ascending crossing
    pub hysteresis_up: f64,

    /// Margin below threshold required to confirm a descending crossing
    pub hysteresis_down: f64,

    /// Refractory window after an ascending crossing, in seconds
    pub hold_off: f64,

    #[serde(default)]
    pub hold_off_clock: HoldOffClock,

    /// Delay between an ascending crossing and the stimulus pulse, in seconds
    pub trigger_delay: f64,

    /// Cycle counter modulus (1..=10)
    pub max_cycle_count: u32,

    pub stimulators: [StimulatorConfig; 3],
}

fn default_samples_per_iteration() -> usize {
    20
}

fn default_voltage_range() -> (f64, f64) {
    (-10.0, 10.0)
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            device: "Dev1".to_string(),
            sample_rate: 3300.0,
            max_duration: 20.0,
            samples_per_iteration: default_samples_per_iteration(),
            voltage_range: default_voltage_range(),
            active_channel: 0,
            threshold: 0.0,
            hysteresis_up: 0.0,
            hysteresis_down: 0.0,
            hold_off: 0.0,
            hold_off_clock: HoldOffClock::Wall,
            trigger_delay: 0.0,
            max_cycle_count: 1,
            stimulators: [
                StimulatorConfig::for_stimulator(Stimulator::S1),
                StimulatorConfig::for_stimulator(Stimulator::S2),
                StimulatorConfig::for_stimulator(Stimulator::S3),
            ],
        }
    }
}

impl RunConfiguration {
    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: RunConfiguration = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn stimulator(&self, stimulator: Stimulator) -> &StimulatorConfig {
        &self.stimulators[stimulator.index()]
    }

    pub fn stimulator_mut(&mut self, stimulator: Stimulator) -> &mut StimulatorConfig {
        &mut self.stimulators[stimulator.index()]
    }

    /// Reject configurations that must never reach the acquisition loop
    pub fn validate(&self) -> EngineResult<()> {
        if self.device.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "No acquisition device selected".to_string(),
            ));
        }
        validate_sample_rate(self.sample_rate)?;
        validate_duration(self.max_duration)?;

        let capacity = (self.max_duration * self.sample_rate).round();
        if capacity < 1.0 {
            return Err(EngineError::InvalidConfig(format!(
                "Window of {} s at {} Hz holds no samples",
                self.max_duration, self.sample_rate
            )));
        }
        if self.samples_per_iteration == 0 {
            return Err(EngineError::InvalidConfig(
                "samples_per_iteration must be at least 1".to_string(),
            ));
        }
        if self.samples_per_iteration as f64 > capacity {
            return Err(EngineError::InvalidConfig(format!(
                "samples_per_iteration ({}) exceeds buffer capacity ({})",
                self.samples_per_iteration, capacity
            )));
        }
        let (v_min, v_max) = self.voltage_range;
        if !(v_min < v_max) {
            return Err(EngineError::InvalidConfig(format!(
                "Invalid voltage range [{}, {}]",
                v_min, v_max
            )));
        }
        validate_channel(self.active_channel)?;
        if !self.threshold.is_finite() {
            return Err(EngineError::InvalidConfig(
                "Threshold must be finite".to_string(),
            ));
        }
        for (name, value) in [
            ("hysteresis_up", self.hysteresis_up),
            ("hysteresis_down", self.hysteresis_down),
            ("hold_off", self.hold_off),
            ("trigger_delay", self.trigger_delay),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.max_cycle_count == 0 || self.max_cycle_count > MAX_CYCLE_COUNT_LIMIT {
            return Err(EngineError::InvalidConfig(format!(
                "max_cycle_count must be in 1..={}, got {}",
                MAX_CYCLE_COUNT_LIMIT, self.max_cycle_count
            )));
        }
        for stimulator in Stimulator::ALL {
            let stim = self.stimulator(stimulator);
            if let Some(cycle) = stim
                .fire_on
                .iter()
                .find(|&&c| c == 0 || c > self.max_cycle_count)
            {
                return Err(EngineError::InvalidConfig(format!(
                    "Stimulator {} fires on cycle {} outside 1..={}",
                    stimulator.number(),
                    cycle,
                    self.max_cycle_count
                )));
            }
            if stim.is_active() && stim.line.trim().is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "Stimulator {} has no digital line",
                    stimulator.number()
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_sample_rate(sample_rate: f64) -> EngineResult<()> {
    if !sample_rate.is_finite() || sample_rate <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "Sample rate must be > 0 Hz, got {}",
            sample_rate
        )));
    }
    Ok(())
}

pub(crate) fn validate_duration(duration: f64) -> EngineResult<()> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "Window duration must be > 0 s, got {}",
            duration
        )));
    }
    Ok(())
}

pub(crate) fn validate_channel(channel: usize) -> EngineResult<()> {
    if channel >= ANALOG_CHANNELS {
        return Err(EngineError::InvalidConfig(format!(
            "Active channel {} out of range 0..{}",
            channel, ANALOG_CHANNELS
        )));
    }
    Ok(())
}

/// Settings as entered on the front panel (times in milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelSettings {
    pub device: String,
    pub sample_rate_hz: f64,
    pub window_secs: f64,
    pub active_channel: usize,
    pub threshold_v: f64,
    pub hysteresis_up_v: f64,
    pub hysteresis_down_v: f64,
    pub hold_off_ms: f64,
    pub trigger_delay_ms: f64,
    pub max_cycle_count: u32,
    /// Selected cycle buttons per stimulator, indexed by stimulator
    pub cycle_buttons: [Vec<u32>; 3],
}

impl PanelSettings {
    /// Convert panel units into a validated run configuration
    pub fn into_run_configuration(self) -> EngineResult<RunConfiguration> {
        let mut config = RunConfiguration {
            device: self.device,
            sample_rate: self.sample_rate_hz,
            max_duration: self.window_secs,
            active_channel: self.active_channel,
            threshold: self.threshold_v,
            hysteresis_up: self.hysteresis_up_v,
            hysteresis_down: self.hysteresis_down_v,
            hold_off: self.hold_off_ms / 1000.0,
            trigger_delay: self.trigger_delay_ms / 1000.0,
            max_cycle_count: self.max_cycle_count,
            ..RunConfiguration::default()
        };
        for (stimulator, buttons) in Stimulator::ALL.iter().zip(self.cycle_buttons) {
            config.stimulator_mut(*stimulator).fire_on = buttons.into_iter().collect();
        }
        config.validate()?;
        Ok(config)
    }
}

// Acquisition hardware seam
//
// The engine never talks to a vendor driver directly. It opens an analog
// session and digital lines through the `DaqDevice` trait, so a new backend
// only has to implement these three traits and register a variant in
// `DeviceConfig`.
//
// Current implementations:
// - Simulated: synthesized or replayed waveforms paced by the sample clock

mod simulated;
mod waveform;

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

pub use simulated::{
    DigitalRecorder, DigitalWrite, Pacing, SimulatedConfig, SimulatedDevice, SimulatedFaults,
};
pub use waveform::Waveform;

/// Driver-level failures; surfaced to the caller, never retried
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Device I/O error: {0}")]
    Io(String),
}

/// Sample clock mode of an analog session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    /// Free-running hardware clock; reads block until enough samples arrived
    Continuous,
    /// Clock stops after one buffer of samples
    Finite,
}

/// An acquisition device able to open analog sessions and digital lines
pub trait DaqDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Open a voltage input session over `channels` (e.g. `0..13` for ai0:12)
    fn open_analog(
        &self,
        channels: Range<usize>,
        voltage_range: (f64, f64),
    ) -> Result<Box<dyn AnalogSession>, DeviceError>;

    /// Open a single digital output line (e.g. `port1/line0`)
    fn open_digital(&self, line: &str) -> Result<Box<dyn DigitalOutput>, DeviceError>;
}

/// Hardware-clocked analog input session
pub trait AnalogSession: Send {
    fn configure_clock(
        &mut self,
        sample_rate: f64,
        mode: ClockMode,
        samples_per_channel: usize,
    ) -> Result<(), DeviceError>;

    /// Block until `samples_per_channel` samples per channel are available
    ///
    /// Returns `[channel][sample]`. There is no timeout.
    fn read(&mut self, samples_per_channel: usize) -> Result<Vec<Vec<f64>>, DeviceError>;
}

/// A digital output line
pub trait DigitalOutput: Send {
    fn write(&mut self, value: bool) -> Result<(), DeviceError>;
}

/// Device backend selection, serialized as `{"<backend>": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceConfig {
    Simulated(SimulatedConfig),
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig::Simulated(SimulatedConfig::default())
    }
}

/// Build the device named by `config`
pub fn create_device(name: &str, config: DeviceConfig) -> Arc<dyn DaqDevice> {
    match config {
        DeviceConfig::Simulated(config) => Arc::new(SimulatedDevice::new(name, config)),
    }
}

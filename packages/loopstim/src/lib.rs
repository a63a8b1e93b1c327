pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod holdoff;
pub mod persistence;
pub mod types;

pub use types::*;
pub use buffer::{BufferWindow, CircularSampleBuffer, DropOldestQueue};
pub use config::{HoldOffClock, PanelSettings, RunConfiguration, StimulatorConfig};
pub use detector::{CrossDetector, DetectorPhase};
pub use device::{DaqDevice, DeviceConfig, DeviceError, SimulatedConfig, SimulatedDevice, Waveform};
pub use engine::{AcquisitionEngine, AcquisitionPipeline, EngineEvent, EngineOptions, RunSummary};
pub use error::{EngineError, EngineResult};
pub use geometry::SampleGeometry;
pub use persistence::{post_process_file, PersistenceConfig};

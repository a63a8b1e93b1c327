// Common types shared by the acquisition engine and its consumers

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of analog input channels acquired per chunk (ai0..ai12)
pub const ANALOG_CHANNELS: usize = 13;

/// Number of derived marker channels kept next to the analog data
pub const MARKER_CHANNELS: usize = 5;

/// Marker value written on `cross_up`/`cross_down` and on a stimulus track when a pulse fires
pub const MARK_SET: f64 = 1.0;

/// Marker value written on a stimulus track for a cycle that is recorded but not stimulated
///
/// Recordings from the earlier rig software use the same 1.5 tag value.
pub const MARK_TAG: f64 = 1.5;

/// One of the three digital-output stimulators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stimulator {
    #[serde(rename = "1")]
    S1,
    #[serde(rename = "2")]
    S2,
    #[serde(rename = "3")]
    S3,
}

impl Stimulator {
    pub const ALL: [Stimulator; 3] = [Stimulator::S1, Stimulator::S2, Stimulator::S3];

    /// 1-based stimulator number as shown on the front panel
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn index(self) -> usize {
        match self {
            Stimulator::S1 => 0,
            Stimulator::S2 => 1,
            Stimulator::S3 => 2,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Stimulator::S1),
            2 => Some(Stimulator::S2),
            3 => Some(Stimulator::S3),
            _ => None,
        }
    }

    /// Marker channel that records this stimulator's pulses and tags
    pub fn marker(self) -> MarkerChannel {
        match self {
            Stimulator::S1 => MarkerChannel::Stim1,
            Stimulator::S2 => MarkerChannel::Stim2,
            Stimulator::S3 => MarkerChannel::Stim3,
        }
    }

    /// Digital line wired to this stimulator on the reference setup
    pub fn default_line(self) -> &'static str {
        match self {
            Stimulator::S1 => "port1/line0",
            Stimulator::S2 => "port1/line1",
            Stimulator::S3 => "port1/line2",
        }
    }
}

/// Derived marker channels stored alongside the analog samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerChannel {
    CrossUp,
    CrossDown,
    Stim1,
    Stim2,
    Stim3,
}

impl MarkerChannel {
    pub const ALL: [MarkerChannel; MARKER_CHANNELS] = [
        MarkerChannel::CrossUp,
        MarkerChannel::CrossDown,
        MarkerChannel::Stim1,
        MarkerChannel::Stim2,
        MarkerChannel::Stim3,
    ];

    pub fn index(self) -> usize {
        match self {
            MarkerChannel::CrossUp => 0,
            MarkerChannel::CrossDown => 1,
            MarkerChannel::Stim1 => 2,
            MarkerChannel::Stim2 => 3,
            MarkerChannel::Stim3 => 4,
        }
    }

    /// Column label used in persisted files
    pub fn label(self) -> &'static str {
        match self {
            MarkerChannel::CrossUp => "UP",
            MarkerChannel::CrossDown => "DOWN",
            MarkerChannel::Stim1 => "STIM 1",
            MarkerChannel::Stim2 => "STIM 2",
            MarkerChannel::Stim3 => "STIM 3",
        }
    }
}

/// Direction of a threshold crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossingKind {
    Ascending,
    Descending,
}

impl CrossingKind {
    pub fn marker(self) -> MarkerChannel {
        match self {
            CrossingKind::Ascending => MarkerChannel::CrossUp,
            CrossingKind::Descending => MarkerChannel::CrossDown,
        }
    }
}

/// A detected threshold crossing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Crossing {
    pub kind: CrossingKind,
    /// Position in the circular buffer
    pub sample_index: usize,
    /// Absolute sample count since the current geometry was allocated
    pub tick: u64,
    /// Buffer-relative time in seconds (`sample_index * sample_period`)
    pub time: f64,
    /// Cycle number assigned by the coordinator (ascending crossings only)
    pub cycle: Option<u32>,
}

/// Request to emit one TTL pulse on a stimulator line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulationCommand {
    pub stimulator: Stimulator,
    /// Buffer-relative target time in seconds (`crossing.time + trigger_delay`)
    pub target_time: f64,
    /// Digital line on the acquisition device
    pub line: String,
    /// Requested delay between crossing and pulse
    pub delay_secs: f64,
}

/// One fixed-size block of samples delivered by a hardware read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChunk {
    /// Multi-channel samples: samples[channel_idx][sample_idx]
    pub samples: Vec<Vec<f64>>,
    /// Absolute tick of the first sample
    pub start_tick: u64,
    /// Sequence number of the read that produced this chunk
    pub sequence: u64,
}

impl DataChunk {
    pub fn num_samples(&self) -> usize {
        self.samples.first().map(|ch| ch.len()).unwrap_or(0)
    }

    pub fn num_channels(&self) -> usize {
        self.samples.len()
    }
}

/// Chunk copy handed to the persistence worker
#[derive(Debug, Clone)]
pub struct PersistedChunk {
    pub samples: Vec<Vec<f64>>,
    pub markers: [Vec<f64>; MARKER_CHANNELS],
}

impl PersistedChunk {
    pub fn num_rows(&self) -> usize {
        self.samples.first().map(|ch| ch.len()).unwrap_or(0)
    }

    /// Row `i` across all analog channels followed by the marker channels
    pub fn row(&self, i: usize) -> impl Iterator<Item = f64> + '_ {
        self.samples
            .iter()
            .map(move |ch| ch[i])
            .chain(self.markers.iter().map(move |m| m[i]))
    }
}

/// Frame handed to the render consumer after each producer iteration
#[derive(Debug, Clone)]
pub struct RenderFrame {
    pub chunk: Arc<DataChunk>,
    /// Buffer index the chunk was written at
    pub write_index: usize,
}

/// Lifecycle state of an acquisition run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum EngineState {
    Idle,
    Starting,
    Running { started_at: f64 },
    Stopping,
    Stopped,
    Error { message: String },
}

impl Default for EngineState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Counters for one acquisition run
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineStats {
    pub chunks_acquired: u64,
    pub samples_acquired: u64,
    pub ascending_crossings: u64,
    pub descending_crossings: u64,
    pub pulses_fired: u64,
    pub pulses_dropped: u64,
    pub render_frames_dropped: u64,
    pub uptime_seconds: Option<f64>,
}

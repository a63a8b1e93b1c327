// Events emitted by the acquisition engine

use crate::dispatcher::PulseOutcome;
use crate::types::{Crossing, EngineState, EngineStats, Stimulator};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged {
        run_id: String,
        state: EngineState,
    },
    Crossing {
        run_id: String,
        crossing: Crossing,
    },
    CycleAdvanced {
        run_id: String,
        cycle: u32,
        fired: Vec<Stimulator>,
        tagged: Vec<Stimulator>,
    },
    Pulse {
        run_id: String,
        outcome: PulseOutcome,
    },
    Reconfigured {
        run_id: String,
        sample_rate: f64,
        max_duration: f64,
        capacity: usize,
    },
    ChannelChanged {
        run_id: String,
        channel: usize,
    },
    RecordingStarted {
        run_id: String,
        folder: PathBuf,
    },
    RecordingStopped {
        run_id: String,
    },
    StatsUpdate {
        run_id: String,
        stats: EngineStats,
    },
    Error {
        run_id: String,
        error: String,
    },
}

type Callback = Box<dyn Fn(EngineEvent) + Send + Sync>;

/// Shared slot for the event callback; cloned into every worker
#[derive(Clone, Default)]
pub struct EventSink {
    callback: Arc<RwLock<Option<Callback>>>,
}

impl EventSink {
    pub fn set<F>(&self, callback: F)
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Box::new(callback));
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(callback) = self.callback.read().as_ref() {
            callback(event);
        }
    }
}

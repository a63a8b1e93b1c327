// Stimulation coordinator
//
// Owns the cycle counter. Every ascending crossing opens a new cycle; each
// stimulator with at least one selected cycle then gets exactly one outcome for
// that cycle: a pulse when the cycle is selected and the output is armed, a
// tag otherwise.

use crate::config::{RunConfiguration, StimulatorConfig};
use crate::types::{Crossing, MarkerChannel, StimulationCommand, Stimulator, MARK_SET, MARK_TAG};
use serde::{Deserialize, Serialize};

/// What one stimulator does in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulationDecision {
    pub stimulator: Stimulator,
    pub fires: bool,
    /// Absolute tick the pulse or tag is recorded at
    pub mark_tick: u64,
    pub command: Option<StimulationCommand>,
}

impl StimulationDecision {
    pub fn marker(&self) -> MarkerChannel {
        self.stimulator.marker()
    }

    pub fn mark_value(&self) -> f64 {
        if self.fires {
            MARK_SET
        } else {
            MARK_TAG
        }
    }
}

/// Result of advancing the counter on an ascending crossing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub cycle: u32,
    pub decisions: Vec<StimulationDecision>,
}

impl CycleOutcome {
    pub fn fired(&self) -> Vec<Stimulator> {
        self.decisions
            .iter()
            .filter(|d| d.fires)
            .map(|d| d.stimulator)
            .collect()
    }

    pub fn tagged(&self) -> Vec<Stimulator> {
        self.decisions
            .iter()
            .filter(|d| !d.fires)
            .map(|d| d.stimulator)
            .collect()
    }

    pub fn commands(&self) -> impl Iterator<Item = &StimulationCommand> {
        self.decisions.iter().filter_map(|d| d.command.as_ref())
    }
}

pub struct StimulationCoordinator {
    max_cycle_count: u32,
    /// 0 until the first crossing of the run
    counter: u32,
    trigger_delay: f64,
    stimulators: [StimulatorConfig; 3],
}

impl StimulationCoordinator {
    pub fn new(config: &RunConfiguration) -> Self {
        Self {
            max_cycle_count: config.max_cycle_count.max(1),
            counter: 0,
            trigger_delay: config.trigger_delay,
            stimulators: config.stimulators.clone(),
        }
    }

    /// Cycle of the most recent ascending crossing, 0 before the first one
    pub fn cycle(&self) -> u32 {
        self.counter
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    pub fn set_armed(&mut self, stimulator: Stimulator, armed: bool) {
        self.stimulators[stimulator.index()].armed = armed;
    }

    pub fn is_armed(&self, stimulator: Stimulator) -> bool {
        self.stimulators[stimulator.index()].armed
    }

    /// Samples between a crossing and its stimulus mark
    pub fn delay_samples(&self, sample_rate: f64) -> u64 {
        (self.trigger_delay * sample_rate).round().max(0.0) as u64
    }

    /// Advance the counter for `crossing` and decide each stimulator's outcome
    pub fn on_ascending(&mut self, crossing: &mut Crossing, sample_rate: f64) -> CycleOutcome {
        self.counter = if self.counter >= self.max_cycle_count {
            1
        } else {
            self.counter + 1
        };
        crossing.cycle = Some(self.counter);

        let mark_tick = crossing.tick + self.delay_samples(sample_rate);
        let decisions = Stimulator::ALL
            .iter()
            .zip(self.stimulators.iter())
            .filter(|(_, cfg)| cfg.is_active())
            .map(|(&stimulator, cfg)| {
                let fires = cfg.armed && cfg.fire_on.contains(&self.counter);
                let command = fires.then(|| StimulationCommand {
                    stimulator,
                    target_time: crossing.time + self.trigger_delay,
                    line: cfg.line.clone(),
                    delay_secs: self.trigger_delay,
                });
                StimulationDecision {
                    stimulator,
                    fires,
                    mark_tick,
                    command,
                }
            })
            .collect();

        CycleOutcome {
            cycle: self.counter,
            decisions,
        }
    }
}

// Hysteresis threshold-crossing detection on one analog channel.
//
// The detector is fed one chunk at a time by the acquisition loop and gates
// every transition on the chunk mean. When a transition fires, the crossing is
// placed at the first sample of the chunk that satisfies the same condition.
// Transitions are evaluated in order (arm, confirm ascending, confirm
// descending) so a single chunk may arm and confirm, but at most one crossing
// is emitted per chunk.

use crate::config::RunConfiguration;
use crate::geometry::SampleGeometry;
use crate::holdoff::HoldOffTimer;
use crate::types::{Crossing, CrossingKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorPhase {
    Idle,
    Armed,
    AscendingConfirmed,
}

/// Voltage levels of the detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorLevels {
    pub threshold: f64,
    pub hysteresis_up: f64,
    pub hysteresis_down: f64,
}

impl DetectorLevels {
    pub fn from_config(config: &RunConfiguration) -> Self {
        Self {
            threshold: config.threshold,
            hysteresis_up: config.hysteresis_up,
            hysteresis_down: config.hysteresis_down,
        }
    }

    /// Level a chunk must reach to confirm an ascending crossing
    pub fn upper(&self) -> f64 {
        self.threshold + self.hysteresis_up
    }

    /// Level a chunk must fall to to confirm a descending crossing
    pub fn lower(&self) -> f64 {
        self.threshold - self.hysteresis_down
    }
}

pub struct CrossDetector {
    levels: DetectorLevels,
    channel: usize,
    phase: DetectorPhase,
    hold_off: HoldOffTimer,
    last_crossing_time: Option<f64>,
}

impl CrossDetector {
    pub fn new(levels: DetectorLevels, channel: usize, hold_off: HoldOffTimer) -> Self {
        Self {
            levels,
            channel,
            phase: DetectorPhase::Idle,
            hold_off,
            last_crossing_time: None,
        }
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    /// Channel this detector is bound to
    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn levels(&self) -> DetectorLevels {
        self.levels
    }

    pub fn last_crossing_time(&self) -> Option<f64> {
        self.last_crossing_time
    }

    /// Whether the refractory window is open for a chunk starting at `tick`
    pub fn hold_off_active(&mut self, tick: u64) -> bool {
        self.hold_off.is_active(tick)
    }

    /// Back to IDLE with the hold-off cancelled
    pub fn reset(&mut self) {
        self.phase = DetectorPhase::Idle;
        self.last_crossing_time = None;
        self.hold_off.cancel();
    }

    /// Bind the detector to another channel; always starts over from IDLE
    pub fn set_channel(&mut self, channel: usize) {
        if self.phase == DetectorPhase::AscendingConfirmed {
            log::debug!(
                "Channel switch {} -> {} during an open cycle, detector reset",
                self.channel,
                channel
            );
        }
        self.channel = channel;
        self.reset();
    }

    /// Sample clock changed; buffer indices and ticks start over
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.reset();
        self.hold_off.set_sample_rate(sample_rate);
    }

    /// Evaluate one chunk of the bound channel
    ///
    /// `start_tick` and `start_index` locate the chunk's first sample on the
    /// absolute clock and in the circular buffer.
    pub fn evaluate(
        &mut self,
        chunk: &[f64],
        start_tick: u64,
        start_index: usize,
        geometry: &SampleGeometry,
    ) -> Option<Crossing> {
        if chunk.is_empty() || self.hold_off.is_active(start_tick) {
            return None;
        }

        let value = chunk.iter().sum::<f64>() / chunk.len() as f64;

        if self.phase == DetectorPhase::Idle && value >= self.levels.threshold {
            self.phase = DetectorPhase::Armed;
        }

        if self.phase == DetectorPhase::Armed && value >= self.levels.upper() {
            let upper = self.levels.upper();
            let offset = chunk.iter().position(|&v| v >= upper)?;
            let crossing = self.crossing_at(
                CrossingKind::Ascending,
                offset,
                start_tick,
                start_index,
                geometry,
            );
            self.phase = DetectorPhase::AscendingConfirmed;
            self.hold_off.arm(crossing.tick);
            return Some(crossing);
        }

        if self.phase == DetectorPhase::AscendingConfirmed && value <= self.levels.lower() {
            let lower = self.levels.lower();
            let offset = chunk.iter().position(|&v| v <= lower)?;
            let crossing = self.crossing_at(
                CrossingKind::Descending,
                offset,
                start_tick,
                start_index,
                geometry,
            );
            self.phase = DetectorPhase::Idle;
            return Some(crossing);
        }

        None
    }

    fn crossing_at(
        &mut self,
        kind: CrossingKind,
        offset: usize,
        start_tick: u64,
        start_index: usize,
        geometry: &SampleGeometry,
    ) -> Crossing {
        let sample_index = (start_index + offset) % geometry.capacity;
        let time = geometry.time_of(sample_index);
        self.last_crossing_time = Some(time);
        Crossing {
            kind,
            sample_index,
            tick: start_tick + offset as u64,
            time,
            cycle: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold: f64, up: f64, down: f64, hold_off_samples: f64) -> CrossDetector {
        CrossDetector::new(
            DetectorLevels {
                threshold,
                hysteresis_up: up,
                hysteresis_down: down,
            },
            0,
            HoldOffTimer::sample_clock(hold_off_samples / 1000.0, 1000.0),
        )
    }

    fn geometry() -> SampleGeometry {
        SampleGeometry::new(1000.0, 1.0, 4).unwrap()
    }

    #[test]
    fn test_arm_and_confirm_in_one_chunk_without_hysteresis() {
        let mut det = detector(1.0, 0.0, 0.0, 0.0);
        let crossing = det
            .evaluate(&[0.8, 1.0, 1.2, 1.4], 0, 0, &geometry())
            .expect("ascending crossing");
        assert_eq!(crossing.kind, CrossingKind::Ascending);
        assert_eq!(crossing.sample_index, 1);
        assert_eq!(det.phase(), DetectorPhase::AscendingConfirmed);
    }

    #[test]
    fn test_hysteresis_delays_confirmation() {
        let mut det = detector(1.0, 0.5, 0.0, 0.0);
        let g = geometry();
        assert!(det.evaluate(&[1.1, 1.1, 1.1, 1.1], 0, 0, &g).is_none());
        assert_eq!(det.phase(), DetectorPhase::Armed);
        // Falling back below threshold keeps the detector armed
        assert!(det.evaluate(&[0.2, 0.2, 0.2, 0.2], 4, 4, &g).is_none());
        assert_eq!(det.phase(), DetectorPhase::Armed);
        let crossing = det.evaluate(&[1.4, 1.6, 1.6, 1.6], 8, 8, &g).unwrap();
        assert_eq!(crossing.sample_index, 9);
        assert_eq!(crossing.tick, 9);
    }

    #[test]
    fn test_mean_gates_not_single_samples() {
        let mut det = detector(1.0, 0.0, 0.0, 0.0);
        // One spike above threshold with a low mean does nothing
        assert!(det.evaluate(&[0.0, 3.0, 0.0, 0.0], 0, 0, &geometry()).is_none());
        assert_eq!(det.phase(), DetectorPhase::Idle);
    }

    #[test]
    fn test_descending_needs_lower_level() {
        let mut det = detector(1.0, 0.0, 0.2, 0.0);
        let g = geometry();
        det.evaluate(&[2.0; 4], 0, 0, &g).unwrap();
        assert!(det.evaluate(&[0.9; 4], 4, 4, &g).is_none());
        let crossing = det.evaluate(&[0.9, 0.7, 0.7, 0.7], 8, 8, &g).unwrap();
        assert_eq!(crossing.kind, CrossingKind::Descending);
        assert_eq!(crossing.sample_index, 9);
        assert_eq!(det.phase(), DetectorPhase::Idle);
    }

    #[test]
    fn test_hold_off_blocks_evaluation() {
        let mut det = detector(1.0, 0.0, 0.0, 10.0);
        let g = geometry();
        let up = det.evaluate(&[2.0; 4], 0, 0, &g).unwrap();
        assert_eq!(up.tick, 0);
        // Ticks 4 and 8 are inside the 10-sample window
        assert!(det.evaluate(&[0.0; 4], 4, 4, &g).is_none());
        assert!(det.evaluate(&[0.0; 4], 8, 8, &g).is_none());
        assert_eq!(det.phase(), DetectorPhase::AscendingConfirmed);
        let down = det.evaluate(&[0.0; 4], 12, 12, &g).unwrap();
        assert_eq!(down.kind, CrossingKind::Descending);
    }

    #[test]
    fn test_crossing_index_wraps() {
        let mut det = detector(1.0, 0.0, 0.0, 0.0);
        let g = SampleGeometry::new(1000.0, 0.01, 4).unwrap();
        let crossing = det.evaluate(&[0.0, 0.0, 3.0, 3.0], 1008, 8, &g).unwrap();
        assert_eq!(crossing.sample_index, 0);
        assert_eq!(crossing.tick, 1010);
    }

    #[test]
    fn test_channel_switch_resets() {
        let mut det = detector(1.0, 0.0, 0.0, 1000.0);
        det.evaluate(&[2.0; 4], 0, 0, &geometry()).unwrap();
        assert!(det.hold_off_active(4));
        det.set_channel(3);
        assert_eq!(det.channel(), 3);
        assert_eq!(det.phase(), DetectorPhase::Idle);
        assert!(!det.hold_off_active(4));
    }
}

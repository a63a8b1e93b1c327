// Sample clock geometry: buffer capacity, chunk size and ring index arithmetic.

use crate::config::{validate_duration, validate_sample_rate, RunConfiguration};
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Derived sizes for one `(sample_rate, max_duration)` pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleGeometry {
    pub sample_rate: f64,
    pub max_duration: f64,
    /// Samples per channel held by the circular buffer (`N`)
    pub capacity: usize,
    /// Samples per channel delivered by one hardware read
    pub samples_per_iteration: usize,
}

impl SampleGeometry {
    pub fn new(
        sample_rate: f64,
        max_duration: f64,
        samples_per_iteration: usize,
    ) -> EngineResult<Self> {
        validate_sample_rate(sample_rate)?;
        validate_duration(max_duration)?;
        let capacity = (max_duration * sample_rate).round() as usize;
        if capacity == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "Window of {} s at {} Hz holds no samples",
                max_duration, sample_rate
            )));
        }
        if samples_per_iteration == 0 || samples_per_iteration > capacity {
            return Err(EngineError::InvalidConfig(format!(
                "samples_per_iteration ({}) must be in 1..={}",
                samples_per_iteration, capacity
            )));
        }
        Ok(Self {
            sample_rate,
            max_duration,
            capacity,
            samples_per_iteration,
        })
    }

    pub fn from_config(config: &RunConfiguration) -> EngineResult<Self> {
        Self::new(
            config.sample_rate,
            config.max_duration,
            config.samples_per_iteration,
        )
    }

    /// Same window, new sample rate
    pub fn with_sample_rate(&self, sample_rate: f64) -> EngineResult<Self> {
        Self::new(sample_rate, self.max_duration, self.samples_per_iteration)
    }

    /// Same sample rate, new window length
    pub fn with_duration(&self, max_duration: f64) -> EngineResult<Self> {
        Self::new(self.sample_rate, max_duration, self.samples_per_iteration)
    }

    /// Seconds between consecutive samples
    pub fn sample_period(&self) -> f64 {
        1.0 / self.sample_rate
    }

    /// Index following a block of `len` samples written at `index`
    pub fn advance(&self, index: usize, len: usize) -> usize {
        debug_assert!(index < self.capacity);
        (index + len) % self.capacity
    }

    pub fn wrap_tick(&self, tick: u64) -> usize {
        (tick % self.capacity as u64) as usize
    }

    /// Buffer-relative time of a buffer index
    pub fn time_of(&self, index: usize) -> f64 {
        index as f64 / self.sample_rate
    }

    /// Whole number of samples closest to `seconds`
    pub fn seconds_to_samples(&self, seconds: f64) -> u64 {
        (seconds * self.sample_rate).round().max(0.0) as u64
    }

    /// Split `len` samples starting at `index` into at most two non-wrapping ranges
    pub fn segments(&self, index: usize, len: usize) -> (Range<usize>, Option<Range<usize>>) {
        assert!(index < self.capacity, "index {} outside buffer", index);
        assert!(len <= self.capacity, "block of {} exceeds buffer", len);
        let end = index + len;
        if end <= self.capacity {
            (index..end, None)
        } else {
            (index..self.capacity, Some(0..end - self.capacity))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_capacity() {
        let geometry = SampleGeometry::new(3300.0, 20.0, 20).unwrap();
        assert_eq!(geometry.capacity, 66000);
        assert_eq!(geometry.seconds_to_samples(0.05), 165);
    }

    #[test]
    fn test_capacity_rounds() {
        let geometry = SampleGeometry::new(1000.0, 0.0125, 1).unwrap();
        assert_eq!(geometry.capacity, 13);
    }

    #[test]
    fn test_advance_wraps() {
        let geometry = SampleGeometry::new(100.0, 1.0, 30).unwrap();
        assert_eq!(geometry.advance(0, 30), 30);
        assert_eq!(geometry.advance(90, 30), 20);
        assert_eq!(geometry.advance(70, 30), 0);
    }

    #[test]
    fn test_segments_split_at_boundary() {
        let geometry = SampleGeometry::new(100.0, 1.0, 30).unwrap();
        assert_eq!(geometry.segments(10, 30), (10..40, None));
        assert_eq!(geometry.segments(70, 30), (70..100, None));
        assert_eq!(geometry.segments(90, 30), (90..100, Some(0..20)));
    }

    #[test]
    fn test_rejects_invalid_geometry() {
        assert!(SampleGeometry::new(0.0, 1.0, 1).is_err());
        assert!(SampleGeometry::new(100.0, -1.0, 1).is_err());
        assert!(SampleGeometry::new(100.0, 1.0, 0).is_err());
        assert!(SampleGeometry::new(100.0, 1.0, 101).is_err());
        assert!(SampleGeometry::new(100.0, 0.001, 1).is_err());
    }

    #[test]
    fn test_time_of_index() {
        let geometry = SampleGeometry::new(1000.0, 2.0, 10).unwrap();
        assert!((geometry.time_of(500) - 0.5).abs() < 1e-12);
    }
}

// Synthetic and recorded signals for the simulated device

use super::DeviceError;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::PathBuf;

/// Signal produced on one simulated analog channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Waveform {
    Constant {
        value: f64,
    },
    Sine {
        amplitude: f64,
        /// Hz
        frequency: f64,
        #[serde(default)]
        offset: f64,
    },
    /// Linear ramp `low -> high` over `rise_samples`, then back over `fall_samples`
    Triangle {
        low: f64,
        high: f64,
        rise_samples: u64,
        fall_samples: u64,
    },
    Square {
        low: f64,
        high: f64,
        high_samples: u64,
        low_samples: u64,
    },
    /// Explicit sample values; without `repeat` the last value is held
    Samples {
        data: Vec<f64>,
        #[serde(default)]
        repeat: bool,
    },
    /// One column of a CSV file with a header row, loaded when the session opens
    Recording {
        path: PathBuf,
        column: usize,
        #[serde(default)]
        repeat: bool,
    },
}

impl Default for Waveform {
    fn default() -> Self {
        Waveform::Constant { value: 0.0 }
    }
}

impl Waveform {
    /// Resolve file-backed waveforms into in-memory samples
    pub fn load(self) -> Result<Waveform, DeviceError> {
        match self {
            Waveform::Recording {
                path,
                column,
                repeat,
            } => {
                let mut reader = csv::Reader::from_path(&path)
                    .map_err(|e| DeviceError::Io(format!("{}: {}", path.display(), e)))?;
                let mut data = Vec::new();
                for (row, record) in reader.records().enumerate() {
                    let record =
                        record.map_err(|e| DeviceError::Io(format!("{}: {}", path.display(), e)))?;
                    let field = record.get(column).ok_or_else(|| {
                        DeviceError::Io(format!(
                            "{}: row {} has no column {}",
                            path.display(),
                            row + 1,
                            column
                        ))
                    })?;
                    let value = field.trim().parse::<f64>().map_err(|e| {
                        DeviceError::Io(format!(
                            "{}: row {} column {}: {}",
                            path.display(),
                            row + 1,
                            column,
                            e
                        ))
                    })?;
                    data.push(value);
                }
                if data.is_empty() {
                    return Err(DeviceError::Io(format!(
                        "{}: recording holds no samples",
                        path.display()
                    )));
                }
                log::debug!(
                    "Loaded {} samples from {} column {}",
                    data.len(),
                    path.display(),
                    column
                );
                Ok(Waveform::Samples { data, repeat })
            }
            other => Ok(other),
        }
    }

    /// Value at absolute sample `tick` of a clock running at `sample_rate`
    pub fn value_at(&self, tick: u64, sample_rate: f64) -> f64 {
        match self {
            Waveform::Constant { value } => *value,
            Waveform::Sine {
                amplitude,
                frequency,
                offset,
            } => {
                let t = tick as f64 / sample_rate;
                offset + amplitude * (2.0 * PI * frequency * t).sin()
            }
            Waveform::Triangle {
                low,
                high,
                rise_samples,
                fall_samples,
            } => {
                let period = rise_samples + fall_samples;
                if period == 0 {
                    return *low;
                }
                let phase = tick % period;
                let span = high - low;
                if phase < *rise_samples {
                    low + span * phase as f64 / *rise_samples as f64
                } else {
                    high - span * (phase - rise_samples) as f64 / *fall_samples as f64
                }
            }
            Waveform::Square {
                low,
                high,
                high_samples,
                low_samples,
            } => {
                let period = high_samples + low_samples;
                if period == 0 || tick % period >= *high_samples {
                    *low
                } else {
                    *high
                }
            }
            Waveform::Samples { data, repeat } => {
                if data.is_empty() {
                    return 0.0;
                }
                let len = data.len() as u64;
                let i = if *repeat { tick % len } else { tick.min(len - 1) };
                data[i as usize]
            }
            // Unloaded recordings read as silence
            Waveform::Recording { .. } => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_triangle_shape() {
        let wave = Waveform::Triangle {
            low: 0.0,
            high: 2.0,
            rise_samples: 1000,
            fall_samples: 1000,
        };
        assert_eq!(wave.value_at(0, 3300.0), 0.0);
        assert!((wave.value_at(500, 3300.0) - 1.0).abs() < 1e-12);
        assert_eq!(wave.value_at(1000, 3300.0), 2.0);
        assert!((wave.value_at(1500, 3300.0) - 1.0).abs() < 1e-12);
        assert_eq!(wave.value_at(2000, 3300.0), 0.0);
    }

    #[test]
    fn test_square_duty() {
        let wave = Waveform::Square {
            low: 0.0,
            high: 5.0,
            high_samples: 3,
            low_samples: 2,
        };
        let values: Vec<f64> = (0..6).map(|t| wave.value_at(t, 1.0)).collect();
        assert_eq!(values, vec![5.0, 5.0, 5.0, 0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_samples_hold_or_repeat() {
        let held = Waveform::Samples {
            data: vec![1.0, 2.0],
            repeat: false,
        };
        assert_eq!(held.value_at(5, 1.0), 2.0);
        let looped = Waveform::Samples {
            data: vec![1.0, 2.0],
            repeat: true,
        };
        assert_eq!(looped.value_at(5, 1.0), 2.0);
        assert_eq!(looped.value_at(4, 1.0), 1.0);
    }

    #[test]
    fn test_recording_loads_column() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CH 1,CH 2").unwrap();
        writeln!(file, "0.5,1.0").unwrap();
        writeln!(file, "0.25,2.0").unwrap();
        file.flush().unwrap();

        let wave = Waveform::Recording {
            path: file.path().to_path_buf(),
            column: 1,
            repeat: false,
        }
        .load()
        .unwrap();
        assert_eq!(
            wave,
            Waveform::Samples {
                data: vec![1.0, 2.0],
                repeat: false
            }
        );
    }

    #[test]
    fn test_recording_missing_column_is_io_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CH 1").unwrap();
        writeln!(file, "0.5").unwrap();
        file.flush().unwrap();

        let result = Waveform::Recording {
            path: file.path().to_path_buf(),
            column: 3,
            repeat: false,
        }
        .load();
        assert!(matches!(result, Err(DeviceError::Io(_))));
    }
}

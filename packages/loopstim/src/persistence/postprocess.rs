// End-of-run batch pass over a recorded file.
//
// Adds a `TIME` column in front of the recorded columns and four derived
// columns behind them:
//
// - `ACTIVE CYCLE` on every `DOWN` row: time since the nearest preceding `UP`
// - `INACTIVE CYCLE` on every `UP` row: time since the nearest preceding `DOWN`
// - `CYCLE TIME` on every `UP` row that has a later `UP`: time to that next `UP`
// - `FREQUENCY` on the first row: `1 / mean(CYCLE TIME)`
//
// Cells without a preceding marker are left empty. Derived columns already
// present are dropped and recomputed from the recorded columns, so running the
// pass twice produces the same file.

use crate::error::{EngineError, EngineResult};
use crate::types::MarkerChannel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TIME_LABEL: &str = "TIME";
pub const ACTIVE_CYCLE_LABEL: &str = "ACTIVE CYCLE";
pub const INACTIVE_CYCLE_LABEL: &str = "INACTIVE CYCLE";
pub const CYCLE_TIME_LABEL: &str = "CYCLE TIME";
pub const FREQUENCY_LABEL: &str = "FREQUENCY";

const DERIVED_LABELS: [&str; 5] = [
    TIME_LABEL,
    ACTIVE_CYCLE_LABEL,
    INACTIVE_CYCLE_LABEL,
    CYCLE_TIME_LABEL,
    FREQUENCY_LABEL,
];

/// Per-row derived values
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DerivedColumns {
    pub time: Vec<f64>,
    pub active_cycle: Vec<Option<f64>>,
    pub inactive_cycle: Vec<Option<f64>>,
    pub cycle_time: Vec<Option<f64>>,
    pub frequency: Option<f64>,
}

/// Summary of one processed file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostPassReport {
    pub path: PathBuf,
    pub rows: usize,
    pub ascending: usize,
    pub descending: usize,
    pub mean_active_cycle: Option<f64>,
    pub mean_inactive_cycle: Option<f64>,
    pub mean_cycle_time: Option<f64>,
    pub frequency: Option<f64>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Compute the derived columns from the `UP`/`DOWN` marker flags
pub fn compute_derived(up: &[bool], down: &[bool], sample_period: f64) -> DerivedColumns {
    assert_eq!(up.len(), down.len(), "marker columns differ in length");
    let rows = up.len();
    let mut derived = DerivedColumns {
        time: (0..rows).map(|i| i as f64 * sample_period).collect(),
        active_cycle: vec![None; rows],
        inactive_cycle: vec![None; rows],
        cycle_time: vec![None; rows],
        frequency: None,
    };

    let mut last_up: Option<usize> = None;
    let mut last_down: Option<usize> = None;
    for i in 0..rows {
        if down[i] {
            derived.active_cycle[i] = last_up.map(|u| (i - u) as f64 * sample_period);
        }
        if up[i] {
            derived.inactive_cycle[i] = last_down.map(|d| (i - d) as f64 * sample_period);
            if let Some(u) = last_up {
                derived.cycle_time[u] = Some((i - u) as f64 * sample_period);
            }
        }
        if up[i] {
            last_up = Some(i);
        }
        if down[i] {
            last_down = Some(i);
        }
    }

    derived.frequency = mean(derived.cycle_time.iter().flatten().copied())
        .filter(|&m| m > 0.0)
        .map(|m| 1.0 / m);
    derived
}

fn is_set(field: &str) -> bool {
    field
        .trim()
        .parse::<f64>()
        .map(|v| (v - 1.0).abs() < 1e-9)
        .unwrap_or(false)
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn malformed(path: &Path, reason: impl Into<String>) -> EngineError {
    EngineError::MalformedFile {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Rewrite `path` in place with the derived columns
pub fn post_process_file(path: impl AsRef<Path>, sample_rate: f64) -> EngineResult<PostPassReport> {
    let path = path.as_ref();
    if !sample_rate.is_finite() || sample_rate <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "Post-pass needs a positive sample rate, got {}",
            sample_rate
        )));
    }

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let header = reader.headers()?.clone();

    // Columns recorded during acquisition, in file order
    let base: Vec<usize> = header
        .iter()
        .enumerate()
        .filter(|(_, label)| !DERIVED_LABELS.contains(&label.trim()))
        .map(|(i, _)| i)
        .collect();
    let find = |label: &str| {
        header
            .iter()
            .position(|h| h.trim() == label)
            .ok_or_else(|| malformed(path, format!("missing {} column", label)))
    };
    let up_col = find(MarkerChannel::CrossUp.label())?;
    let down_col = find(MarkerChannel::CrossDown.label())?;

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() < header.len() {
            return Err(malformed(
                path,
                format!(
                    "row {} has {} fields, header has {}",
                    records.len() + 1,
                    record.len(),
                    header.len()
                ),
            ));
        }
        records.push(record);
    }

    let up: Vec<bool> = records.iter().map(|r| is_set(&r[up_col])).collect();
    let down: Vec<bool> = records.iter().map(|r| is_set(&r[down_col])).collect();
    let derived = compute_derived(&up, &down, 1.0 / sample_rate);

    let tmp_path = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp_path)?;
        let mut out_header = vec![TIME_LABEL.to_string()];
        out_header.extend(base.iter().map(|&i| header[i].to_string()));
        out_header.extend(
            [
                ACTIVE_CYCLE_LABEL,
                INACTIVE_CYCLE_LABEL,
                CYCLE_TIME_LABEL,
                FREQUENCY_LABEL,
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        writer.write_record(&out_header)?;

        for (i, record) in records.iter().enumerate() {
            let mut row = Vec::with_capacity(out_header.len());
            row.push(derived.time[i].to_string());
            row.extend(base.iter().map(|&c| record[c].to_string()));
            row.push(cell(derived.active_cycle[i]));
            row.push(cell(derived.inactive_cycle[i]));
            row.push(cell(derived.cycle_time[i]));
            row.push(if i == 0 { cell(derived.frequency) } else { String::new() });
            writer.write_record(&row)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp_path, path)?;

    let report = PostPassReport {
        path: path.to_path_buf(),
        rows: records.len(),
        ascending: up.iter().filter(|&&u| u).count(),
        descending: down.iter().filter(|&&d| d).count(),
        mean_active_cycle: mean(derived.active_cycle.iter().flatten().copied()),
        mean_inactive_cycle: mean(derived.inactive_cycle.iter().flatten().copied()),
        mean_cycle_time: mean(derived.cycle_time.iter().flatten().copied()),
        frequency: derived.frequency,
    };

    log::info!(
        "Post-pass {}: {} rows, {} cycles, frequency {:?} Hz",
        path.display(),
        report.rows,
        report.ascending,
        report.frequency
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(len: usize, set: &[usize]) -> Vec<bool> {
        (0..len).map(|i| set.contains(&i)).collect()
    }

    #[test]
    fn test_derived_columns() {
        // UP at 2, 10, 20; DOWN at 6, 15
        let up = flags(24, &[2, 10, 20]);
        let down = flags(24, &[6, 15]);
        let d = compute_derived(&up, &down, 0.5);

        assert_eq!(d.time[4], 2.0);
        assert_eq!(d.active_cycle[6], Some(2.0));
        assert_eq!(d.active_cycle[15], Some(2.5));
        assert_eq!(d.inactive_cycle[2], None);
        assert_eq!(d.inactive_cycle[10], Some(2.0));
        assert_eq!(d.inactive_cycle[20], Some(2.5));
        assert_eq!(d.cycle_time[2], Some(4.0));
        assert_eq!(d.cycle_time[10], Some(5.0));
        assert_eq!(d.cycle_time[20], None);
        assert_eq!(d.frequency, Some(1.0 / 4.5));
    }

    #[test]
    fn test_down_before_any_up_stays_empty() {
        let d = compute_derived(&flags(5, &[3]), &flags(5, &[1]), 1.0);
        assert_eq!(d.active_cycle[1], None);
        assert_eq!(d.inactive_cycle[3], Some(2.0));
        assert_eq!(d.frequency, None);
    }

    #[test]
    fn test_rewrites_file_with_time_and_derived_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_1.csv");
        std::fs::write(
            &path,
            "CH 1,UP,DOWN\n0.1,0,0\n0.2,1,0\n0.3,0,1\n0.4,1,0\n0.5,0,0\n",
        )
        .unwrap();

        let report = post_process_file(&path, 10.0).unwrap();
        assert_eq!(report.rows, 5);
        assert_eq!(report.ascending, 2);
        assert_eq!(report.descending, 1);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(
            header,
            vec![
                "TIME",
                "CH 1",
                "UP",
                "DOWN",
                "ACTIVE CYCLE",
                "INACTIVE CYCLE",
                "CYCLE TIME",
                "FREQUENCY"
            ]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(&rows[1][0], "0.1");
        assert_eq!(&rows[1][6], "0.2");
        assert_eq!(&rows[2][4], "0.1");
        assert_eq!(&rows[3][5], "0.1");
        assert_eq!(&rows[0][7], "5");
        assert_eq!(&rows[1][7], "");
        assert!(!dir.path().join("run_1.csv.tmp").exists());
    }

    #[test]
    fn test_post_pass_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_1.csv");
        std::fs::write(&path, "CH 1,UP,DOWN\n1,1,0\n2,0,1\n3,1,0\n4,0,1\n").unwrap();

        let first_report = post_process_file(&path, 100.0).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        let second_report = post_process_file(&path, 100.0).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first_report, second_report);
    }

    #[test]
    fn test_missing_marker_column_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "CH 1,UP\n1,0\n").unwrap();
        assert!(matches!(
            post_process_file(&path, 100.0),
            Err(EngineError::MalformedFile { .. })
        ));
    }
}

// Rotating CSV writer for acquired chunks

use crate::error::EngineResult;
use crate::types::{MarkerChannel, PersistedChunk, ANALOG_CHANNELS};
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Label of the last analog input, which carries the rig's trigger output
pub const TAG_OUT_LABEL: &str = "TAG OUT";

/// Column labels of a freshly written file
pub fn base_header() -> Vec<String> {
    let mut header: Vec<String> = (1..ANALOG_CHANNELS).map(|i| format!("CH {}", i)).collect();
    header.push(TAG_OUT_LABEL.to_string());
    header.extend(MarkerChannel::ALL.iter().map(|m| m.label().to_string()));
    header
}

/// `<folder>/<base>_<counter>.csv`
pub fn rotated_path(folder: &Path, base_name: &str, counter: u32) -> PathBuf {
    folder.join(format!("{}_{}.csv", base_name, counter))
}

/// First counter at or after `start` whose file does not exist yet
pub fn next_free_counter(folder: &Path, base_name: &str, start: u32) -> u32 {
    let mut counter = start.max(1);
    while rotated_path(folder, base_name, counter).exists() {
        counter += 1;
    }
    counter
}

/// Appends persisted chunks to one output file
pub struct ChunkWriter {
    path: PathBuf,
    sample_rate: f64,
    writer: csv::Writer<BufWriter<File>>,
    rows: u64,
}

impl ChunkWriter {
    /// Open `path` for appending; the header is written only if the file is empty
    pub fn open(path: impl Into<PathBuf>, sample_rate: f64) -> EngineResult<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_empty = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        if is_empty {
            writer.write_record(base_header())?;
        }

        log::debug!("Recording to {}", path.display());

        Ok(Self {
            path,
            sample_rate,
            writer,
            rows: 0,
        })
    }

    pub fn append(&mut self, chunk: &PersistedChunk) -> EngineResult<()> {
        for i in 0..chunk.num_rows() {
            self.writer
                .write_record(chunk.row(i).map(|v| v.to_string()))?;
            self.rows += 1;
        }
        Ok(())
    }

    pub fn finish(mut self) -> EngineResult<RecordedFile> {
        self.writer.flush()?;
        Ok(RecordedFile {
            path: self.path,
            sample_rate: self.sample_rate,
            rows: self.rows,
        })
    }
}

/// A closed output file awaiting the post-pass
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFile {
    pub path: PathBuf,
    pub sample_rate: f64,
    pub rows: u64,
}

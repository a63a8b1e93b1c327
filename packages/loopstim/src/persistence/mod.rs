// Persistence worker
//
// A dedicated thread drains an unbounded FIFO of persisted chunks and appends
// them to the active output file. The acquisition loop never waits on it.
// Files rotate on every `Open` message; when the channel closes the worker
// finishes the open file and hands back the list of files it wrote, which
// `finish` then runs through the post-pass.

mod postprocess;
mod writer;

pub use postprocess::{
    compute_derived, post_process_file, DerivedColumns, PostPassReport, ACTIVE_CYCLE_LABEL,
    CYCLE_TIME_LABEL, FREQUENCY_LABEL, INACTIVE_CYCLE_LABEL, TIME_LABEL,
};
pub use writer::{base_header, next_free_counter, rotated_path, ChunkWriter, RecordedFile};

use crate::error::{EngineError, EngineResult};
use crate::types::PersistedChunk;
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::thread::JoinHandle;

/// Where and how recordings are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub folder: PathBuf,
    pub base_name: String,
    /// Run the post-pass over every file when the worker finishes
    #[serde(default = "default_post_pass")]
    pub post_pass: bool,
}

fn default_post_pass() -> bool {
    true
}

impl PersistenceConfig {
    pub fn new(folder: impl Into<PathBuf>, base_name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            base_name: base_name.into(),
            post_pass: true,
        }
    }
}

/// Messages consumed by the worker, in order
#[derive(Debug, Clone)]
pub enum PersistenceMessage {
    /// Close the current file (if any) and start the next rotated file
    Open { sample_rate: f64 },
    Chunk(PersistedChunk),
    /// Close the current file
    Close,
}

/// Cloneable producer side of the persistence queue
#[derive(Clone)]
pub struct PersistenceSender {
    tx: Sender<PersistenceMessage>,
}

impl PersistenceSender {
    /// Never blocks; fails only after the worker is gone
    pub fn send(&self, message: PersistenceMessage) -> EngineResult<()> {
        self.tx.send(message).map_err(|_| EngineError::ChannelClosed)
    }
}

/// Files written by one worker, with post-pass results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceSummary {
    pub files: Vec<PathBuf>,
    pub rows_written: u64,
    pub reports: Vec<PostPassReport>,
}

pub struct PersistenceWorker {
    config: PersistenceConfig,
    sender: PersistenceSender,
    handle: JoinHandle<EngineResult<Vec<RecordedFile>>>,
}

impl PersistenceWorker {
    pub fn spawn(config: PersistenceConfig) -> EngineResult<Self> {
        if config.base_name.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "Recording base name is empty".to_string(),
            ));
        }
        std::fs::create_dir_all(&config.folder)?;

        let (tx, rx) = unbounded();
        let folder = config.folder.clone();
        let base_name = config.base_name.clone();
        let handle = std::thread::Builder::new()
            .name("loopstim-persistence".to_string())
            .spawn(move || run_worker(rx, folder, base_name))?;

        Ok(Self {
            config,
            sender: PersistenceSender { tx },
            handle,
        })
    }

    pub fn sender(&self) -> PersistenceSender {
        self.sender.clone()
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Flush everything queued, join the worker and run the post-pass
    ///
    /// Every other sender must already be dropped, otherwise this waits for
    /// them.
    pub fn finish(self) -> EngineResult<PersistenceSummary> {
        drop(self.sender);
        let files = self
            .handle
            .join()
            .map_err(|_| EngineError::Io(std::io::Error::other("persistence worker panicked")))??;

        let mut summary = PersistenceSummary {
            files: files.iter().map(|f| f.path.clone()).collect(),
            rows_written: files.iter().map(|f| f.rows).sum(),
            reports: Vec::new(),
        };
        if self.config.post_pass {
            for file in &files {
                summary
                    .reports
                    .push(post_process_file(&file.path, file.sample_rate)?);
            }
        }
        Ok(summary)
    }
}

fn run_worker(
    rx: Receiver<PersistenceMessage>,
    folder: PathBuf,
    base_name: String,
) -> EngineResult<Vec<RecordedFile>> {
    let mut files = Vec::new();
    let mut current: Option<ChunkWriter> = None;
    let mut counter = 1;

    log::debug!("Persistence worker started for {}", folder.display());

    for message in rx {
        match message {
            PersistenceMessage::Open { sample_rate } => {
                if let Some(writer) = current.take() {
                    files.push(writer.finish()?);
                }
                counter = next_free_counter(&folder, &base_name, counter);
                let path = rotated_path(&folder, &base_name, counter);
                log::info!("Recording started: {}", path.display());
                current = Some(ChunkWriter::open(path, sample_rate)?);
                counter += 1;
            }
            PersistenceMessage::Chunk(chunk) => match current.as_mut() {
                Some(writer) => writer.append(&chunk)?,
                None => log::debug!("Chunk received with no open recording, skipped"),
            },
            PersistenceMessage::Close => {
                if let Some(writer) = current.take() {
                    let file = writer.finish()?;
                    log::info!("Recording closed: {} ({} rows)", file.path.display(), file.rows);
                    files.push(file);
                }
            }
        }
    }

    if let Some(writer) = current.take() {
        files.push(writer.finish()?);
    }
    log::debug!("Persistence worker stopped after {} file(s)", files.len());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ANALOG_CHANNELS;

    fn chunk(value: f64, rows: usize) -> PersistedChunk {
        PersistedChunk {
            samples: vec![vec![value; rows]; ANALOG_CHANNELS],
            markers: std::array::from_fn(|_| vec![0.0; rows]),
        }
    }

    #[test]
    fn test_fifo_order_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PersistenceConfig::new(dir.path(), "session");
        config.post_pass = false;
        let worker = PersistenceWorker::spawn(config).unwrap();
        let sender = worker.sender();

        sender.send(PersistenceMessage::Open { sample_rate: 100.0 }).unwrap();
        for i in 0..5 {
            sender.send(PersistenceMessage::Chunk(chunk(i as f64, 2))).unwrap();
        }
        sender.send(PersistenceMessage::Open { sample_rate: 200.0 }).unwrap();
        sender.send(PersistenceMessage::Chunk(chunk(9.0, 3))).unwrap();
        drop(sender);

        let summary = worker.finish().unwrap();
        assert_eq!(
            summary.files,
            vec![dir.path().join("session_1.csv"), dir.path().join("session_2.csv")]
        );
        assert_eq!(summary.rows_written, 13);

        let mut reader = csv::Reader::from_path(dir.path().join("session_1.csv")).unwrap();
        let first_column: Vec<String> = reader
            .records()
            .map(|r| r.unwrap()[0].to_string())
            .collect();
        assert_eq!(first_column, vec!["0", "0", "1", "1", "2", "2", "3", "3", "4", "4"]);
    }

    #[test]
    fn test_chunks_outside_recording_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let worker = PersistenceWorker::spawn(PersistenceConfig::new(dir.path(), "run")).unwrap();
        let sender = worker.sender();
        sender.send(PersistenceMessage::Chunk(chunk(1.0, 2))).unwrap();
        sender.send(PersistenceMessage::Open { sample_rate: 10.0 }).unwrap();
        sender.send(PersistenceMessage::Chunk(chunk(2.0, 2))).unwrap();
        sender.send(PersistenceMessage::Close).unwrap();
        sender.send(PersistenceMessage::Chunk(chunk(3.0, 2))).unwrap();
        drop(sender);

        let summary = worker.finish().unwrap();
        assert_eq!(summary.rows_written, 2);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].rows, 2);
        let header = std::fs::read_to_string(dir.path().join("run_1.csv")).unwrap();
        assert!(header.starts_with("TIME,CH 1,"));
    }

    #[test]
    fn test_existing_files_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run_1.csv"), "keep").unwrap();
        let mut config = PersistenceConfig::new(dir.path(), "run");
        config.post_pass = false;
        let worker = PersistenceWorker::spawn(config).unwrap();
        worker
            .sender()
            .send(PersistenceMessage::Open { sample_rate: 10.0 })
            .unwrap();
        let summary = worker.finish().unwrap();
        assert_eq!(summary.files, vec![dir.path().join("run_2.csv")]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("run_1.csv")).unwrap(),
            "keep"
        );
    }
}

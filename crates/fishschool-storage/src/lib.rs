//! Snapshot export: one JSON document per emitted step, written off the
//! simulation thread by a dedicated worker so a slow disk never stalls the
//! step pipeline.

use fishschool_core::{SinkError, SnapshotSink, StepBatch};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tracing::{debug, error};

/// Export error wrapper.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("export target {0} is not a writable directory")]
    BadTarget(PathBuf),
    #[error("export worker error: {0}")]
    Worker(String),
}

/// Synchronous writer putting each batch into `step_NNNNNN.json` under a
/// fixed dumping directory.
#[derive(Debug)]
pub struct SnapshotWriter {
    directory: PathBuf,
}

impl SnapshotWriter {
    /// Open a writer rooted at `directory`. The directory must already
    /// exist and be writable; this is probed up front so a misconfigured
    /// dumping location fails before the run starts, not at step zero.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(ExportError::BadTarget(directory));
        }
        let probe = directory.join(".fishschool-write-probe");
        File::create(&probe).map_err(|_| ExportError::BadTarget(directory.clone()))?;
        let _ = fs::remove_file(&probe);
        Ok(Self { directory })
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path the batch for `step` lands at.
    #[must_use]
    pub fn step_path(&self, step: u64) -> PathBuf {
        self.directory.join(format!("step_{step:06}.json"))
    }

    /// Serialize one batch to its step file. An existing file for the same
    /// step is overwritten, so re-running into the same directory replaces
    /// stale snapshots instead of interleaving runs.
    pub fn write(&self, batch: &StepBatch) -> Result<(), ExportError> {
        let path = self.step_path(batch.summary.step);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, batch)?;
        writer.flush()?;
        debug!(step = batch.summary.step, path = %path.display(), "snapshot written");
        Ok(())
    }
}

#[derive(Debug)]
enum ExportCommand {
    Snapshot(StepBatch),
    Shutdown,
}

/// Asynchronous export sink: batches travel over a channel to a named
/// worker thread that owns the writer. Dropping the pipeline drains the
/// channel and joins the worker, so every accepted batch reaches disk.
pub struct ExportPipeline {
    tx: mpsc::Sender<ExportCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ExportPipeline {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let writer = SnapshotWriter::open(directory)?;
        Self::from_writer(writer)
    }

    fn from_writer(writer: SnapshotWriter) -> Result<Self, ExportError> {
        let (tx, rx) = mpsc::channel::<ExportCommand>();
        let handle = thread::Builder::new()
            .name("fishschool-export-worker".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        ExportCommand::Snapshot(batch) => {
                            if let Err(err) = writer.write(&batch) {
                                error!(
                                    step = batch.summary.step,
                                    error = %err,
                                    "failed to export snapshot"
                                );
                            }
                        }
                        ExportCommand::Shutdown => break,
                    }
                }
            })
            .map_err(|err| {
                ExportError::Worker(format!("failed to spawn export worker thread: {err}"))
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }
}

impl SnapshotSink for ExportPipeline {
    fn on_step(&mut self, batch: &StepBatch) -> Result<(), SinkError> {
        self.tx
            .send(ExportCommand::Snapshot(batch.clone()))
            .map_err(|_| {
                SinkError::new(format!(
                    "export worker channel closed; step {} dropped",
                    batch.summary.step
                ))
            })
    }
}

impl Drop for ExportPipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(ExportCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.join() {
                error!("export worker thread panicked: {err:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fishschool_core::{AgentData, Position, StepSummary};

    fn temp_export_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fishschool-storage-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn sample_batch(step: u64) -> StepBatch {
        let agents = vec![AgentData {
            position: Position::new(0.25, 0.5, 0.75),
            ..AgentData::default()
        }];
        StepBatch {
            summary: StepSummary {
                step,
                agent_count: agents.len(),
                mean_position: Position::new(0.25, 0.5, 0.75),
                mean_speed: 0.0,
            },
            agents,
        }
    }

    #[test]
    fn open_rejects_a_missing_directory() {
        let missing = std::env::temp_dir().join("fishschool-definitely-not-here");
        assert!(matches!(
            SnapshotWriter::open(&missing),
            Err(ExportError::BadTarget(_))
        ));
    }

    #[test]
    fn writer_round_trips_a_batch_through_json() {
        let dir = temp_export_dir("roundtrip");
        let writer = SnapshotWriter::open(&dir).expect("open");
        let batch = sample_batch(7);
        writer.write(&batch).expect("write");

        let path = writer.step_path(7);
        assert!(path.ends_with("step_000007.json"));
        let raw = fs::read_to_string(&path).expect("read back");
        let decoded: StepBatch = serde_json::from_str(&raw).expect("decode");
        assert_eq!(decoded, batch);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rewriting_a_step_replaces_the_previous_file() {
        let dir = temp_export_dir("rewrite");
        let writer = SnapshotWriter::open(&dir).expect("open");
        writer.write(&sample_batch(3)).expect("first write");
        let mut updated = sample_batch(3);
        updated.summary.mean_speed = 1.5;
        writer.write(&updated).expect("second write");

        let raw = fs::read_to_string(writer.step_path(3)).expect("read back");
        let decoded: StepBatch = serde_json::from_str(&raw).expect("decode");
        assert_eq!(decoded.summary.mean_speed, 1.5);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn pipeline_drains_all_batches_before_drop_returns() {
        let dir = temp_export_dir("pipeline");
        let mut pipeline = ExportPipeline::new(&dir).expect("pipeline");
        for step in 0..5 {
            pipeline.on_step(&sample_batch(step)).expect("send");
        }
        drop(pipeline);

        for step in 0..5u64 {
            let path = dir.join(format!("step_{step:06}.json"));
            assert!(path.is_file(), "missing export for step {step}");
        }

        fs::remove_dir_all(&dir).ok();
    }
}

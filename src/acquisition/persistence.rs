//! Persistence worker and on-disk stream format.
//!
//! Each [`ChannelTask`](super::task::ChannelTask) owns one worker thread.
//! The thread receives [`PersistJob`]s in arrival order, so at most one save
//! per task is in flight and blocks land on disk in the order they were
//! filled. Storage of a saved block goes back to the sink through the
//! recycle channel.
//!
//! Streams are written as CSV, one row per scan:
//!
//! ```text
//! time_s,LinMot_Enable,Voltage
//! 0,0,0.013
//! 0.001,0,0.011
//! ```
//!
//! `time_s` is `scan_index / sample_rate`, counted from the task start.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::channel_group::ChannelGroup;
use super::double_buffer::{Block, BufferHandoff};
use crate::error::{AppResult, DaqError};

/// Work item for a persistence worker.
#[derive(Debug)]
pub enum PersistJob {
    /// A full buffer handed off by the sink.
    Save(Block),
    /// Write the optional partial buffer, close the stream and exit.
    Flush {
        partial: Option<Block>,
        ack: oneshot::Sender<io::Result<PersistSummary>>,
    },
}

/// What a worker wrote during one session.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistSummary {
    pub path: PathBuf,
    pub blocks: u64,
    pub scans: u64,
}

/// Destination for one task's blocks.
pub trait BlockWriter: Send {
    fn write_block(&mut self, block: &Block) -> io::Result<()>;

    /// Flush and close. Returns the path of the persisted stream.
    fn finish(&mut self) -> io::Result<PathBuf>;
}

/// Opens a [`BlockWriter`] per task and session.
pub trait StorageBackend: Send + Sync {
    fn open(&self, group: &ChannelGroup, stamp: &str) -> io::Result<Box<dyn BlockWriter>>;
}

/// Stream file name for a task within a session.
pub fn stream_file_name(task: &str, stamp: &str) -> String {
    format!("DAQ_{}_{}.csv", task, stamp)
}

/// CSV files in a session directory.
#[derive(Debug, Clone)]
pub struct CsvStorage {
    dir: PathBuf,
}

impl CsvStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StorageBackend for CsvStorage {
    fn open(&self, group: &ChannelGroup, stamp: &str) -> io::Result<Box<dyn BlockWriter>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(stream_file_name(&group.name, stamp));
        let mut writer = csv::Writer::from_path(&path)?;

        let mut header = Vec::with_capacity(group.channel_count() + 1);
        header.push("time_s".to_string());
        header.extend(group.channel_names());
        writer.write_record(&header)?;

        info!(task = %group.name, path = %path.display(), "Opened stream file");
        Ok(Box::new(CsvBlockWriter {
            writer: Some(writer),
            path,
            sample_rate: group.sample_rate,
        }))
    }
}

/// Writes blocks as CSV rows.
pub struct CsvBlockWriter {
    writer: Option<csv::Writer<File>>,
    path: PathBuf,
    sample_rate: f64,
}

impl BlockWriter for CsvBlockWriter {
    fn write_block(&mut self, block: &Block) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream already closed"))?;

        let mut record = Vec::with_capacity(block.n_channels + 1);
        for (i, row) in block.rows().enumerate() {
            record.clear();
            let t = (block.first_scan + i as u64) as f64 / self.sample_rate;
            record.push(t.to_string());
            record.extend(row.iter().map(f64::to_string));
            writer.write_record(&record)?;
        }
        writer.flush()
    }

    fn finish(&mut self) -> io::Result<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(self.path.clone())
    }
}

/// Handle to a running persistence thread.
pub struct PersistenceWorker {
    task: String,
    flush: mpsc::Sender<PersistJob>,
    handle: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
    /// Spawn the worker thread for `task`.
    ///
    /// Write failures are reported once on `faults`; later blocks of the same
    /// session are still recycled but no longer written.
    pub fn spawn(
        task: impl Into<String>,
        mut writer: Box<dyn BlockWriter>,
        handoff: BufferHandoff,
        faults: mpsc::UnboundedSender<DaqError>,
    ) -> AppResult<Self> {
        let task = task.into();
        let BufferHandoff {
            mut jobs,
            recycle,
            flush,
        } = handoff;

        let thread_task = task.clone();
        let handle = thread::Builder::new()
            .name(format!("persist-{}", task))
            .spawn(move || {
                let task = thread_task;
                let mut failed = false;
                let mut blocks = 0u64;
                let mut scans = 0u64;

                while let Some(job) = jobs.blocking_recv() {
                    match job {
                        PersistJob::Save(block) => {
                            if !failed {
                                match writer.write_block(&block) {
                                    Ok(()) => {
                                        blocks += 1;
                                        scans += block.scans as u64;
                                        debug!(task = %task, first_scan = block.first_scan, scans = block.scans, "Block persisted");
                                    }
                                    Err(e) => {
                                        error!(task = %task, error = %e, "Failed to persist block");
                                        failed = true;
                                        let _ = faults.send(DaqError::persistence(task.clone(), e));
                                    }
                                }
                            }
                            // Sink gone means the session is over; nothing to recycle into.
                            let _ = recycle.try_send(block.data);
                        }
                        PersistJob::Flush { partial, ack } => {
                            let result = flush_and_close(writer.as_mut(), partial, failed)
                                .map(|(path, extra)| {
                                    blocks += u64::from(extra > 0);
                                    scans += extra;
                                    PersistSummary { path, blocks, scans }
                                });
                            let _ = ack.send(result);
                            break;
                        }
                    }
                }
                debug!(task = %task, "Persistence worker exiting");
            })?;

        Ok(Self {
            task,
            flush,
            handle: Some(handle),
        })
    }

    /// Queue the partial buffer behind pending saves, close the stream and
    /// join the thread.
    pub async fn finish(mut self, partial: Option<Block>) -> AppResult<PersistSummary> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let queued = self
            .flush
            .send(PersistJob::Flush {
                partial,
                ack: ack_tx,
            })
            .await;
        if queued.is_err() {
            return Err(self.stopped_error());
        }

        let result = ack_rx.await.map_err(|_| self.stopped_error())?;
        if let Some(handle) = self.handle.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                error!(task = %self.task, "Persistence thread panicked");
            }
        }
        result.map_err(|e| DaqError::persistence(self.task.clone(), e))
    }

    fn stopped_error(&self) -> DaqError {
        DaqError::persistence(
            self.task.clone(),
            io::Error::new(io::ErrorKind::BrokenPipe, "persistence worker has stopped"),
        )
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!(task = %self.task, "Persistence worker dropped without flush");
        }
    }
}

fn flush_and_close(
    writer: &mut dyn BlockWriter,
    partial: Option<Block>,
    failed: bool,
) -> io::Result<(PathBuf, u64)> {
    let mut extra = 0;
    if let Some(block) = partial.filter(|_| !failed) {
        writer.write_block(&block)?;
        extra = block.scans as u64;
    }
    let path = writer.finish()?;
    Ok((path, extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::channel_group::{AcquisitionKind, ChannelSpec, SampleChunk, TerminalConfig};
    use crate::acquisition::double_buffer::SampleSink;

    fn group() -> ChannelGroup {
        ChannelGroup {
            name: "analog".into(),
            kind: AcquisitionKind::ContinuousVoltage,
            sample_rate: 10.0,
            chunk_size: 2,
            capacity: 4,
            trigger_source: None,
            channels: vec![
                ChannelSpec {
                    name: "Voltage".into(),
                    port: "Dev1/ai2".into(),
                    terminal: TerminalConfig::Differential,
                },
                ChannelSpec {
                    name: "Current".into(),
                    port: "Dev1/ai3".into(),
                    terminal: TerminalConfig::Rse,
                },
            ],
            plot_channel: None,
        }
    }

    #[tokio::test]
    async fn worker_writes_blocks_then_partial() {
        let dir = tempfile::tempdir().unwrap();
        let group = group();
        let storage = CsvStorage::new(dir.path());
        let writer = storage.open(&group, "20260101_120000").unwrap();
        let (mut sink, handoff) = SampleSink::new(&group).unwrap();
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let worker = PersistenceWorker::spawn("analog", writer, handoff, fault_tx).unwrap();

        for i in 0..3 {
            let v = i as f64;
            let data = [v, -v, v + 0.5, -v - 0.5];
            sink.push(&SampleChunk::new(&data, 2)).unwrap();
        }
        let summary = worker.finish(sink.take_partial()).await.unwrap();

        assert_eq!(summary.scans, 6);
        assert_eq!(summary.blocks, 2);
        assert_eq!(
            summary.path.file_name().unwrap(),
            "DAQ_analog_20260101_120000.csv"
        );
        assert!(fault_rx.try_recv().is_err());

        let mut reader = csv::Reader::from_path(&summary.path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, vec!["time_s", "Voltage", "Current"]);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 6);
        assert_eq!(&rows[5][0], "0.5");
        assert_eq!(&rows[5][1], "2.5");
    }

    struct FailingWriter;

    impl BlockWriter for FailingWriter {
        fn write_block(&mut self, _block: &Block) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn finish(&mut self) -> io::Result<PathBuf> {
            Ok(PathBuf::from("unused.csv"))
        }
    }

    #[tokio::test]
    async fn write_failure_is_reported_as_fault() {
        let group = group();
        let (mut sink, handoff) = SampleSink::new(&group).unwrap();
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let worker =
            PersistenceWorker::spawn("analog", Box::new(FailingWriter), handoff, fault_tx).unwrap();

        for _ in 0..2 {
            sink.push(&SampleChunk::new(&[0.0, 0.0, 0.0, 0.0], 2)).unwrap();
        }
        let fault = fault_rx.recv().await.unwrap();
        assert!(matches!(fault, DaqError::PersistenceIo { ref task, .. } if task == "analog"));

        let summary = worker.finish(None).await.unwrap();
        assert_eq!(summary.blocks, 0);
    }
}

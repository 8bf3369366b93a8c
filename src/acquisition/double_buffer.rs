//! Double-buffered sample sink.
//!
//! The sink runs inside the driver's real-time callback. It owns exactly one
//! *active* buffer and at most one *spare*. When the active buffer fills, it
//! is moved into a [`Block`] and sent to the persistence worker through a
//! bounded channel; the spare becomes active. The worker sends the storage
//! back on the recycle channel once the block is on disk.
//!
//! ```text
//!   driver callback ──push──▶ [active] ──full──▶ jobs ──▶ PersistenceWorker
//!                               ▲                              │
//!                               └──────── recycle ◀────────────┘
//! ```
//!
//! Ownership of a buffer is moved, never shared, so the callback can never
//! write into storage the worker is reading. If the active buffer fills and
//! no spare has come back yet, [`SampleSink::push`] fails with
//! [`DaqError::BufferOverrunFatal`] instead of overwriting or blocking.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::channel_group::{ChannelGroup, SampleChunk};
use super::persistence::PersistJob;
use crate::error::{AppResult, DaqError, DriverError, DriverErrorKind};

/// Number of in-flight jobs the handoff channel can hold.
///
/// Only two buffers exist, plus one final flush job.
pub(crate) const HANDOFF_DEPTH: usize = 4;

/// A filled (or final partial) buffer on its way to storage.
#[derive(Debug)]
pub struct Block {
    /// Scan-major samples, `scans * n_channels` values.
    pub data: Vec<f64>,
    pub scans: usize,
    pub n_channels: usize,
    /// Index of the first scan since the task started.
    pub first_scan: u64,
}

impl Block {
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data[..self.scans * self.n_channels].chunks_exact(self.n_channels.max(1))
    }
}

/// Worker side of a sink's handoff channels.
#[derive(Debug)]
pub struct BufferHandoff {
    pub jobs: mpsc::Receiver<PersistJob>,
    pub recycle: mpsc::Sender<Vec<f64>>,
    /// Sender the task uses to queue the final flush behind pending saves.
    pub flush: mpsc::Sender<PersistJob>,
}

/// Double buffer written by the acquisition callback.
#[derive(Debug)]
pub struct SampleSink {
    task: String,
    n_channels: usize,
    chunk_size: usize,
    capacity: usize,
    active: Vec<f64>,
    spare: Option<Vec<f64>>,
    /// Scans written into `active`.
    cursor: usize,
    /// Scans seen since the task started.
    total_scans: u64,
    /// First scan index of the data in `active`.
    active_first_scan: u64,
    blocks_handed_off: u64,
    jobs: mpsc::Sender<PersistJob>,
    recycle: mpsc::Receiver<Vec<f64>>,
}

impl SampleSink {
    /// Allocate both buffers for `group` and the channels to its worker.
    pub fn new(group: &ChannelGroup) -> AppResult<(Self, BufferHandoff)> {
        let n_channels = group.channel_count();
        if n_channels == 0 || group.chunk_size == 0 {
            return Err(DriverError::new(
                "sample_sink",
                DriverErrorKind::Configuration,
                format!("Group '{}' has no channels or a zero chunk size", group.name),
            )
            .into());
        }
        if group.capacity == 0 || group.capacity % group.chunk_size != 0 {
            return Err(DriverError::new(
                "sample_sink",
                DriverErrorKind::Configuration,
                format!(
                    "Buffer capacity {} of group '{}' is not a multiple of chunk size {}",
                    group.capacity, group.name, group.chunk_size
                ),
            )
            .into());
        }

        let (job_tx, job_rx) = mpsc::channel(HANDOFF_DEPTH);
        let (recycle_tx, recycle_rx) = mpsc::channel(2);
        let len = group.capacity * n_channels;

        let sink = Self {
            task: group.name.clone(),
            n_channels,
            chunk_size: group.chunk_size,
            capacity: group.capacity,
            active: vec![0.0; len],
            spare: Some(vec![0.0; len]),
            cursor: 0,
            total_scans: 0,
            active_first_scan: 0,
            blocks_handed_off: 0,
            jobs: job_tx.clone(),
            recycle: recycle_rx,
        };
        let handoff = BufferHandoff {
            jobs: job_rx,
            recycle: recycle_tx,
            flush: job_tx,
        };
        Ok((sink, handoff))
    }

    /// Append one chunk. Runs on the real-time path: no allocation, no
    /// blocking, no I/O.
    pub fn push(&mut self, chunk: &SampleChunk<'_>) -> AppResult<()> {
        if chunk.n_channels() != self.n_channels || chunk.n_scans() != self.chunk_size {
            return Err(DriverError::new(
                "sample_sink",
                DriverErrorKind::Hardware,
                format!(
                    "Task '{}' expected {}x{} chunk, got {}x{}",
                    self.task,
                    self.chunk_size,
                    self.n_channels,
                    chunk.n_scans(),
                    chunk.n_channels()
                ),
            )
            .into());
        }
        if self.cursor == self.capacity {
            // A previous overrun left the active buffer full.
            self.rotate()?;
        }

        let start = self.cursor * self.n_channels;
        self.active[start..start + chunk.data().len()].copy_from_slice(chunk.data());
        self.cursor += self.chunk_size;
        self.total_scans += self.chunk_size as u64;
        trace!(task = %self.task, cursor = self.cursor, "Chunk buffered");

        if self.cursor == self.capacity {
            self.rotate()?;
        }
        Ok(())
    }

    /// Swap the full active buffer for the spare and hand it off.
    fn rotate(&mut self) -> AppResult<()> {
        if self.spare.is_none() {
            self.spare = self.recycle.try_recv().ok();
        }
        let Some(spare) = self.spare.take() else {
            return Err(DaqError::BufferOverrunFatal {
                task: self.task.clone(),
            });
        };

        let full = std::mem::replace(&mut self.active, spare);
        let block = Block {
            data: full,
            scans: self.capacity,
            n_channels: self.n_channels,
            first_scan: self.active_first_scan,
        };
        self.active_first_scan += self.capacity as u64;
        self.cursor = 0;

        match self.jobs.try_send(PersistJob::Save(block)) {
            Ok(()) => {
                self.blocks_handed_off += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(DaqError::BufferOverrunFatal {
                task: self.task.clone(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DaqError::persistence(
                self.task.clone(),
                std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "persistence worker has stopped",
                ),
            )),
        }
    }

    /// Copy out whatever sits in the active buffer and reset the cursor.
    ///
    /// Called after the driver stopped, so allocation is fine here.
    pub fn take_partial(&mut self) -> Option<Block> {
        if self.cursor == 0 {
            return None;
        }
        let block = Block {
            data: self.active[..self.cursor * self.n_channels].to_vec(),
            scans: self.cursor,
            n_channels: self.n_channels,
            first_scan: self.active_first_scan,
        };
        self.active_first_scan += self.cursor as u64;
        self.cursor = 0;
        debug!(task = %self.task, scans = block.scans, "Partial buffer taken for flush");
        Some(block)
    }

    /// Zero the write cursor and scan counters for a fresh run.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.total_scans = 0;
        self.active_first_scan = 0;
        self.blocks_handed_off = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total_scans(&self) -> u64 {
        self.total_scans
    }

    pub fn blocks_handed_off(&self) -> u64 {
        self.blocks_handed_off
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::channel_group::{AcquisitionKind, ChannelSpec, TerminalConfig};

    fn group(chunk_size: usize, buffer_chunks: usize, n_channels: usize) -> ChannelGroup {
        ChannelGroup {
            name: "analog".into(),
            kind: AcquisitionKind::ContinuousVoltage,
            sample_rate: 1000.0,
            chunk_size,
            capacity: chunk_size * buffer_chunks,
            trigger_source: None,
            channels: (0..n_channels)
                .map(|i| ChannelSpec {
                    name: format!("ai{}", i),
                    port: format!("Dev1/ai{}", i),
                    terminal: TerminalConfig::Default,
                })
                .collect(),
            plot_channel: None,
        }
    }

    /// Chunk `index` holds consecutive scan numbers in channel 0 and their
    /// negation in channel 1.
    fn chunk_data(index: usize, chunk_size: usize) -> Vec<f64> {
        (0..chunk_size)
            .flat_map(|i| {
                let scan = (index * chunk_size + i) as f64;
                [scan, -scan]
            })
            .collect()
    }

    #[test]
    fn hands_off_full_blocks_in_arrival_order() {
        let (chunk_size, buffer_chunks) = (5, 4);
        let (mut sink, mut handoff) = SampleSink::new(&group(chunk_size, buffer_chunks, 2)).unwrap();
        let capacity = chunk_size * buffer_chunks;
        let n_chunks = 23;

        let mut saved = Vec::new();
        for i in 0..n_chunks {
            let data = chunk_data(i, chunk_size);
            sink.push(&SampleChunk::new(&data, 2)).unwrap();
            // Emulate an instantaneous worker.
            while let Ok(PersistJob::Save(block)) = handoff.jobs.try_recv() {
                saved.push((block.first_scan, block.data.clone(), block.scans));
                handoff.recycle.try_send(block.data).unwrap();
            }
        }

        assert_eq!(saved.len(), n_chunks * chunk_size / capacity);
        for (n, (first_scan, data, scans)) in saved.iter().enumerate() {
            assert_eq!(*scans, capacity);
            assert_eq!(*first_scan, (n * capacity) as u64);
            let column: Vec<f64> = data.iter().step_by(2).copied().collect();
            let expected: Vec<f64> = (n * capacity..(n + 1) * capacity).map(|s| s as f64).collect();
            assert_eq!(column, expected);
        }
        assert_eq!(sink.cursor(), (n_chunks * chunk_size) % capacity);
        assert_eq!(sink.blocks_handed_off(), saved.len() as u64);
    }

    #[test]
    fn overrun_when_spare_still_with_worker() {
        let (mut sink, mut handoff) = SampleSink::new(&group(4, 2, 2)).unwrap();

        // Fill buffer A; it goes to the worker, which never returns it.
        for i in 0..2 {
            sink.push(&SampleChunk::new(&chunk_data(i, 4), 2)).unwrap();
        }
        let held = match handoff.jobs.try_recv() {
            Ok(PersistJob::Save(block)) => block,
            other => panic!("expected a save job, got {:?}", other),
        };
        let snapshot = held.data.clone();

        // Fill buffer B while A is still being persisted.
        sink.push(&SampleChunk::new(&chunk_data(2, 4), 2)).unwrap();
        let err = sink
            .push(&SampleChunk::new(&chunk_data(3, 4), 2))
            .unwrap_err();
        assert!(matches!(err, DaqError::BufferOverrunFatal { ref task } if task == "analog"));

        // The worker's buffer is untouched and nothing new was handed off.
        assert_eq!(held.data, snapshot);
        assert!(handoff.jobs.try_recv().is_err());
    }

    #[test]
    fn recycled_buffer_prevents_overrun() {
        let (mut sink, mut handoff) = SampleSink::new(&group(4, 1, 1)).unwrap();
        for i in 0..6 {
            let data: Vec<f64> = (0..4).map(|s| (i * 4 + s) as f64).collect();
            sink.push(&SampleChunk::new(&data, 1)).unwrap();
            if let Ok(PersistJob::Save(block)) = handoff.jobs.try_recv() {
                handoff.recycle.try_send(block.data).unwrap();
            }
        }
        assert_eq!(sink.blocks_handed_off(), 6);
    }

    #[test]
    fn take_partial_copies_cursor_region() {
        let (mut sink, _handoff) = SampleSink::new(&group(3, 4, 2)).unwrap();
        sink.push(&SampleChunk::new(&chunk_data(0, 3), 2)).unwrap();
        let block = sink.take_partial().unwrap();
        assert_eq!(block.scans, 3);
        assert_eq!(block.data, chunk_data(0, 3));
        assert_eq!(sink.cursor(), 0);
        assert!(sink.take_partial().is_none());
    }

    #[test]
    fn rejects_wrong_chunk_shape() {
        let (mut sink, _handoff) = SampleSink::new(&group(3, 2, 2)).unwrap();
        let data = vec![0.0; 4];
        assert!(sink.push(&SampleChunk::new(&data, 2)).is_err());
    }

    #[test]
    fn rejects_capacity_not_multiple_of_chunk() {
        let mut bad = group(3, 2, 1);
        bad.capacity = 7;
        assert!(SampleSink::new(&bad).is_err());
    }
}

//! One hardware channel group wired to its sink, worker and plot tap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::channel_group::{ChannelGroup, ChunkControl};
use super::double_buffer::SampleSink;
use super::persistence::{PersistenceWorker, StorageBackend};
use super::plot_tap::{PlotRing, PlotTap};
use crate::error::{AppResult, DaqError, DriverError, DriverErrorKind};
use crate::hardware::capabilities::{AcquisitionDriver, ChunkHandler};
use crate::session::MotionReader;

/// Per-session resources handed to every task on start.
#[derive(Clone)]
pub struct TaskContext {
    /// Timestamp shared by all stream files of the session.
    pub stamp: String,
    pub storage: Arc<dyn StorageBackend>,
    pub motion: MotionReader,
    pub faults: mpsc::UnboundedSender<DaqError>,
}

/// What a task persisted during one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: String,
    pub path: PathBuf,
    pub sample_rate: f64,
    pub scans: u64,
    pub blocks: u64,
    pub plot_chunks_skipped: u64,
}

struct ActiveRun {
    sink: Arc<Mutex<SampleSink>>,
    worker: PersistenceWorker,
}

/// Couples one channel group to its acquisition driver, double buffer,
/// persistence worker and optional live-view ring.
pub struct ChannelTask {
    group: ChannelGroup,
    driver: Box<dyn AcquisitionDriver>,
    plot: Option<PlotTap>,
    plot_skipped: Arc<AtomicU64>,
    run: Option<ActiveRun>,
}

impl ChannelTask {
    /// `plot_capacity` sizes the live-view ring; no ring is created when the
    /// group has no plot channel.
    pub fn new(group: ChannelGroup, driver: Box<dyn AcquisitionDriver>, plot_capacity: usize) -> Self {
        let plot = group
            .plot_channel
            .filter(|_| plot_capacity > 0)
            .map(|_| PlotRing::shared(plot_capacity));
        Self {
            group,
            driver,
            plot,
            plot_skipped: Arc::new(AtomicU64::new(0)),
            run: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.group.name
    }

    pub fn group(&self) -> &ChannelGroup {
        &self.group
    }

    pub fn plot(&self) -> Option<PlotTap> {
        self.plot.clone()
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Hardware task has delivered its last callback.
    pub fn is_done(&self) -> bool {
        self.driver.is_done()
    }

    /// Configure the driver, open the stream and start sampling.
    pub fn start(&mut self, ctx: &TaskContext) -> AppResult<()> {
        if self.run.is_some() {
            return Err(DriverError::new(
                self.driver.driver_type(),
                DriverErrorKind::Initialization,
                format!("Task '{}' is already running", self.group.name),
            )
            .into());
        }

        self.driver.configure(&self.group)?;
        let (mut sink, handoff) = SampleSink::new(&self.group)?;
        sink.reset();
        let writer = ctx
            .storage
            .open(&self.group, &ctx.stamp)
            .map_err(|e| DaqError::persistence(self.group.name.clone(), e))?;
        let worker =
            PersistenceWorker::spawn(self.group.name.clone(), writer, handoff, ctx.faults.clone())?;
        let sink = Arc::new(Mutex::new(sink));

        if let Some(plot) = &self.plot {
            plot.lock().clear();
        }
        self.plot_skipped.store(0, Ordering::SeqCst);

        let handler = self.chunk_handler(Arc::clone(&sink), ctx);
        // On failure the handler and worker are dropped, which closes the
        // handoff channel and lets the worker thread exit.
        self.driver.start(handler)?;

        info!(
            task = %self.group.name,
            sample_rate = self.group.sample_rate,
            chunk_size = self.group.chunk_size,
            capacity = self.group.capacity,
            "Channel task started"
        );
        self.run = Some(ActiveRun { sink, worker });
        Ok(())
    }

    fn chunk_handler(&self, sink: Arc<Mutex<SampleSink>>, ctx: &TaskContext) -> ChunkHandler {
        let task = self.group.name.clone();
        let plot = self.plot.clone().zip(self.group.plot_channel);
        let skipped = Arc::clone(&self.plot_skipped);
        let motion = ctx.motion.clone();
        let faults = ctx.faults.clone();
        let mut failed = false;

        Box::new(move |chunk| {
            if failed {
                return ChunkControl::Stop;
            }
            if let Err(e) = sink.lock().push(&chunk) {
                error!(task = %task, error = %e, "Acquisition aborted in callback");
                failed = true;
                let _ = faults.send(e);
                return ChunkControl::Stop;
            }

            if let Some((ring, channel)) = &plot {
                match ring.try_lock() {
                    Some(mut ring) => ring.write_column(&chunk, *channel),
                    None => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            if motion.is_enabled() {
                ChunkControl::Continue
            } else {
                // This chunk carries the disabled enable level; it is the last one.
                debug!(task = %task, "Motion disabled, trailing chunk recorded");
                ChunkControl::Stop
            }
        })
    }

    /// Ask the driver to stop sampling.
    pub fn stop_driver(&mut self) -> AppResult<()> {
        self.driver.stop()?;
        Ok(())
    }

    /// Flush the partial buffer, close the stream and join the worker.
    ///
    /// Must only be called once the driver is done. Returns `None` when the
    /// task was not running.
    pub async fn finish(&mut self) -> AppResult<Option<TaskReport>> {
        let Some(run) = self.run.take() else {
            return Ok(None);
        };

        let (partial, total_scans) = {
            let mut sink = run.sink.lock();
            (sink.take_partial(), sink.total_scans())
        };
        let summary = run.worker.finish(partial).await?;
        if summary.scans != total_scans {
            debug!(
                task = %self.group.name,
                persisted = summary.scans,
                acquired = total_scans,
                "Not every acquired scan reached storage"
            );
        }

        let report = TaskReport {
            task: self.group.name.clone(),
            path: summary.path,
            sample_rate: self.group.sample_rate,
            scans: summary.scans,
            blocks: summary.blocks,
            plot_chunks_skipped: self.plot_skipped.load(Ordering::SeqCst),
        };
        info!(
            task = %report.task,
            scans = report.scans,
            blocks = report.blocks,
            path = %report.path.display(),
            "Channel task finished"
        );
        Ok(Some(report))
    }
}

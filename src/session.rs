//! Session orchestration
//!
//! [`SessionOrchestrator`] sequences one recording:
//!
//! 1. prepare handshake with the motor controller (skipped when standalone)
//! 2. relay code for the selected load
//! 3. start every [`ChannelTask`], then raise the motor trigger
//! 4. ... session runs ...
//! 5. drop trigger, relay and prepare, run the stop handshake
//! 6. disable motion, wait for every task to report done, flush partial buffers
//! 7. fetch and clean remote files, merge streams, write the manifest
//!
//! Results are reported as [`SessionEvent`]s on an unbounded channel. Any
//! hardware or handshake error latches the session until
//! [`SessionOrchestrator::clear_latch`] is called by the next external
//! trigger.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::acquisition::persistence::{CsvStorage, StorageBackend};
use crate::acquisition::plot_tap::PlotTap;
use crate::acquisition::task::{ChannelTask, TaskContext, TaskReport};
use crate::config::{parse_code, LoadEntry, SessionConfig};
use crate::error::{AppResult, DaqError};
use crate::handshake::{HandshakeController, HandshakeLines, HandshakeState};
use crate::hardware::capabilities::{DigitalOutput, DigitalPort, RemoteController};
use crate::merge::concat::{concat_parts, concat_task_groups, ConcatOptions};
use crate::merge::stream::{merge_stream_files, StreamMerger};
use crate::metadata::{system_info, SessionManifest};

// =============================================================================
// Motion flag
// =============================================================================

/// "Motor may move" flag. Only the orchestrator writes it.
#[derive(Debug, Default)]
pub struct MotionFlag {
    flag: Arc<AtomicBool>,
}

impl MotionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Read-only handle for acquisition callbacks.
    pub fn reader(&self) -> MotionReader {
        MotionReader {
            flag: Arc::clone(&self.flag),
        }
    }
}

/// Read side of a [`MotionFlag`].
#[derive(Debug, Clone)]
pub struct MotionReader {
    flag: Arc<AtomicBool>,
}

impl MotionReader {
    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Status reported to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StartSucceeded,
    StartFailed(String),
    /// Files produced by the session (streams, remote files, merged table).
    StopSucceeded(Vec<PathBuf>),
    StopFailed(String),
    /// Automatic mode moved on to load `index`.
    IterationAdvanced(usize),
    /// Tables concatenated over a finished automatic run.
    RunMerged(Vec<PathBuf>),
    AllIterationsComplete,
    MergeFailed(String),
}

pub type EventStream = mpsc::UnboundedReceiver<SessionEvent>;

/// Outputs driven directly by the orchestrator.
#[derive(Clone)]
pub struct OutputLines {
    /// Motor start trigger.
    pub trigger: Arc<dyn DigitalOutput>,
    /// Load selection relays.
    pub relay: Arc<dyn DigitalPort>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Running,
}

struct ActiveSession {
    stamp: String,
    dir: PathBuf,
    started_at: DateTime<Local>,
    load: Option<LoadEntry>,
}

/// Files of the finished sessions of the current automatic run.
#[derive(Default)]
struct RunOutputs {
    streams: Vec<PathBuf>,
    merged: Vec<PathBuf>,
}

struct ShutdownOutcome {
    reports: Vec<TaskReport>,
    remote_files: Vec<PathBuf>,
    error: Option<DaqError>,
}

/// Keep the first error of a teardown; later ones are only logged.
fn keep_first(err: DaqError, first: &mut Option<DaqError>) {
    warn!(error = %err, "Error during shutdown");
    if first.is_none() {
        *first = Some(err);
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SessionOrchestrator`].
pub struct SessionOrchestratorBuilder {
    config: SessionConfig,
    tasks: Vec<ChannelTask>,
    handshake_lines: Option<HandshakeLines>,
    outputs: Option<OutputLines>,
    remote: Option<Arc<dyn RemoteController>>,
    storage: Option<Arc<dyn StorageBackend>>,
}

impl SessionOrchestratorBuilder {
    pub fn task(mut self, task: ChannelTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn tasks(mut self, tasks: impl IntoIterator<Item = ChannelTask>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn handshake_lines(mut self, lines: HandshakeLines) -> Self {
        self.handshake_lines = Some(lines);
        self
    }

    pub fn outputs(mut self, outputs: OutputLines) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteController>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use this backend for every session instead of CSV files in the
    /// session directory.
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate, connect to the remote controller and build.
    pub async fn build(self) -> AppResult<(SessionOrchestrator, EventStream)> {
        self.config.validate()?;
        if self.tasks.is_empty() {
            return Err(DaqError::Configuration("No channel tasks configured".into()));
        }
        let lines = self
            .handshake_lines
            .ok_or_else(|| DaqError::Configuration("Handshake lines not set".into()))?;
        let outputs = self
            .outputs
            .ok_or_else(|| DaqError::Configuration("Output lines not set".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| DaqError::Configuration("Remote controller not set".into()))?;

        let remote_connected = self.config.remote.enabled && remote.connect().await;
        if self.config.remote.enabled && !remote_connected {
            warn!(host = %self.config.remote.host, "Remote controller unreachable, running standalone");
        }

        let handshake = HandshakeController::new(lines, Arc::clone(&remote), &self.config.handshake);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        info!(
            tasks = self.tasks.len(),
            remote_connected,
            automatic = self.config.automatic.enabled,
            "Session orchestrator ready"
        );

        let orchestrator = SessionOrchestrator {
            config: self.config,
            tasks: self.tasks,
            handshake,
            remote,
            remote_connected,
            outputs,
            storage: self.storage,
            motion: MotionFlag::new(),
            events: event_tx,
            fault_tx,
            fault_rx,
            phase: SessionPhase::Idle,
            latched: None,
            iteration: 0,
            current: None,
            run: RunOutputs::default(),
        };
        Ok((orchestrator, event_rx))
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Control plane of a recording session.
pub struct SessionOrchestrator {
    config: SessionConfig,
    tasks: Vec<ChannelTask>,
    handshake: HandshakeController,
    remote: Arc<dyn RemoteController>,
    remote_connected: bool,
    outputs: OutputLines,
    storage: Option<Arc<dyn StorageBackend>>,
    motion: MotionFlag,
    events: mpsc::UnboundedSender<SessionEvent>,
    fault_tx: mpsc::UnboundedSender<DaqError>,
    fault_rx: mpsc::UnboundedReceiver<DaqError>,
    phase: SessionPhase,
    latched: Option<String>,
    iteration: usize,
    current: Option<ActiveSession>,
    run: RunOutputs,
}

impl SessionOrchestrator {
    pub fn builder(config: SessionConfig) -> SessionOrchestratorBuilder {
        SessionOrchestratorBuilder {
            config,
            tasks: Vec::new(),
            handshake_lines: None,
            outputs: None,
            remote: None,
            storage: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == SessionPhase::Running
    }

    /// Reason of the latched error, if any.
    pub fn latched(&self) -> Option<&str> {
        self.latched.as_deref()
    }

    pub fn is_standalone(&self) -> bool {
        !self.remote_connected
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn motion_enabled(&self) -> bool {
        self.motion.is_enabled()
    }

    /// Live-view rings of the tasks that have one.
    pub fn plot_taps(&self) -> Vec<(String, PlotTap)> {
        self.tasks
            .iter()
            .filter_map(|task| task.plot().map(|tap| (task.name().to_string(), tap)))
            .collect()
    }

    /// Clear a latched error. Called on the next external trigger.
    pub fn clear_latch(&mut self) {
        if let Some(reason) = self.latched.take() {
            info!(reason = %reason, "Latched error cleared");
        }
    }

    /// External start/stop trigger: stops a running session, otherwise clears
    /// any latched error and starts a new one.
    pub async fn trigger(&mut self) -> AppResult<()> {
        if self.is_running() {
            self.stop().await
        } else {
            self.clear_latch();
            self.start().await
        }
    }

    fn emit(&self, event: SessionEvent) {
        debug!(?event, "Session event");
        // Nobody listening is not an error for the control plane.
        let _ = self.events.send(event);
    }

    fn latch(&mut self, err: &DaqError) {
        if err.is_terminal() {
            self.latched = Some(err.to_string());
        }
    }

    fn current_load(&self) -> Option<LoadEntry> {
        if self.config.automatic.enabled {
            self.config.automatic.loads.get(self.iteration).cloned()
        } else {
            None
        }
    }

    fn relay_code(&self, load: Option<&LoadEntry>) -> AppResult<Option<Vec<bool>>> {
        match (load, &self.config.automatic.manual_code) {
            (Some(load), _) => load.bits().map(Some),
            (None, Some(code)) => parse_code(code).map(Some),
            (None, None) => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // start
    // -------------------------------------------------------------------------

    /// Prepare the controller and start every channel task.
    pub async fn start(&mut self) -> AppResult<()> {
        if let Some(reason) = &self.latched {
            let err = DaqError::SessionLatched(reason.clone());
            warn!(error = %err, "Start refused");
            self.emit(SessionEvent::StartFailed(err.to_string()));
            return Err(err);
        }
        if self.is_running() {
            warn!("Start requested while a session is running");
            return Ok(());
        }

        match self.try_start().await {
            Ok(()) => {
                self.phase = SessionPhase::Running;
                info!(iteration = self.iteration, "Session started");
                self.emit(SessionEvent::StartSucceeded);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Session start failed");
                self.abort_start().await;
                self.latch(&err);
                self.emit(SessionEvent::StartFailed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn try_start(&mut self) -> AppResult<()> {
        if self.remote_connected {
            self.handshake.prepare().await?;
        } else {
            debug!("Standalone session, handshake skipped");
        }

        let load = self.current_load();
        if let Some(code) = self.relay_code(load.as_ref())? {
            self.outputs.relay.write_lines(&code).await?;
            debug!(load = ?load.as_ref().map(|l| &l.id), ?code, "Relay code set");
        }

        let started_at = Local::now();
        let stamp = started_at.format("%Y%m%d_%H%M%S_%3f").to_string();
        let dir = self.config.acquisition.output_dir.join(format!("session_{}", stamp));
        tokio::fs::create_dir_all(&dir).await?;
        let storage = self
            .storage
            .clone()
            .unwrap_or_else(|| Arc::new(CsvStorage::new(&dir)));

        // Faults of a previous session are stale.
        while self.fault_rx.try_recv().is_ok() {}

        self.current = Some(ActiveSession {
            stamp: stamp.clone(),
            dir,
            started_at,
            load,
        });

        self.motion.enable();
        let ctx = TaskContext {
            stamp,
            storage,
            motion: self.motion.reader(),
            faults: self.fault_tx.clone(),
        };
        for task in &mut self.tasks {
            task.start(&ctx)?;
        }

        self.outputs.trigger.write_line(true).await?;
        Ok(())
    }

    /// Undo a partial start: lines low, controller released, started tasks
    /// stopped and flushed.
    async fn abort_start(&mut self) {
        if let Err(e) = self.outputs.trigger.write_line(false).await {
            warn!(error = %e, "Could not release trigger line");
        }
        self.release_relays().await;
        if self.remote_connected && self.handshake.state() == HandshakeState::Armed {
            if let Err(e) = self.handshake.stop().await {
                warn!(error = %e, "Could not release controller after failed start");
            }
        }
        self.motion.disable();
        for task in &mut self.tasks {
            if task.is_running() {
                if let Err(e) = task.stop_driver() {
                    warn!(task = %task.name(), error = %e, "Driver stop failed");
                }
                if let Err(e) = task.finish().await {
                    warn!(task = %task.name(), error = %e, "Flush after failed start failed");
                }
            }
        }
        self.current = None;
    }

    async fn release_relays(&self) {
        let width = self.config.relay_width();
        if width == 0 {
            return;
        }
        if let Err(e) = self.outputs.relay.write_lines(&vec![false; width]).await {
            warn!(error = %e, "Could not release relay lines");
        }
    }

    // -------------------------------------------------------------------------
    // stop
    // -------------------------------------------------------------------------

    /// Stop the running session. A no-op when idle.
    pub async fn stop(&mut self) -> AppResult<()> {
        self.stop_with(None).await
    }

    async fn stop_with(&mut self, cause: Option<DaqError>) -> AppResult<()> {
        if !self.is_running() {
            debug!("Stop requested with no active session");
            return Ok(());
        }

        let outcome = self.shutdown(cause).await;
        let session = self.current.take();
        self.phase = SessionPhase::Idle;

        let mut files: Vec<PathBuf> = outcome.reports.iter().map(|r| r.path.clone()).collect();
        files.extend(outcome.remote_files.iter().cloned());

        let merged = match (&outcome.error, &session) {
            (None, Some(session)) if self.config.merge.enabled => {
                match self.merge_session(&outcome.reports, session).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!(error = %e, "Post-processing merge failed");
                        self.emit(SessionEvent::MergeFailed(e.to_string()));
                        None
                    }
                }
            }
            _ => None,
        };
        files.extend(merged.iter().cloned());

        if let Some(session) = &session {
            let manifest = SessionManifest {
                experiment_id: self.config.merge.experiment_id.clone(),
                stamp: session.stamp.clone(),
                iteration: self.iteration,
                load: session.load.clone(),
                standalone: !self.remote_connected,
                started_at: session.started_at,
                stopped_at: Local::now(),
                tasks: outcome.reports.clone(),
                remote_files: outcome.remote_files.clone(),
                merged: merged.clone(),
                error: outcome.error.as_ref().map(ToString::to_string),
                system_info: system_info(),
            };
            match manifest.write_to(&session.dir).await {
                Ok(path) => files.push(path),
                Err(e) => warn!(error = %e, "Could not write session manifest"),
            }
        }

        if let Some(err) = outcome.error {
            error!(error = %err, "Session stopped with error");
            self.latch(&err);
            if self.config.automatic.enabled && self.iteration > 0 {
                warn!(iteration = self.iteration, "Automatic sequence cancelled");
            }
            self.iteration = 0;
            self.run = RunOutputs::default();
            self.emit(SessionEvent::StopFailed(err.to_string()));
            return Err(err);
        }

        if self.config.automatic.enabled {
            self.run
                .streams
                .extend(outcome.reports.iter().map(|r| r.path.clone()));
            self.run.merged.extend(merged.iter().cloned());
        }

        info!(files = files.len(), "Session stopped");
        self.emit(SessionEvent::StopSucceeded(files));
        self.advance_iteration().await;
        Ok(())
    }

    /// Abort the running session because of a fault raised on the data plane.
    pub async fn handle_fault(&mut self, fault: DaqError) -> AppResult<()> {
        if !self.is_running() {
            debug!(error = %fault, "Fault after session end ignored");
            return Ok(());
        }
        error!(error = %fault, "Aborting session");
        self.stop_with(Some(fault)).await
    }

    /// Wait for the next data-plane fault.
    pub async fn next_fault(&mut self) -> Option<DaqError> {
        self.fault_rx.recv().await
    }

    async fn shutdown(&mut self, cause: Option<DaqError>) -> ShutdownOutcome {
        // The fault that aborted the session takes precedence.
        let mut error: Option<DaqError> = cause;

        while let Ok(fault) = self.fault_rx.try_recv() {
            keep_first(fault, &mut error);
        }

        if let Err(e) = self.outputs.trigger.write_line(false).await {
            keep_first(e.into(), &mut error);
        }
        self.release_relays().await;

        if self.remote_connected {
            if let Err(e) = self.handshake.stop().await {
                keep_first(e, &mut error);
            }
        }

        // Let the tasks sample the released enable line.
        tokio::time::sleep(self.config.acquisition.stop_settle()).await;
        self.motion.disable();

        let acq = &self.config.acquisition;
        let mut all_done = false;
        for _ in 0..acq.done_max_polls {
            if self.tasks.iter().all(ChannelTask::is_done) {
                all_done = true;
                break;
            }
            tokio::time::sleep(acq.done_poll_interval()).await;
        }
        if !all_done {
            warn!("Channel tasks did not report done in time, forcing stop");
        }
        for task in &mut self.tasks {
            if let Err(e) = task.stop_driver() {
                keep_first(e, &mut error);
            }
        }

        let mut reports = Vec::with_capacity(self.tasks.len());
        for task in &mut self.tasks {
            match task.finish().await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => keep_first(e, &mut error),
            }
        }
        while let Ok(fault) = self.fault_rx.try_recv() {
            keep_first(fault, &mut error);
        }

        let mut remote_files = Vec::new();
        if self.remote_connected {
            let remote = &self.config.remote;
            if error.is_none() {
                if let Some(session) = &self.current {
                    let local = session.dir.join("remote");
                    match self.remote.download_folder(&remote.remote_path, &local).await {
                        Ok(files) => remote_files = files,
                        Err(e) => keep_first(e, &mut error),
                    }
                }
            }
            match self
                .remote
                .remove_files(&remote.remote_path, &remote.file_extension)
                .await
            {
                Ok(removed) => debug!(removed, "Remote files removed"),
                Err(e) => warn!(error = %e, "Remote cleanup failed"),
            }
        }

        ShutdownOutcome {
            reports,
            remote_files,
            error,
        }
    }

    async fn merge_session(&self, reports: &[TaskReport], session: &ActiveSession) -> AppResult<PathBuf> {
        let merge = self.config.merge.clone();
        let paths: Vec<PathBuf> = reports.iter().map(|r| r.path.clone()).collect();
        let load_id = session
            .load
            .as_ref()
            .map(|l| l.id.clone())
            .unwrap_or_else(|| "manual".to_string());
        let output = session
            .dir
            .join(format!("DAQ-{}-{}.csv", merge.experiment_id, load_id));

        tokio::task::spawn_blocking(move || -> AppResult<PathBuf> {
            let merger = StreamMerger::new(&merge.enable_column)
                .binary_columns(merge.binary_columns.iter().cloned());
            merge_stream_files(&merger, &paths, &output)?;
            Ok(output)
        })
        .await
        .map_err(|e| DaqError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// Concatenate the run's streams per task into `DAQ-{task}-{exp}.csv` and
    /// its per-load merged tables into `DAQ-{exp}.csv`, both in the output
    /// directory.
    async fn merge_run(&self, run: RunOutputs) -> AppResult<Vec<PathBuf>> {
        let keywords: Vec<String> = self.tasks.iter().map(|t| t.name().to_string()).collect();
        let experiment_id = self.config.merge.experiment_id.clone();
        let out_dir = self.config.acquisition.output_dir.clone();

        tokio::task::spawn_blocking(move || -> AppResult<Vec<PathBuf>> {
            let mut outputs = concat_task_groups(&run.streams, &keywords, &experiment_id, &out_dir)?;
            if run.merged.is_empty() {
                warn!("No merged session tables in this run");
            } else {
                let table = concat_parts(&run.merged, ConcatOptions::default())?;
                let output = out_dir.join(format!("DAQ-{}.csv", experiment_id));
                table.write_csv(&output)?;
                info!(loads = run.merged.len(), rows = table.len(), path = %output.display(), "Run table written");
                outputs.push(output);
            }
            Ok(outputs)
        })
        .await
        .map_err(|e| DaqError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    async fn advance_iteration(&mut self) {
        if !self.config.automatic.enabled {
            return;
        }
        self.iteration += 1;
        self.emit(SessionEvent::IterationAdvanced(self.iteration));

        if self.iteration >= self.config.automatic.loads.len() {
            info!(iterations = self.iteration, "All automatic iterations complete");
            self.iteration = 0;
            let run = std::mem::take(&mut self.run);
            if self.config.merge.enabled {
                match self.merge_run(run).await {
                    Ok(files) => self.emit(SessionEvent::RunMerged(files)),
                    Err(e) => {
                        warn!(error = %e, "Run merge failed");
                        self.emit(SessionEvent::MergeFailed(e.to_string()));
                    }
                }
            }
            self.emit(SessionEvent::AllIterationsComplete);
            return;
        }

        let delay = std::time::Duration::from_millis(self.config.automatic.return_delay_ms);
        info!(next = self.iteration, ?delay, "Waiting for motor to return to origin");
        tokio::time::sleep(delay).await;
        // A failed start is reported through its own event and latch.
        let _ = self.start().await;
    }

    /// Session output directory of the running session.
    pub fn session_dir(&self) -> Option<&Path> {
        self.current.as_ref().map(|s| s.dir.as_path())
    }
}

//! Mock Hardware Implementations
//!
//! Simulated collaborators for running the bench without a DAQ card or a
//! motor controller.
//!
//! # Available Mocks
//!
//! - `MockAcquisitionDriver` - thread that generates chunks per channel signal
//! - `MockLine` / `MockPort` - output lines that record every write
//! - `SimulatedController` - motor controller answering the prepare/status
//!   handshake, with an in-memory file store for the remote channel
//!
//! # Timing
//!
//! - `MockMode::Instant`: chunks are delivered back to back, polls answer at once
//! - `MockMode::Realistic`: one chunk per `chunk_size / sample_rate` seconds

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::acquisition::channel_group::{ChannelGroup, ChunkControl, SampleChunk};
use crate::error::{AppResult, DaqError, DriverError, DriverErrorKind};
use crate::hardware::capabilities::{
    AcquisitionDriver, ChunkHandler, DigitalInput, DigitalOutput, DigitalPort, DriverResult,
    RemoteController,
};

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests and demos
    Realistic,
}

// =============================================================================
// MockLine / MockPort - Recording Outputs
// =============================================================================

#[derive(Debug, Default)]
struct LineState {
    level: bool,
    /// Level changes in time order.
    history: Vec<(Instant, bool)>,
    writes: Vec<bool>,
}

/// Digital output line that records its writes.
///
/// Cloning shares the line, so a driver signal can follow a line that the
/// session drives.
#[derive(Debug, Clone, Default)]
pub struct MockLine {
    name: String,
    state: Arc<Mutex<LineState>>,
}

impl MockLine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> bool {
        self.state.lock().level
    }

    /// Every value written, including repeats.
    pub fn writes(&self) -> Vec<bool> {
        self.state.lock().writes.clone()
    }

    /// Level the line had at `at`.
    pub fn level_at(&self, at: Instant) -> bool {
        let state = self.state.lock();
        state
            .history
            .iter()
            .rev()
            .find(|(t, _)| *t <= at)
            .map(|(_, level)| *level)
            .unwrap_or(false)
    }

    fn set(&self, value: bool) {
        let mut state = self.state.lock();
        state.writes.push(value);
        if state.level != value {
            state.level = value;
            state.history.push((Instant::now(), value));
        }
    }
}

#[async_trait]
impl DigitalOutput for MockLine {
    async fn write_line(&self, value: bool) -> DriverResult<()> {
        debug!(line = %self.name, value, "MockLine write");
        self.set(value);
        Ok(())
    }
}

/// Multi-line output port that records every code written.
#[derive(Debug, Clone, Default)]
pub struct MockPort {
    name: String,
    writes: Arc<Mutex<Vec<Vec<bool>>>>,
}

impl MockPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writes: Arc::default(),
        }
    }

    pub fn writes(&self) -> Vec<Vec<bool>> {
        self.writes.lock().clone()
    }

    pub fn last(&self) -> Option<Vec<bool>> {
        self.writes.lock().last().cloned()
    }
}

#[async_trait]
impl DigitalPort for MockPort {
    async fn write_lines(&self, values: &[bool]) -> DriverResult<()> {
        debug!(port = %self.name, ?values, "MockPort write");
        self.writes.lock().push(values.to_vec());
        Ok(())
    }
}

// =============================================================================
// SimulatedController - Motor Controller Handshake + Files
// =============================================================================

/// How the simulated controller answers one prepare request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerResponse {
    /// Report (1,0) once `after_polls` status polls have passed.
    Arm { after_polls: u32 },
    /// Report (0,1) until prepare drops.
    Fault,
    /// Report (1,1) until prepare drops.
    BusFault,
    /// Keep reporting (0,0).
    Silent,
}

#[derive(Debug)]
struct ControllerState {
    reachable: bool,
    prepare: bool,
    current: ControllerResponse,
    script: VecDeque<ControllerResponse>,
    default_response: ControllerResponse,
    polls: u32,
    /// Status stays (1,0) after prepare drops.
    stuck_on_stop: bool,
    prepare_requests: u32,
    resets: u32,
    files: Vec<(String, Vec<u8>)>,
}

impl ControllerState {
    fn status(&self) -> (bool, bool) {
        if !self.prepare {
            return if self.stuck_on_stop {
                (true, false)
            } else {
                (false, false)
            };
        }
        match self.current {
            ControllerResponse::Arm { after_polls } if self.polls >= after_polls => (true, false),
            ControllerResponse::Arm { .. } | ControllerResponse::Silent => (false, false),
            ControllerResponse::Fault => (false, true),
            ControllerResponse::BusFault => (true, true),
        }
    }
}

/// Simulated embedded motor controller.
///
/// Each rising edge on the prepare line consumes the next scripted
/// [`ControllerResponse`]; once the script is empty the default response is
/// used. Status bit 0 counts as one poll.
///
/// # Example
///
/// ```rust,ignore
/// let controller = SimulatedController::new()
///     .with_script([ControllerResponse::Fault, ControllerResponse::Arm { after_polls: 2 }]);
/// let prepare = controller.prepare_line();
/// let (bit0, bit1) = controller.status_lines();
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedController {
    state: Arc<Mutex<ControllerState>>,
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedController {
    /// Reachable controller that arms after one poll.
    pub fn new() -> Self {
        let default_response = ControllerResponse::Arm { after_polls: 1 };
        Self {
            state: Arc::new(Mutex::new(ControllerState {
                reachable: true,
                prepare: false,
                current: default_response,
                script: VecDeque::new(),
                default_response,
                polls: 0,
                stuck_on_stop: false,
                prepare_requests: 0,
                resets: 0,
                files: Vec::new(),
            })),
        }
    }

    pub fn unreachable(self) -> Self {
        self.state.lock().reachable = false;
        self
    }

    pub fn with_script(self, script: impl IntoIterator<Item = ControllerResponse>) -> Self {
        self.state.lock().script.extend(script);
        self
    }

    pub fn with_default_response(self, response: ControllerResponse) -> Self {
        self.state.lock().default_response = response;
        self
    }

    pub fn stuck_on_stop(self) -> Self {
        self.state.lock().stuck_on_stop = true;
        self
    }

    /// Add a file recorded by the controller during a run.
    pub fn add_remote_file(&self, name: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.state.lock().files.push((name.into(), contents.into()));
    }

    pub fn remote_files(&self) -> Vec<String> {
        self.state.lock().files.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn prepare_line(&self) -> ControllerPrepareLine {
        ControllerPrepareLine {
            state: Arc::clone(&self.state),
        }
    }

    /// Status inputs (bit 0, bit 1).
    pub fn status_lines(&self) -> (ControllerStatusLine, ControllerStatusLine) {
        (
            ControllerStatusLine {
                state: Arc::clone(&self.state),
                bit: 0,
            },
            ControllerStatusLine {
                state: Arc::clone(&self.state),
                bit: 1,
            },
        )
    }

    pub fn prepare_requests(&self) -> u32 {
        self.state.lock().prepare_requests
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().resets
    }

    pub fn is_prepared(&self) -> bool {
        self.state.lock().prepare
    }
}

/// Prepare output of a [`SimulatedController`].
#[derive(Debug, Clone)]
pub struct ControllerPrepareLine {
    state: Arc<Mutex<ControllerState>>,
}

#[async_trait]
impl DigitalOutput for ControllerPrepareLine {
    async fn write_line(&self, value: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        if value && !state.prepare {
            let next = state.script.pop_front().unwrap_or(state.default_response);
            state.current = next;
            state.polls = 0;
            state.prepare_requests += 1;
            debug!(response = ?next, "Simulated controller prepare request");
        }
        state.prepare = value;
        Ok(())
    }
}

/// One status input of a [`SimulatedController`].
#[derive(Debug, Clone)]
pub struct ControllerStatusLine {
    state: Arc<Mutex<ControllerState>>,
    bit: u8,
}

#[async_trait]
impl DigitalInput for ControllerStatusLine {
    async fn read_line(&self) -> DriverResult<bool> {
        let mut state = self.state.lock();
        if self.bit == 0 {
            state.polls += 1;
        }
        let (bit0, bit1) = state.status();
        Ok(if self.bit == 0 { bit0 } else { bit1 })
    }
}

#[async_trait]
impl RemoteController for SimulatedController {
    async fn connect(&self) -> bool {
        self.state.lock().reachable
    }

    async fn reset(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(DaqError::Remote("controller unreachable".into()));
        }
        state.resets += 1;
        info!(resets = state.resets, "Simulated controller reset");
        Ok(())
    }

    async fn download_folder(&self, remote_path: &str, local_dir: &Path) -> AppResult<Vec<PathBuf>> {
        let files = self.state.lock().files.clone();
        tokio::fs::create_dir_all(local_dir).await?;
        let mut written = Vec::with_capacity(files.len());
        for (name, contents) in files {
            let path = local_dir.join(&name);
            tokio::fs::write(&path, contents).await?;
            written.push(path);
        }
        debug!(remote_path, files = written.len(), "Simulated download");
        Ok(written)
    }

    async fn remove_files(&self, remote_path: &str, extension: &str) -> AppResult<usize> {
        let mut state = self.state.lock();
        let before = state.files.len();
        state.files.retain(|(name, _)| !name.ends_with(extension));
        let removed = before - state.files.len();
        debug!(remote_path, extension, removed, "Simulated remote cleanup");
        Ok(removed)
    }
}

// =============================================================================
// MockAcquisitionDriver - Simulated Sampling Task
// =============================================================================

/// Waveform produced on one simulated channel.
#[derive(Debug, Clone)]
pub enum MockSignal {
    Sine {
        amplitude: f64,
        frequency_hz: f64,
        offset: f64,
    },
    Constant(f64),
    /// Scan index as value, handy for checking ordering.
    ScanIndex,
    /// `high` for scans in `rise_scan..fall_scan`, 0 otherwise.
    Pulse {
        rise_scan: u64,
        fall_scan: u64,
        high: f64,
    },
    /// `high` while `line` is asserted, 0 otherwise.
    FollowLine { line: MockLine, high: f64 },
}

impl MockSignal {
    fn value(&self, scan: u64, t: f64, at: Instant) -> f64 {
        match self {
            MockSignal::Sine {
                amplitude,
                frequency_hz,
                offset,
            } => offset + amplitude * (2.0 * std::f64::consts::PI * frequency_hz * t).sin(),
            MockSignal::Constant(v) => *v,
            MockSignal::ScanIndex => scan as f64,
            MockSignal::Pulse {
                rise_scan,
                fall_scan,
                high,
            } => {
                if (*rise_scan..*fall_scan).contains(&scan) {
                    *high
                } else {
                    0.0
                }
            }
            MockSignal::FollowLine { line, high } => {
                if line.level_at(at) {
                    *high
                } else {
                    0.0
                }
            }
        }
    }
}

/// Simulated continuous sampling task.
///
/// Channels without an explicit signal get a 1 V, 5 Hz sine.
///
/// # Example
///
/// ```rust,ignore
/// let mut driver = MockAcquisitionDriver::new(MockMode::Instant)
///     .with_signal(0, MockSignal::ScanIndex)
///     .with_max_chunks(10);
/// driver.configure(&group)?;
/// driver.start(Box::new(|chunk| ChunkControl::Continue))?;
/// ```
pub struct MockAcquisitionDriver {
    mode: MockMode,
    signals: Vec<(usize, MockSignal)>,
    max_chunks: Option<u64>,
    chunk_interval: Option<Duration>,
    group: Option<ChannelGroup>,
    running: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    chunks_delivered: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MockAcquisitionDriver {
    pub fn new(mode: MockMode) -> Self {
        Self {
            mode,
            signals: Vec::new(),
            max_chunks: None,
            chunk_interval: None,
            group: None,
            running: Arc::new(AtomicBool::new(false)),
            done: Arc::new(AtomicBool::new(true)),
            chunks_delivered: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    /// Set the waveform of channel `channel`.
    pub fn with_signal(mut self, channel: usize, signal: MockSignal) -> Self {
        self.signals.retain(|(ch, _)| *ch != channel);
        self.signals.push((channel, signal));
        self
    }

    /// Stop by itself after `n` chunks, as a finite hardware task would.
    pub fn with_max_chunks(mut self, n: u64) -> Self {
        self.max_chunks = Some(n);
        self
    }

    /// Deliver chunks at this interval instead of the real-time rate.
    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = Some(interval);
        self
    }

    pub fn chunks_delivered(&self) -> u64 {
        self.chunks_delivered.load(Ordering::SeqCst)
    }

    fn channel_signals(&self, n_channels: usize) -> Vec<MockSignal> {
        (0..n_channels)
            .map(|ch| {
                self.signals
                    .iter()
                    .find(|(idx, _)| *idx == ch)
                    .map(|(_, signal)| signal.clone())
                    .unwrap_or(MockSignal::Sine {
                        amplitude: 1.0,
                        frequency_hz: 5.0,
                        offset: 0.0,
                    })
            })
            .collect()
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Mock acquisition thread panicked");
            }
        }
    }
}

impl AcquisitionDriver for MockAcquisitionDriver {
    fn driver_type(&self) -> &str {
        "mock"
    }

    fn configure(&mut self, group: &ChannelGroup) -> DriverResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(DriverError::new(
                "mock",
                DriverErrorKind::Configuration,
                format!("Task '{}' is running", group.name),
            ));
        }
        if group.channels.is_empty() || group.sample_rate <= 0.0 {
            return Err(DriverError::new(
                "mock",
                DriverErrorKind::Configuration,
                format!("Group '{}' needs channels and a positive rate", group.name),
            ));
        }
        self.group = Some(group.clone());
        Ok(())
    }

    fn start(&mut self, mut handler: ChunkHandler) -> DriverResult<()> {
        let group = self.group.clone().ok_or_else(|| {
            DriverError::new("mock", DriverErrorKind::Initialization, "start before configure")
        })?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DriverError::new(
                "mock",
                DriverErrorKind::Initialization,
                format!("Task '{}' already started", group.name),
            ));
        }
        // Reap a thread that ended by itself.
        self.join();

        let n_channels = group.channel_count();
        let chunk_size = group.chunk_size;
        let signals = self.channel_signals(n_channels);
        let interval = self
            .chunk_interval
            .unwrap_or_else(|| Duration::from_secs_f64(group.chunk_period_secs()));
        let scan_period = interval / chunk_size.max(1) as u32;
        let realistic = self.mode == MockMode::Realistic;
        let max_chunks = self.max_chunks;
        let sample_rate = group.sample_rate;

        let running = Arc::clone(&self.running);
        let done = Arc::clone(&self.done);
        let delivered = Arc::clone(&self.chunks_delivered);
        delivered.store(0, Ordering::SeqCst);
        done.store(false, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("daq-{}", group.name))
            .spawn(move || {
                let t0 = Instant::now();
                let mut buffer = vec![0.0; chunk_size * n_channels];
                let mut chunk_index: u64 = 0;

                while running.load(Ordering::SeqCst) {
                    if max_chunks.is_some_and(|max| chunk_index >= max) {
                        break;
                    }
                    if realistic {
                        let deadline = t0 + interval * (chunk_index as u32 + 1);
                        let now = Instant::now();
                        if deadline > now {
                            thread::sleep(deadline - now);
                        }
                    }

                    let first_scan = chunk_index * chunk_size as u64;
                    let now = Instant::now();
                    for i in 0..chunk_size {
                        let scan = first_scan + i as u64;
                        let t = scan as f64 / sample_rate;
                        let at = if realistic {
                            t0 + scan_period * scan as u32
                        } else {
                            now
                        };
                        for (ch, signal) in signals.iter().enumerate() {
                            buffer[i * n_channels + ch] = signal.value(scan, t, at);
                        }
                    }

                    let control = handler(SampleChunk::new(&buffer, n_channels));
                    chunk_index += 1;
                    delivered.store(chunk_index, Ordering::SeqCst);
                    if control == ChunkControl::Stop {
                        debug!(chunks = chunk_index, "Handler requested stop");
                        break;
                    }
                    if !realistic {
                        thread::yield_now();
                    }
                }

                running.store(false, Ordering::SeqCst);
                done.store(true, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                self.done.store(true, Ordering::SeqCst);
                DriverError::new("mock", DriverErrorKind::Initialization, e.to_string())
            })?;

        self.handle = Some(handle);
        info!(task = %group.name, chunk_size, n_channels, "Mock acquisition started");
        Ok(())
    }

    fn stop(&mut self) -> DriverResult<()> {
        self.running.store(false, Ordering::SeqCst);
        self.join();
        self.done.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl Drop for MockAcquisitionDriver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::channel_group::{AcquisitionKind, ChannelSpec, TerminalConfig};

    fn group(chunk_size: usize) -> ChannelGroup {
        ChannelGroup {
            name: "analog".into(),
            kind: AcquisitionKind::ContinuousVoltage,
            sample_rate: 1000.0,
            chunk_size,
            capacity: chunk_size * 2,
            trigger_source: None,
            channels: vec![
                ChannelSpec {
                    name: "idx".into(),
                    port: "Dev1/ai0".into(),
                    terminal: TerminalConfig::Default,
                },
                ChannelSpec {
                    name: "pulse".into(),
                    port: "Dev1/ai1".into(),
                    terminal: TerminalConfig::Default,
                },
            ],
            plot_channel: None,
        }
    }

    fn wait_done(driver: &MockAcquisitionDriver) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !driver.is_done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn delivers_max_chunks_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut driver = MockAcquisitionDriver::new(MockMode::Instant)
            .with_signal(0, MockSignal::ScanIndex)
            .with_signal(
                1,
                MockSignal::Pulse {
                    rise_scan: 3,
                    fall_scan: 6,
                    high: 5.0,
                },
            )
            .with_max_chunks(4);
        driver.configure(&group(2)).unwrap();
        driver
            .start(Box::new(move |chunk| {
                sink.lock().extend_from_slice(chunk.data());
                ChunkControl::Continue
            }))
            .unwrap();
        wait_done(&driver);

        let data = seen.lock().clone();
        let index: Vec<f64> = data.iter().step_by(2).copied().collect();
        let pulse: Vec<f64> = data.iter().skip(1).step_by(2).copied().collect();
        assert_eq!(index, (0..8).map(f64::from).collect::<Vec<_>>());
        assert_eq!(pulse, vec![0.0, 0.0, 0.0, 5.0, 5.0, 5.0, 0.0, 0.0]);
        assert_eq!(driver.chunks_delivered(), 4);
    }

    #[test]
    fn handler_stop_ends_task() {
        let mut driver = MockAcquisitionDriver::new(MockMode::Instant);
        driver.configure(&group(4)).unwrap();
        let mut calls = 0;
        driver
            .start(Box::new(move |_| {
                calls += 1;
                if calls == 3 {
                    ChunkControl::Stop
                } else {
                    ChunkControl::Continue
                }
            }))
            .unwrap();
        wait_done(&driver);
        assert_eq!(driver.chunks_delivered(), 3);
        driver.stop().unwrap();
    }

    #[test]
    fn start_before_configure_fails() {
        let mut driver = MockAcquisitionDriver::new(MockMode::Instant);
        let err = driver.start(Box::new(|_| ChunkControl::Stop)).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Initialization);
    }

    #[tokio::test]
    async fn controller_arms_after_polls_and_releases() {
        let controller = SimulatedController::new()
            .with_script([ControllerResponse::Arm { after_polls: 2 }]);
        let prepare = controller.prepare_line();
        let (bit0, bit1) = controller.status_lines();

        prepare.write_line(true).await.unwrap();
        assert!(!bit0.read_line().await.unwrap());
        assert!(bit0.read_line().await.unwrap());
        assert!(!bit1.read_line().await.unwrap());

        prepare.write_line(false).await.unwrap();
        assert!(!bit0.read_line().await.unwrap());
        assert_eq!(controller.prepare_requests(), 1);
    }

    #[tokio::test]
    async fn remote_files_download_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SimulatedController::new();
        controller.add_remote_file("Motor_1.csv", "t;x\n0;1\n");
        controller.add_remote_file("notes.txt", "keep");

        let files = controller.download_folder("/data", dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(dir.path().join("Motor_1.csv").exists());

        assert_eq!(controller.remove_files("/data", ".csv").await.unwrap(), 1);
        assert_eq!(controller.remote_files(), vec!["notes.txt".to_string()]);
    }

    #[test]
    fn line_history_tracks_levels() {
        let line = MockLine::new("trigger");
        let before = Instant::now();
        line.set(true);
        thread::sleep(Duration::from_millis(2));
        let during = Instant::now();
        line.set(false);
        assert!(!line.level_at(before));
        assert!(line.level_at(during));
        assert!(!line.level());
        assert_eq!(line.writes(), vec![true, false]);
    }
}

//! Hardware capability traits
//!
//! The acquisition core never talks to a vendor driver directly. It consumes
//! the small capability traits below, and a bench build plugs in whatever
//! implements them:
//!
//! - [`AcquisitionDriver`]: a hardware-timed sampling task that invokes a
//!   callback once per chunk on its own real-time context
//! - [`DigitalOutput`] / [`DigitalInput`] / [`DigitalPort`]: single lines and
//!   multi-line ports used by the handshake and the relay code
//! - [`RemoteController`]: the embedded motor controller's reset and file
//!   channels
//!
//! # Design Philosophy
//!
//! - Line and remote traits are async (`#[async_trait]`) and `Send + Sync`,
//!   they are driven from the control context
//! - [`AcquisitionDriver`] is synchronous: its callback runs on the driver's
//!   thread and must never await
//! - Each trait focuses on one thing, so tests can script them individually

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::acquisition::channel_group::{ChannelGroup, ChunkControl, SampleChunk};
use crate::error::{AppResult, DriverError};

/// Result type for driver collaborators.
pub type DriverResult<T> = Result<T, DriverError>;

/// Per-chunk callback handed to an [`AcquisitionDriver`].
///
/// Runs on the driver's real-time context. Returning [`ChunkControl::Stop`]
/// ends the hardware task after this chunk.
pub type ChunkHandler = Box<dyn FnMut(SampleChunk<'_>) -> ChunkControl + Send + 'static>;

/// Capability: continuous hardware-timed sampling of one channel group.
///
/// # Contract
/// - `configure` is called once per session before `start`
/// - after `start`, the handler receives exactly `chunk_size` scans per call
/// - `stop` is idempotent; `is_done` turns true once no more callbacks will run
pub trait AcquisitionDriver: Send + Sync {
    /// Short identifier used in logs and errors.
    fn driver_type(&self) -> &str;

    fn configure(&mut self, group: &ChannelGroup) -> DriverResult<()>;

    fn start(&mut self, handler: ChunkHandler) -> DriverResult<()>;

    fn stop(&mut self) -> DriverResult<()>;

    fn is_done(&self) -> bool;
}

/// Capability: drive one digital output line.
#[async_trait]
pub trait DigitalOutput: Send + Sync {
    async fn write_line(&self, value: bool) -> DriverResult<()>;
}

/// Capability: read one digital input line.
#[async_trait]
pub trait DigitalInput: Send + Sync {
    async fn read_line(&self) -> DriverResult<bool>;
}

/// Capability: drive several output lines at once, first line first.
#[async_trait]
pub trait DigitalPort: Send + Sync {
    async fn write_lines(&self, values: &[bool]) -> DriverResult<()>;
}

/// Capability: the embedded motor controller's management channel.
///
/// # Contract
/// - `connect` returns false when the controller is unreachable; the session
///   then runs standalone and never calls the other methods
/// - `reset` restarts the controller's runtime after a reported fault
#[async_trait]
pub trait RemoteController: Send + Sync {
    async fn connect(&self) -> bool;

    async fn reset(&self) -> AppResult<()>;

    /// Copy every file under `remote_path` into `local_dir`.
    async fn download_folder(&self, remote_path: &str, local_dir: &Path) -> AppResult<Vec<PathBuf>>;

    /// Delete files with `extension` under `remote_path`. Returns how many
    /// were removed.
    async fn remove_files(&self, remote_path: &str, extension: &str) -> AppResult<usize>;
}

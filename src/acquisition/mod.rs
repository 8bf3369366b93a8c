//! Acquisition-to-disk pipeline
//!
//! ```text
//! driver callback ─▶ SampleSink (double buffer) ─▶ PersistenceWorker ─▶ storage
//!        │
//!        └──────────▶ PlotRing (lossy live view)
//! ```
//!
//! A [`ChannelTask`] ties one hardware channel group to its sink, worker and
//! optional plot tap.

pub mod channel_group;
pub mod double_buffer;
pub mod persistence;
pub mod plot_tap;
pub mod task;

pub use channel_group::{AcquisitionKind, ChannelGroup, ChannelSpec, ChunkControl, SampleChunk, TerminalConfig};
pub use double_buffer::{Block, SampleSink};
pub use persistence::{BlockWriter, CsvStorage, PersistSummary, PersistenceWorker, StorageBackend};
pub use plot_tap::{PlotRing, PlotTap, WindowStats};
pub use task::{ChannelTask, TaskContext, TaskReport};

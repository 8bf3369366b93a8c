//! # TENG DAQ Core Library
//!
//! Data acquisition for a triboelectric nanogenerator test bench: a linear
//! motor moves the device while several hardware-timed channel groups are
//! sampled to disk, and an embedded motor controller records its own log.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the real-time path. Double-buffered sinks hand full
//!   buffers to one persistence thread per task; a lossy ring feeds the live
//!   view.
//! - **`handshake`**: prepare/stop protocol with the motor controller over
//!   three digital lines.
//! - **`session`**: `SessionOrchestrator`, which sequences start/stop,
//!   automatic load sweeps and error latching.
//! - **`merge`**: offline alignment of multi-rate streams and concatenation of
//!   part files.
//! - **`hardware`**: capability traits for drivers, plus simulated devices.
//! - **`config`**: TOML + environment configuration via `figment`.
//! - **`error`**: the `DaqError` enum shared by every layer.
//! - **`metadata`**: per-session JSON manifest.
//! - **`tracing_setup`**: `tracing-subscriber` initialization.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod handshake;
pub mod hardware;
pub mod merge;
pub mod metadata;
pub mod session;
pub mod tracing_setup;

pub use error::{AppResult, DaqError};
pub use session::{SessionEvent, SessionOrchestrator};

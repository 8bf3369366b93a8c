//! Hardware collaborators
//!
//! Capability traits consumed by the acquisition core, and simulated
//! implementations for running without a DAQ card or motor controller.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    AcquisitionDriver, ChunkHandler, DigitalInput, DigitalOutput, DigitalPort, DriverResult,
    RemoteController,
};

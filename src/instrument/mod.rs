//! Instrument capabilities and the machinery for driving them.
//!
//! - [`capabilities`] - the four bench roles as async traits
//! - [`wait`] - bounded polling and operator abort
//! - [`lock_in`] - SR844 setting tables
//! - [`sim`] - a simulated bench on the tokio clock

pub mod capabilities;
pub mod lock_in;
pub mod sim;
pub mod wait;

pub use capabilities::{
    DataAcquisitionUnit, InstrumentSet, LockInAmplifier, ModulationSettings, RotationStage,
    Waveform, WaveformGenerator,
};
pub use wait::{abort_pair, AbortHandle, AbortSignal, WaitPolicy};

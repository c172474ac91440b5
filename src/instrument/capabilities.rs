//! Capability traits for the four instrument roles on a gyroscope bench.
//!
//! The calibration and acquisition flows only ever talk to hardware through
//! these traits. Drivers translate them into whatever wire protocol the device
//! speaks (serial, GPIB, DAQmx); the core treats each call as an opaque,
//! possibly slow, procedure call.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capability for the rotation platform carrying the gyroscope coil.
///
/// Angles are in degrees, velocities in degrees per second.
#[async_trait]
pub trait RotationStage: Send + Sync {
    /// Set the move velocity in deg/s.
    async fn set_velocity(&self, deg_per_s: f64) -> Result<()>;
    /// Current move velocity in deg/s.
    async fn velocity(&self) -> Result<f64>;

    /// Start a clockwise move of `angle` degrees and return immediately.
    async fn cw(&self, angle: f64) -> Result<()>;

    /// Start a counter-clockwise move of `angle` degrees and return immediately.
    async fn ccw(&self, angle: f64) -> Result<()>;

    /// True when no move is in progress.
    async fn is_stationary(&self) -> Result<bool>;

    /// True once the current move has finished accelerating.
    async fn is_constant_speed(&self) -> Result<bool>;

    /// Halt any motion in progress.
    async fn stop(&self) -> Result<()>;
}

/// Capability for the lock-in amplifier demodulating the gyroscope signal.
#[async_trait]
pub trait LockInAmplifier: Send + Sync {
    /// Full-scale sensitivity in volts.
    async fn sensitivity(&self) -> Result<f64>;
    /// Select the full-scale sensitivity in volts.
    async fn set_sensitivity(&self, volts: f64) -> Result<()>;

    /// Output filter time constant in seconds.
    ///
    /// Some units answer with a stale buffered value right after other
    /// queries; callers that need the live value read it several times.
    async fn time_constant(&self) -> Result<f64>;

    /// Zero the quadrature output against the current input signal.
    async fn autophase(&self) -> Result<()>;
    /// Let the amplifier pick its own sensitivity.
    async fn autogain(&self) -> Result<()>;
}

/// Capability for the analog input sampling the lock-in output.
#[async_trait]
pub trait DataAcquisitionUnit: Send + Sync {
    /// Block for `duration_s` and return the samples taken at `frequency_hz`,
    /// in volts, scaled so that the input range spans `±max_voltage`.
    ///
    /// The number of samples returned may differ slightly from
    /// `duration_s * frequency_hz`.
    async fn read(&self, duration_s: f64, frequency_hz: f64, max_voltage: f64)
        -> Result<Vec<f64>>;
}

/// Capability for the function generator driving the phase modulator.
#[async_trait]
pub trait WaveformGenerator: Send + Sync {
    /// Output frequency in Hz.
    async fn frequency(&self) -> Result<f64>;
    /// Output amplitude in volts.
    async fn voltage(&self) -> Result<f64>;
    /// Output waveform.
    async fn waveform(&self) -> Result<Waveform>;
}

/// Output shape of the modulation waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    /// Sine
    Sine,
    /// Square
    Square,
    /// Ramp
    Ramp,
    /// Pulse
    Pulse,
    /// Noise
    Noise,
    /// DC level
    Dc,
    /// Arbitrary user waveform
    User,
}

impl Waveform {
    /// Short SCPI code, e.g. `SIN`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Waveform::Sine => "SIN",
            Waveform::Square => "SQU",
            Waveform::Ramp => "RAMP",
            Waveform::Pulse => "PULS",
            Waveform::Noise => "NOIS",
            Waveform::Dc => "DC",
            Waveform::User => "USER",
        }
    }

    /// Parse a short or long SCPI code, case-insensitively.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "SIN" | "SINE" => Some(Waveform::Sine),
            "SQU" | "SQUARE" => Some(Waveform::Square),
            "RAMP" => Some(Waveform::Ramp),
            "PULS" | "PULSE" => Some(Waveform::Pulse),
            "NOIS" | "NOISE" => Some(Waveform::Noise),
            "DC" => Some(Waveform::Dc),
            "USER" => Some(Waveform::User),
            _ => None,
        }
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the modulation settings, recorded with each run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModulationSettings {
    /// Hz
    pub frequency: f64,
    /// Volts
    pub voltage: f64,
    /// Output shape
    pub waveform: Waveform,
}

impl ModulationSettings {
    /// Query all three settings from `generator`.
    pub async fn read_from(generator: &dyn WaveformGenerator) -> Result<Self> {
        Ok(Self {
            frequency: generator.frequency().await?,
            voltage: generator.voltage().await?,
            waveform: generator.waveform().await?,
        })
    }
}

/// The full set of instrument handles a calibration/acquisition flow drives.
///
/// Flows take `&mut InstrumentSet`, so one session holds the handles at a
/// time. The set is deliberately not `Clone`.
pub struct InstrumentSet {
    /// Dither stage
    pub stage: Arc<dyn RotationStage>,
    /// Demodulating amplifier
    pub lock_in: Arc<dyn LockInAmplifier>,
    /// Analog sampler on the lock-in output
    pub daq: Arc<dyn DataAcquisitionUnit>,
    /// Phase modulation source
    pub generator: Arc<dyn WaveformGenerator>,
}

impl InstrumentSet {
    /// Bundle the four bench roles.
    pub fn new(
        stage: Arc<dyn RotationStage>,
        lock_in: Arc<dyn LockInAmplifier>,
        daq: Arc<dyn DataAcquisitionUnit>,
        generator: Arc<dyn WaveformGenerator>,
    ) -> Self {
        Self {
            stage,
            lock_in,
            daq,
            generator,
        }
    }
}

impl fmt::Debug for InstrumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSet").finish_non_exhaustive()
    }
}

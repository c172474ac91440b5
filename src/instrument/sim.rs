//! Simulated bench instruments.
//!
//! Provides a software gyroscope bench for testing the calibration and
//! acquisition flows without hardware. All timing runs on the tokio clock
//! (`tokio::time::sleep` / `tokio::time::Instant`), so tests can use
//! `#[tokio::test(start_paused = true)]` and finish instantly.
//!
//! # Available Simulations
//!
//! - `SimStage` - rotation platform with a trapezoidal velocity profile
//! - `SimLockIn` - lock-in amplifier with discrete settings and a stale
//!   time-constant buffer
//! - `SimDaq` - analog input whose voltage follows the stage's angular rate
//!   projected through the tilted stage axis, plus seeded white noise
//! - `SimGenerator` - fixed modulation source
//!
//! `SimBench` wires them together and records every command issued.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::calibration::STAGE_TILT_DEG;
use crate::instrument::capabilities::{
    DataAcquisitionUnit, InstrumentSet, LockInAmplifier, RotationStage, Waveform,
    WaveformGenerator,
};
use crate::instrument::lock_in::{sensitivity_index, time_constant_index, SENSITIVITY_STEPS_V};

/// Failure modes a simulated stage can exhibit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageFault {
    /// Behaves normally
    #[default]
    None,
    /// Once moved, the stage never reports stationary again.
    NeverStationary,
    /// The stage never reports reaching constant speed.
    NeverConstantSpeed,
}

/// Parameters of the simulated bench.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Lock-in output per deg/s of rate sensed along the coil axis
    pub gain_v_per_deg_s: f64,
    /// Peak amplitude of uniform white noise on the DAQ input
    pub noise_v: f64,
    /// Constant rate sensed by the coil (e.g. earth rotation), deg/hr
    pub bias_deg_per_hr: f64,
    /// Live lock-in time constant in seconds
    pub time_constant_s: f64,
    /// Duration of each acceleration and deceleration ramp
    pub accel_time: Duration,
    /// Noise generator seed
    pub seed: u64,
    /// Time-constant reads answered from the stale buffer after each other command
    pub stale_depth: usize,
    /// Value the stale time-constant buffer answers with
    pub stale_time_constant_s: f64,
    /// Extra samples (or fewer, if negative) the DAQ returns per read
    pub count_skew: i64,
    /// Injected stage failure
    pub fault: StageFault,
    /// Generator frequency in Hz
    pub modulation_frequency_hz: f64,
    /// Generator amplitude in volts
    pub modulation_voltage_v: f64,
    /// Generator waveform
    pub modulation_waveform: Waveform,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            gain_v_per_deg_s: 0.02,
            noise_v: 1e-5,
            bias_deg_per_hr: 0.0,
            time_constant_s: 0.01,
            accel_time: Duration::from_millis(250),
            seed: 7,
            stale_depth: 3,
            stale_time_constant_s: 1.0,
            count_skew: 0,
            fault: StageFault::None,
            modulation_frequency_hz: 16.5e3,
            modulation_voltage_v: 1.2,
            modulation_waveform: Waveform::Sine,
        }
    }
}

/// Shared record of every command sent to the simulated bench.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CommandLog {
    fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Every command so far, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Whether no command has been sent.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Position of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.starts_with(prefix))
    }
}

// =============================================================================
// SimStage
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    started: Instant,
    from: f64,
    /// Signed distance; clockwise is positive
    delta: f64,
    speed: f64,
    ramp: f64,
    total: f64,
}

impl Motion {
    fn new(started: Instant, from: f64, delta: f64, speed: f64, ramp: Duration) -> Self {
        let cruise_time = delta.abs() / speed;
        // Short moves never reach full speed
        let ramp = ramp.as_secs_f64().min(cruise_time);
        Self {
            started,
            from,
            delta,
            speed,
            ramp,
            total: cruise_time + ramp,
        }
    }

    fn elapsed(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.started).as_secs_f64()
    }

    fn rate_at(&self, at: Instant) -> f64 {
        let t = self.elapsed(at);
        let magnitude = if t >= self.total {
            0.0
        } else if self.ramp > 0.0 && t < self.ramp {
            self.speed * t / self.ramp
        } else if self.ramp > 0.0 && t > self.total - self.ramp {
            self.speed * (self.total - t) / self.ramp
        } else {
            self.speed
        };
        magnitude * self.delta.signum()
    }

    fn position_at(&self, at: Instant) -> f64 {
        let t = self.elapsed(at).min(self.total);
        let travelled = if self.ramp == 0.0 {
            self.speed * t
        } else if t < self.ramp {
            0.5 * self.speed * t * t / self.ramp
        } else if t <= self.total - self.ramp {
            self.speed * (t - 0.5 * self.ramp)
        } else {
            let remaining = self.total - t;
            self.delta.abs() - 0.5 * self.speed * remaining * remaining / self.ramp
        };
        self.from + travelled * self.delta.signum()
    }

    fn is_finished(&self, at: Instant) -> bool {
        self.elapsed(at) >= self.total
    }

    fn is_cruising(&self, at: Instant) -> bool {
        let t = self.elapsed(at);
        t >= self.ramp && t < self.total - self.ramp
    }
}

#[derive(Debug)]
struct StageState {
    velocity: f64,
    position: f64,
    motion: Option<Motion>,
    ever_moved: bool,
}

/// Simulated rotation platform.
///
/// Moves follow a trapezoidal profile: a linear ramp up to the set velocity,
/// a cruise, and a symmetric ramp down.
pub struct SimStage {
    state: Mutex<StageState>,
    ramp: Duration,
    fault: StageFault,
    log: CommandLog,
}

impl SimStage {
    /// A stationary stage at angle zero.
    pub fn new(ramp: Duration, fault: StageFault, log: CommandLog) -> Self {
        Self {
            state: Mutex::new(StageState {
                velocity: 1.0,
                position: 0.0,
                motion: None,
                ever_moved: false,
            }),
            ramp,
            fault,
            log,
        }
    }

    fn start_move(&self, delta: f64) -> Result<()> {
        if !delta.is_finite() {
            bail!("SimStage: invalid move of {} deg", delta);
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.velocity <= 0.0 {
            bail!("SimStage: velocity must be positive before moving");
        }
        let from = match state.motion {
            Some(motion) => motion.position_at(now),
            None => state.position,
        };
        state.position = from;
        state.motion = Some(Motion::new(now, from, delta, state.velocity, self.ramp));
        state.ever_moved = true;
        Ok(())
    }

    /// Angular rate in deg/s at `at`; clockwise positive.
    pub fn rate_at(&self, at: Instant) -> f64 {
        self.state
            .lock()
            .motion
            .map_or(0.0, |motion| motion.rate_at(at))
    }

    /// Current angle in degrees.
    pub fn position(&self) -> f64 {
        let state = self.state.lock();
        state
            .motion
            .map_or(state.position, |motion| motion.position_at(Instant::now()))
    }

    /// Whether a move is still in progress.
    pub fn is_moving(&self) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .motion
            .is_some_and(|motion| !motion.is_finished(now))
    }
}

#[async_trait]
impl RotationStage for SimStage {
    async fn set_velocity(&self, deg_per_s: f64) -> Result<()> {
        self.log.push(format!("stage.set_velocity {}", deg_per_s));
        if !(deg_per_s.is_finite() && deg_per_s > 0.0) {
            bail!("SimStage: invalid velocity {}", deg_per_s);
        }
        self.state.lock().velocity = deg_per_s;
        Ok(())
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(self.state.lock().velocity)
    }

    async fn cw(&self, angle: f64) -> Result<()> {
        self.log.push(format!("stage.cw {}", angle));
        self.start_move(angle)
    }

    async fn ccw(&self, angle: f64) -> Result<()> {
        self.log.push(format!("stage.ccw {}", angle));
        self.start_move(-angle)
    }

    async fn is_stationary(&self) -> Result<bool> {
        let state = self.state.lock();
        if self.fault == StageFault::NeverStationary && state.ever_moved {
            return Ok(false);
        }
        let now = Instant::now();
        Ok(state.motion.map_or(true, |motion| motion.is_finished(now)))
    }

    async fn is_constant_speed(&self) -> Result<bool> {
        if self.fault == StageFault::NeverConstantSpeed {
            return Ok(false);
        }
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .motion
            .is_some_and(|motion| motion.is_cruising(now)))
    }

    async fn stop(&self) -> Result<()> {
        self.log.push("stage.stop");
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(motion) = state.motion.take() {
            state.position = motion.position_at(now);
        }
        Ok(())
    }
}

// =============================================================================
// SimLockIn
// =============================================================================

#[derive(Debug)]
struct LockInState {
    sensitivity: f64,
    time_constant: f64,
    stale_remaining: usize,
    autophase_while_moving: Vec<bool>,
    autogain_count: u32,
}

/// Simulated lock-in amplifier.
///
/// After any command other than a time-constant query, the next
/// `stale_depth` time-constant reads return a stale buffered value.
pub struct SimLockIn {
    state: Mutex<LockInState>,
    stale_depth: usize,
    stale_time_constant: f64,
    stage: Arc<SimStage>,
    log: CommandLog,
}

impl SimLockIn {
    /// An amplifier set to `time_constant`, which must be a valid step.
    pub fn new(
        time_constant: f64,
        stale_depth: usize,
        stale_time_constant: f64,
        stage: Arc<SimStage>,
        log: CommandLog,
    ) -> Result<Self> {
        if time_constant_index(time_constant).is_none() {
            bail!("SimLockIn: {} s is not a valid time constant", time_constant);
        }
        Ok(Self {
            state: Mutex::new(LockInState {
                sensitivity: SENSITIVITY_STEPS_V[SENSITIVITY_STEPS_V.len() - 1],
                time_constant,
                stale_remaining: stale_depth,
                autophase_while_moving: Vec::new(),
                autogain_count: 0,
            }),
            stale_depth,
            stale_time_constant,
            stage,
            log,
        })
    }

    /// For each autophase so far, whether the stage was moving at the time.
    pub fn autophase_history(&self) -> Vec<bool> {
        self.state.lock().autophase_while_moving.clone()
    }

    /// Number of autogain commands received.
    pub fn autogain_count(&self) -> u32 {
        self.state.lock().autogain_count
    }

    /// Currently selected sensitivity in volts.
    pub fn current_sensitivity(&self) -> f64 {
        self.state.lock().sensitivity
    }

    fn arm_stale_buffer(state: &mut LockInState, depth: usize) {
        state.stale_remaining = depth;
    }
}

#[async_trait]
impl LockInAmplifier for SimLockIn {
    async fn sensitivity(&self) -> Result<f64> {
        let mut state = self.state.lock();
        Self::arm_stale_buffer(&mut state, self.stale_depth);
        Ok(state.sensitivity)
    }

    async fn set_sensitivity(&self, volts: f64) -> Result<()> {
        self.log.push(format!("lock_in.set_sensitivity {}", volts));
        if sensitivity_index(volts).is_none() {
            return Err(anyhow!("SimLockIn: {} V is not a valid sensitivity", volts));
        }
        let mut state = self.state.lock();
        state.sensitivity = volts;
        Self::arm_stale_buffer(&mut state, self.stale_depth);
        Ok(())
    }

    async fn time_constant(&self) -> Result<f64> {
        self.log.push("lock_in.time_constant");
        let mut state = self.state.lock();
        if state.stale_remaining > 0 {
            state.stale_remaining -= 1;
            return Ok(self.stale_time_constant);
        }
        Ok(state.time_constant)
    }

    async fn autophase(&self) -> Result<()> {
        self.log.push("lock_in.autophase");
        let moving = self.stage.is_moving();
        let mut state = self.state.lock();
        state.autophase_while_moving.push(moving);
        Self::arm_stale_buffer(&mut state, self.stale_depth);
        Ok(())
    }

    async fn autogain(&self) -> Result<()> {
        self.log.push("lock_in.autogain");
        let mut state = self.state.lock();
        state.autogain_count += 1;
        Self::arm_stale_buffer(&mut state, self.stale_depth);
        Ok(())
    }
}

// =============================================================================
// SimDaq
// =============================================================================

/// Parameters of one completed DAQ read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRecord {
    /// Requested duration
    pub duration_s: f64,
    /// Requested sample rate
    pub frequency_hz: f64,
    /// Requested input range
    pub max_voltage: f64,
    /// Samples returned
    pub samples: usize,
}

/// Simulated analog input wired to the lock-in output.
pub struct SimDaq {
    stage: Arc<SimStage>,
    gain: f64,
    noise: f64,
    bias_deg_per_s: f64,
    count_skew: i64,
    rng: Mutex<StdRng>,
    reads: Mutex<Vec<ReadRecord>>,
    log: CommandLog,
}

impl SimDaq {
    /// A DAQ sensing `stage` with the noise and bias from `config`.
    pub fn new(stage: Arc<SimStage>, config: &SimConfig, log: CommandLog) -> Self {
        Self {
            stage,
            gain: config.gain_v_per_deg_s,
            noise: config.noise_v,
            bias_deg_per_s: config.bias_deg_per_hr / 3600.0,
            count_skew: config.count_skew,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            reads: Mutex::new(Vec::new()),
            log,
        }
    }

    /// Every completed read, oldest first.
    pub fn reads(&self) -> Vec<ReadRecord> {
        self.reads.lock().clone()
    }
}

#[async_trait]
impl DataAcquisitionUnit for SimDaq {
    async fn read(
        &self,
        duration_s: f64,
        frequency_hz: f64,
        max_voltage: f64,
    ) -> Result<Vec<f64>> {
        self.log.push(format!(
            "daq.read {} s @ {} Hz, ±{} V",
            duration_s, frequency_hz, max_voltage
        ));
        if !(duration_s > 0.0 && frequency_hz > 0.0 && max_voltage > 0.0) {
            bail!(
                "SimDaq: invalid read ({} s, {} Hz, {} V)",
                duration_s,
                frequency_hz,
                max_voltage
            );
        }

        let nominal = (duration_s * frequency_hz).round() as i64;
        let count = (nominal + self.count_skew).max(0) as usize;
        let start = Instant::now();
        let projection = STAGE_TILT_DEG.to_radians().cos();

        // Rates are fixed by the motion profile, so sample them before sleeping
        let samples: Vec<f64> = {
            let mut rng = self.rng.lock();
            (0..count)
                .map(|i| {
                    let at = start + Duration::from_secs_f64(i as f64 / frequency_hz);
                    let sensed = self.stage.rate_at(at) * projection + self.bias_deg_per_s;
                    let noise = if self.noise > 0.0 {
                        rng.gen_range(-self.noise..=self.noise)
                    } else {
                        0.0
                    };
                    (sensed * self.gain + noise).clamp(-max_voltage, max_voltage)
                })
                .collect()
        };

        sleep(Duration::from_secs_f64(duration_s)).await;

        debug!(samples = samples.len(), duration_s, frequency_hz, "SimDaq read complete");
        self.reads.lock().push(ReadRecord {
            duration_s,
            frequency_hz,
            max_voltage,
            samples: samples.len(),
        });
        Ok(samples)
    }
}

// =============================================================================
// SimGenerator
// =============================================================================

/// Simulated function generator with fixed output.
pub struct SimGenerator {
    frequency: f64,
    voltage: f64,
    waveform: Waveform,
}

impl SimGenerator {
    /// A generator with fixed output settings.
    pub fn new(frequency: f64, voltage: f64, waveform: Waveform) -> Self {
        Self {
            frequency,
            voltage,
            waveform,
        }
    }
}

#[async_trait]
impl WaveformGenerator for SimGenerator {
    async fn frequency(&self) -> Result<f64> {
        Ok(self.frequency)
    }

    async fn voltage(&self) -> Result<f64> {
        Ok(self.voltage)
    }

    async fn waveform(&self) -> Result<Waveform> {
        Ok(self.waveform)
    }
}

// =============================================================================
// SimBench
// =============================================================================

/// A complete simulated bench with typed access to each instrument.
pub struct SimBench {
    /// Stage
    pub stage: Arc<SimStage>,
    /// Lock-in amplifier
    pub lock_in: Arc<SimLockIn>,
    /// DAQ
    pub daq: Arc<SimDaq>,
    /// Function generator
    pub generator: Arc<SimGenerator>,
    /// Commands sent to any instrument
    pub log: CommandLog,
}

impl SimBench {
    /// Build and wire the four simulated instruments.
    pub fn new(config: SimConfig) -> Result<Self> {
        let log = CommandLog::default();
        let stage = Arc::new(SimStage::new(config.accel_time, config.fault, log.clone()));
        let lock_in = Arc::new(SimLockIn::new(
            config.time_constant_s,
            config.stale_depth,
            config.stale_time_constant_s,
            stage.clone(),
            log.clone(),
        )?);
        let daq = Arc::new(SimDaq::new(stage.clone(), &config, log.clone()));
        let generator = Arc::new(SimGenerator::new(
            config.modulation_frequency_hz,
            config.modulation_voltage_v,
            config.modulation_waveform,
        ));
        Ok(Self {
            stage,
            lock_in,
            daq,
            generator,
            log,
        })
    }

    /// Trait-object handles for the calibration and acquisition flows.
    pub fn instrument_set(&self) -> InstrumentSet {
        InstrumentSet::new(
            self.stage.clone(),
            self.lock_in.clone(),
            self.daq.clone(),
            self.generator.clone(),
        )
    }
}

//! Scale-factor calibration by dithering the rotation stage.
//!
//! The stage is swung back and forth by a small, known angle at a known
//! velocity while the DAQ samples the lock-in output. Comparing the measured
//! voltage to the commanded rate gives the volts-to-rate conversion used for
//! every later acquisition.
//!
//! # Procedure
//!
//! 1. Flush the lock-in's stale time-constant buffer, then read the sample
//!    frequency (`1 / time_constant`).
//! 2. Half-dither clockwise; after the settle interval set the coarse
//!    sensitivity; wait for the stage to stop.
//! 3. Half-dither counter-clockwise; after the settle interval autophase.
//!    The stage must still be moving here, so the phase locks onto a live
//!    rotation signal. Wait for the stage to stop.
//! 4. Full dither clockwise; once at constant speed, sample for
//!    `angle / velocity - padding` seconds.
//! 5. Full dither counter-clockwise; sample the same window.
//! 6. Wait for the stage to stop and compute the scale factor.
//!
//! Every wait is bounded by the configured [`WaitPolicy`] and listens for the
//! operator's [`AbortSignal`]. When a wait fails the stage is commanded to stop
//! before the error is returned.

use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppResult, DaqError};
use crate::instrument::capabilities::InstrumentSet;
use crate::instrument::wait::{wait_for, AbortSignal, WaitPolicy};
use crate::units::SECONDS_PER_HOUR;

/// Tilt of the stage's rotation axis relative to the coil's sensitive axis.
pub const STAGE_TILT_DEG: f64 = 37.4;

/// How the two dither traces are combined into volts per deg/s.
///
/// The historical bench software averaged the clockwise trace with itself
/// and never used the counter-clockwise trace. That behavior is the default
/// so scale factors stay comparable with archived runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceAveraging {
    /// Average the clockwise trace with itself (archived behavior)
    #[default]
    ClockwiseTwice,
    /// Average the clockwise and counter-clockwise traces
    BothDirections,
}

/// Dither geometry and instrument settings for one calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Full dither angle in degrees
    pub dither_angle: f64,
    /// Stage velocity in deg/s
    pub dither_velocity: f64,
    /// Seconds trimmed off each constant-speed read window
    pub padding: f64,
    /// Pause after starting a half-dither move before touching the amplifier
    pub settle_interval: Duration,
    /// Lock-in sensitivity (V) used while dithering
    pub coarse_sensitivity: f64,
    /// Discarded time-constant reads before the value is trusted
    pub buffer_flush_reads: usize,
    /// How the two trace means are combined
    pub averaging: TraceAveraging,
    /// Polling and timeout for stage state waits
    pub wait: WaitPolicy,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dither_angle: 5.0,
            dither_velocity: 1.0,
            padding: 1.0,
            settle_interval: Duration::from_millis(500),
            coarse_sensitivity: 0.1,
            buffer_flush_reads: 5,
            averaging: TraceAveraging::default(),
            wait: WaitPolicy::default(),
        }
    }
}

impl CalibrationConfig {
    /// Seconds sampled per direction.
    pub fn read_window(&self) -> f64 {
        self.dither_angle / self.dither_velocity - self.padding
    }

    /// Reject non-positive or non-finite geometry.
    pub fn validate(&self) -> AppResult<()> {
        let positive = |value: f64| value.is_finite() && value > 0.0;
        if !positive(self.dither_angle) {
            return Err(DaqError::Configuration(format!(
                "dither angle must be positive, got {}",
                self.dither_angle
            )));
        }
        if !positive(self.dither_velocity) {
            return Err(DaqError::Configuration(format!(
                "dither velocity must be positive, got {}",
                self.dither_velocity
            )));
        }
        if !(self.padding.is_finite() && self.padding >= 0.0) {
            return Err(DaqError::Configuration(format!(
                "settle padding must be non-negative, got {}",
                self.padding
            )));
        }
        if !positive(self.read_window()) {
            return Err(DaqError::Configuration(format!(
                "padding of {} s leaves no read window for a {} deg dither at {} deg/s",
                self.padding, self.dither_angle, self.dither_velocity
            )));
        }
        if !positive(self.coarse_sensitivity) {
            return Err(DaqError::Configuration(
                "coarse sensitivity must be positive".into(),
            ));
        }
        if self.wait.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "wait poll interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a calibration, kept with the session it was used for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// deg/hr per volt
    pub scale_factor: f64,
    /// Full dither angle in degrees
    pub dither_angle: f64,
    /// Stage velocity in deg/s
    pub dither_velocity: f64,
    /// Seconds trimmed off each read window
    pub padding: f64,
    /// When the dither finished
    pub calibrated_at: DateTime<Utc>,
    /// Mean voltage of the clockwise trace
    pub cw_mean: f64,
    /// Mean voltage of the counter-clockwise trace
    pub ccw_mean: f64,
}

fn mean(trace: &[f64]) -> Option<f64> {
    if trace.is_empty() {
        None
    } else {
        Some(trace.iter().sum::<f64>() / trace.len() as f64)
    }
}

/// Convert the two dither traces into a scale factor in deg/hr per volt.
///
/// Volts per deg/s is the mean absolute trace voltage over `velocity`, then
/// corrected for the stage tilt.
pub fn scale_factor_from_traces(
    cw: &[f64],
    ccw: &[f64],
    velocity: f64,
    averaging: TraceAveraging,
) -> AppResult<f64> {
    let cw_mean = mean(cw).ok_or_else(|| anyhow!("clockwise calibration trace is empty"))?;
    let second = match averaging {
        TraceAveraging::ClockwiseTwice => cw_mean,
        TraceAveraging::BothDirections => {
            mean(ccw).ok_or_else(|| anyhow!("counter-clockwise calibration trace is empty"))?
        }
    };

    let volts_per_deg_s =
        (cw_mean.abs() + second.abs()) / (2.0 * velocity) / STAGE_TILT_DEG.to_radians().cos();
    if !(volts_per_deg_s.is_finite() && volts_per_deg_s > 0.0) {
        return Err(DaqError::Hardware(anyhow!(
            "no rotation signal in calibration traces (mean {} V)",
            cw_mean
        )));
    }
    Ok(SECONDS_PER_HOUR / volts_per_deg_s)
}

/// Drives the dither procedure against an [`InstrumentSet`].
#[derive(Debug, Clone)]
pub struct ScaleFactorCalibrator {
    config: CalibrationConfig,
}

impl ScaleFactorCalibrator {
    /// Build a calibrator, rejecting an invalid config.
    pub fn new(config: CalibrationConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Active calibration settings.
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Run the dither and return a fresh calibration.
    ///
    /// Leaves the stage where the dither ended and the lock-in at the coarse
    /// sensitivity with its phase zeroed.
    pub async fn calibrate(
        &self,
        instruments: &mut InstrumentSet,
        abort: &AbortSignal,
    ) -> AppResult<CalibrationResult> {
        info!(
            angle = self.config.dither_angle,
            velocity = self.config.dither_velocity,
            "Starting scale-factor calibration"
        );
        match self.dither(instruments, abort).await {
            Ok(result) => {
                info!(
                    scale_factor = result.scale_factor,
                    cw_mean = result.cw_mean,
                    ccw_mean = result.ccw_mean,
                    "Calibration complete"
                );
                Ok(result)
            }
            Err(err) => {
                warn!(error = %err, "Calibration failed; stopping stage");
                if let Err(stop_err) = instruments.stage.stop().await {
                    warn!(error = %stop_err, "Failed to stop stage after calibration error");
                }
                Err(err)
            }
        }
    }

    async fn dither(
        &self,
        instruments: &InstrumentSet,
        abort: &AbortSignal,
    ) -> AppResult<CalibrationResult> {
        let c = &self.config;
        let stage = &instruments.stage;
        let lock_in = &instruments.lock_in;

        let frequency = 1.0 / read_time_constant(instruments, c.buffer_flush_reads).await?;
        let read_window = c.read_window();

        stage.set_velocity(c.dither_velocity).await?;

        // Half dither: set the range while the signal is up
        stage.cw(0.5 * c.dither_angle).await?;
        self.settle(abort).await?;
        lock_in.set_sensitivity(c.coarse_sensitivity).await?;
        self.wait_stationary(instruments, abort).await?;

        // Half dither back: autophase mid-move
        stage.ccw(0.5 * c.dither_angle).await?;
        self.settle(abort).await?;
        lock_in.autophase().await?;
        self.wait_stationary(instruments, abort).await?;
        debug!("Lock-in ranged and phased");

        stage.cw(c.dither_angle).await?;
        self.wait_constant_speed(instruments, abort).await?;
        let cw = self.read_trace(instruments, abort, read_window, frequency).await?;
        self.wait_stationary(instruments, abort).await?;

        stage.ccw(c.dither_angle).await?;
        self.wait_constant_speed(instruments, abort).await?;
        let ccw = self.read_trace(instruments, abort, read_window, frequency).await?;
        self.wait_stationary(instruments, abort).await?;

        let scale_factor = scale_factor_from_traces(&cw, &ccw, c.dither_velocity, c.averaging)?;
        Ok(CalibrationResult {
            scale_factor,
            dither_angle: c.dither_angle,
            dither_velocity: c.dither_velocity,
            padding: c.padding,
            calibrated_at: Utc::now(),
            cw_mean: mean(&cw).unwrap_or_default(),
            ccw_mean: mean(&ccw).unwrap_or_default(),
        })
    }

    async fn settle(&self, abort: &AbortSignal) -> AppResult<()> {
        abort
            .guard("settling", async {
                tokio::time::sleep(self.config.settle_interval).await;
                Ok(())
            })
            .await
    }

    async fn wait_stationary(&self, instruments: &InstrumentSet, abort: &AbortSignal) -> AppResult<()> {
        let stage = &instruments.stage;
        wait_for("stationary", self.config.wait, abort, move || stage.is_stationary()).await
    }

    async fn wait_constant_speed(
        &self,
        instruments: &InstrumentSet,
        abort: &AbortSignal,
    ) -> AppResult<()> {
        let stage = &instruments.stage;
        wait_for("constant speed", self.config.wait, abort, move || {
            stage.is_constant_speed()
        })
        .await
    }

    async fn read_trace(
        &self,
        instruments: &InstrumentSet,
        abort: &AbortSignal,
        seconds: f64,
        frequency: f64,
    ) -> AppResult<Vec<f64>> {
        let max_voltage = instruments.lock_in.sensitivity().await?;
        debug!(seconds, frequency, max_voltage, "Sampling dither trace");
        abort
            .guard("sampling a calibration trace", async {
                instruments
                    .daq
                    .read(seconds, frequency, max_voltage)
                    .await
                    .map_err(DaqError::from)
            })
            .await
    }
}

/// Read the lock-in time constant after discarding `flush_reads` stale answers.
pub(crate) async fn read_time_constant(
    instruments: &InstrumentSet,
    flush_reads: usize,
) -> AppResult<f64> {
    for _ in 0..flush_reads {
        instruments.lock_in.time_constant().await?;
    }
    let time_constant = instruments.lock_in.time_constant().await?;
    if !(time_constant.is_finite() && time_constant > 0.0) {
        return Err(DaqError::Hardware(anyhow!(
            "lock-in reported an invalid time constant of {} s",
            time_constant
        )));
    }
    Ok(time_constant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::sim::{SimBench, SimConfig, StageFault};
    use crate::instrument::wait::abort_pair;

    fn calibrator(averaging: TraceAveraging) -> ScaleFactorCalibrator {
        ScaleFactorCalibrator::new(CalibrationConfig {
            averaging,
            ..CalibrationConfig::default()
        })
        .unwrap()
    }

    fn short_timeout() -> CalibrationConfig {
        CalibrationConfig {
            wait: WaitPolicy {
                poll_interval: Duration::from_millis(20),
                timeout: Duration::from_secs(10),
            },
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn scale_factor_ratio_invariants() {
        let cw = vec![0.02; 10];
        let ccw = vec![-0.02; 10];
        let base = scale_factor_from_traces(&cw, &ccw, 1.0, TraceAveraging::BothDirections).unwrap();
        let expected = 3600.0 / (0.02 / STAGE_TILT_DEG.to_radians().cos());
        assert!((base - expected).abs() < 1e-6 * expected);

        // Twice the velocity produces twice the voltage
        let cw2: Vec<f64> = cw.iter().map(|v| v * 2.0).collect();
        let ccw2: Vec<f64> = ccw.iter().map(|v| v * 2.0).collect();
        let doubled =
            scale_factor_from_traces(&cw2, &ccw2, 2.0, TraceAveraging::BothDirections).unwrap();
        assert!((doubled - base).abs() < 1e-9 * base);

        let same_traces_faster =
            scale_factor_from_traces(&cw, &ccw, 2.0, TraceAveraging::BothDirections).unwrap();
        assert!((same_traces_faster - 2.0 * base).abs() < 1e-9 * base);
    }

    #[test]
    fn historical_averaging_ignores_ccw_trace() {
        let cw = vec![0.01; 4];
        let ccw = vec![-0.03; 4];
        let historical =
            scale_factor_from_traces(&cw, &ccw, 1.0, TraceAveraging::ClockwiseTwice).unwrap();
        let only_cw = scale_factor_from_traces(&cw, &[], 1.0, TraceAveraging::ClockwiseTwice).unwrap();
        assert_eq!(historical, only_cw);

        let both = scale_factor_from_traces(&cw, &ccw, 1.0, TraceAveraging::BothDirections).unwrap();
        assert!((historical / both - 2.0).abs() < 1e-9);
    }

    #[test]
    fn flat_traces_are_rejected() {
        let err = scale_factor_from_traces(&[0.0; 5], &[0.0; 5], 1.0, TraceAveraging::BothDirections)
            .unwrap_err();
        assert!(matches!(err, DaqError::Hardware(_)));
        assert!(scale_factor_from_traces(&[], &[], 1.0, TraceAveraging::ClockwiseTwice).is_err());
    }

    #[test]
    fn config_validation() {
        CalibrationConfig::default().validate().unwrap();
        assert_eq!(CalibrationConfig::default().read_window(), 4.0);

        let no_window = CalibrationConfig {
            padding: 5.0,
            ..CalibrationConfig::default()
        };
        assert!(no_window.validate().unwrap_err().is_configuration());

        let still = CalibrationConfig {
            dither_velocity: 0.0,
            ..CalibrationConfig::default()
        };
        assert!(ScaleFactorCalibrator::new(still).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn calibrates_simulated_bench() {
        let bench = SimBench::new(SimConfig::default()).unwrap();
        let mut instruments = bench.instrument_set();

        let result = calibrator(TraceAveraging::ClockwiseTwice)
            .calibrate(&mut instruments, &AbortSignal::never())
            .await
            .unwrap();

        // gain is 0.02 V per deg/s sensed, after the tilt correction
        let expected = 3600.0 / 0.02;
        assert!(
            (result.scale_factor - expected).abs() < 1e-3 * expected,
            "scale factor {}",
            result.scale_factor
        );
        assert!(result.cw_mean > 0.0 && result.ccw_mean < 0.0);
        assert_eq!(result.dither_angle, 5.0);

        // Two traces of 4 s at 1 / 10 ms
        let reads = bench.daq.reads();
        assert_eq!(reads.len(), 2);
        assert!(reads.iter().all(|r| r.samples == 400 && r.max_voltage == 0.1));

        // Back where it started, ranged and phased
        assert!(bench.stage.position().abs() < 1e-9);
        assert_eq!(bench.lock_in.current_sensitivity(), 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn autophase_happens_while_stage_moves() {
        let bench = SimBench::new(SimConfig::default()).unwrap();
        let mut instruments = bench.instrument_set();
        calibrator(TraceAveraging::ClockwiseTwice)
            .calibrate(&mut instruments, &AbortSignal::never())
            .await
            .unwrap();

        assert_eq!(bench.lock_in.autophase_history(), vec![true]);
        let log = bench.log.clone();
        let first_ccw = log.position("stage.ccw").unwrap();
        let autophase = log.position("lock_in.autophase").unwrap();
        let first_read = log.position("daq.read").unwrap();
        assert!(first_ccw < autophase && autophase < first_read);
    }

    #[tokio::test(start_paused = true)]
    async fn both_directions_agree_on_symmetric_bench() {
        let bench = SimBench::new(SimConfig::default()).unwrap();
        let mut instruments = bench.instrument_set();
        let result = calibrator(TraceAveraging::BothDirections)
            .calibrate(&mut instruments, &AbortSignal::never())
            .await
            .unwrap();
        assert!((result.scale_factor - 180_000.0).abs() < 180.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_that_never_stops_is_a_hang() {
        let bench = SimBench::new(SimConfig {
            fault: StageFault::NeverStationary,
            ..SimConfig::default()
        })
        .unwrap();
        let mut instruments = bench.instrument_set();
        let err = ScaleFactorCalibrator::new(short_timeout())
            .unwrap()
            .calibrate(&mut instruments, &AbortSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(err, DaqError::HardwareHang { condition: "stationary", .. }));
        assert!(bench.log.position("stage.stop").is_some());
        assert!(bench.daq.reads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stage_that_never_cruises_is_a_hang() {
        let bench = SimBench::new(SimConfig {
            fault: StageFault::NeverConstantSpeed,
            ..SimConfig::default()
        })
        .unwrap();
        let mut instruments = bench.instrument_set();
        let err = ScaleFactorCalibrator::new(short_timeout())
            .unwrap()
            .calibrate(&mut instruments, &AbortSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::HardwareHang { condition: "constant speed", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn operator_abort_stops_stage() {
        let bench = SimBench::new(SimConfig::default()).unwrap();
        let mut instruments = bench.instrument_set();
        let (handle, signal) = abort_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.abort();
        });

        let err = calibrator(TraceAveraging::ClockwiseTwice)
            .calibrate(&mut instruments, &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Aborted(_)));
        assert!(bench.log.entries().last().is_some_and(|e| e == "stage.stop"));
        assert!(!bench.stage.is_moving());
    }
}

//! Long-duration gyroscope acquisition.
//!
//! An acquisition is one blocking DAQ read spanning the whole requested
//! duration, with the lock-in set to a fine range. The raw voltage series is
//! converted to rotation rate with a freshly computed calibration and reduced
//! to an Allan-deviation curve. Persisting the session is a separate step; a
//! failed save never discards the acquired data.
//!
//! While the read is in flight a [`ProgressReporter`] publishes elapsed time on
//! a watch channel. It only observes the clock and never touches instruments.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::calibration::{read_time_constant, CalibrationResult, ScaleFactorCalibrator};
use crate::config::{AcquisitionDuration, EnvironmentSettings};
use crate::data::allan::{allan_deviation, AllanCurve};
use crate::data::run::Run;
use crate::data::storage::{SessionStore, WriteMode, WriteOutcome};
use crate::error::{AppResult, DaqError};
use crate::instrument::capabilities::{InstrumentSet, ModulationSettings};
use crate::instrument::wait::AbortSignal;

/// Settings applied for the acquisition read.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    /// Lock-in sensitivity (V) during the run
    pub sensitivity: f64,
    /// Announced wait before sampling starts; zero disables it
    pub countdown: Duration,
    /// Progress updates per run
    pub progress_steps: u32,
    /// Discarded time-constant reads before the value is trusted
    pub buffer_flush_reads: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.001,
            countdown: Duration::from_secs(5),
            progress_steps: 100,
            buffer_flush_reads: 5,
        }
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Elapsed time of an in-flight acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Time since sampling started, capped at `total`
    pub elapsed: Duration,
    /// Requested acquisition length
    pub total: Duration,
}

impl Progress {
    /// Completed share of the run, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total.is_zero() {
            return 1.0;
        }
        (self.elapsed.as_secs_f64() / self.total.as_secs_f64()).min(1.0)
    }

    /// Whether the elapsed time has reached the total.
    pub fn is_complete(&self) -> bool {
        self.elapsed >= self.total
    }

    /// `elapsed/total` as `h:mm:ss/h:mm:ss`.
    pub fn label(&self) -> String {
        format!("{}/{}", hms(self.elapsed), hms(self.total))
    }
}

fn hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Periodic task publishing [`Progress`] until the tracked duration elapses.
///
/// The task ends by itself once elapsed time reaches the total. Dropping or
/// stopping the reporter aborts it earlier.
pub struct ProgressReporter {
    task: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start publishing into `sender` every `total / steps`.
    pub fn spawn(sender: Arc<watch::Sender<Progress>>, total: Duration, steps: u32) -> Self {
        let period = (total / steps.max(1)).max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let progress = Progress {
                    elapsed: started.elapsed().min(total),
                    total,
                };
                sender.send_replace(progress);
                debug!(progress = %progress.label(), "Acquisition progress");
                if progress.is_complete() {
                    break;
                }
            }
        });
        Self { task }
    }

    /// Whether the publishing task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the publishing task.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Session
// =============================================================================

/// Everything one acquisition produced. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSession {
    start: DateTime<Utc>,
    time_constant: f64,
    duration: f64,
    sensitivity: f64,
    voltage: Vec<f64>,
    curve: AllanCurve,
    modulation: ModulationSettings,
    calibration: CalibrationResult,
}

impl AcquisitionSession {
    /// Wall-clock time sampling started.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Lock-in time constant in seconds
    pub fn time_constant(&self) -> f64 {
        self.time_constant
    }

    /// Requested duration in seconds
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Lock-in full-scale sensitivity during the run, in volts
    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    /// Scale factor from the calibration preceding this run.
    pub fn scale_factor(&self) -> f64 {
        self.calibration.scale_factor
    }

    /// Raw lock-in output in volts
    pub fn voltage(&self) -> &[f64] {
        &self.voltage
    }

    /// Allan deviation of the rotation rate (deg/hr)
    pub fn curve(&self) -> &AllanCurve {
        &self.curve
    }

    /// Generator settings read when the run started.
    pub fn modulation(&self) -> &ModulationSettings {
        &self.modulation
    }

    /// The calibration this run was converted with.
    pub fn calibration(&self) -> &CalibrationResult {
        &self.calibration
    }

    /// Samples actually returned per second of requested duration.
    pub fn effective_rate(&self) -> f64 {
        self.voltage.len() as f64 / self.duration
    }

    /// Rotation rate in deg/hr.
    pub fn rotation_rate(&self) -> Vec<f64> {
        let scale = self.scale_factor();
        self.voltage.iter().map(|v| v * scale).collect()
    }

    /// The session as a storable run (volts plus scale factor).
    pub fn to_run(&self) -> AppResult<Run> {
        Ok(Run::new(self.voltage.clone(), self.effective_rate())?
            .with_start(self.start)
            .with_scale_factor(self.scale_factor()))
    }
}

/// Outcome of the save step of [`AcquisitionController::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceStatus {
    /// No save target was given
    NotRequested,
    /// Written to the store
    Saved,
    /// Key already present and overwriting was not requested
    Skipped,
    /// The store rejected the write; the session is still returned
    Failed(String),
}

/// Result of [`AcquisitionController::run`].
#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    /// The acquired data
    pub session: AcquisitionSession,
    /// What happened when saving it
    pub persistence: PersistenceStatus,
}

/// Where [`AcquisitionController::run`] should save the session.
pub struct SaveTarget<'a> {
    /// Destination store
    pub store: &'a dyn SessionStore,
    /// Key to write under
    pub key: &'a str,
    pub mode: WriteMode,
    /// Bench conditions recorded as provenance
    pub environment: EnvironmentSettings,
}

// =============================================================================
// Controller
// =============================================================================

/// Calibrates, acquires and optionally persists a gyroscope run.
pub struct AcquisitionController {
    calibrator: ScaleFactorCalibrator,
    config: AcquisitionConfig,
    progress: Arc<watch::Sender<Progress>>,
}

impl AcquisitionController {
    /// Build a controller, rejecting an invalid acquisition config.
    pub fn new(calibrator: ScaleFactorCalibrator, config: AcquisitionConfig) -> AppResult<Self> {
        if !(config.sensitivity.is_finite() && config.sensitivity > 0.0) {
            return Err(DaqError::Configuration(format!(
                "acquisition sensitivity must be positive, got {}",
                config.sensitivity
            )));
        }
        if config.progress_steps == 0 {
            return Err(DaqError::Configuration(
                "progress_steps must be at least 1".into(),
            ));
        }
        let (progress, _) = watch::channel(Progress::default());
        Ok(Self {
            calibrator,
            config,
            progress: Arc::new(progress),
        })
    }

    /// Calibrator used before each acquisition.
    pub fn calibrator(&self) -> &ScaleFactorCalibrator {
        &self.calibrator
    }

    /// Watch the progress of acquisitions run by this controller.
    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Calibrate fresh, acquire, then save if a target is given.
    ///
    /// The duration is checked before any instrument is touched. A save
    /// failure is reported in the returned [`AcquisitionReport`] and never
    /// fails the call.
    pub async fn run(
        &self,
        instruments: &mut InstrumentSet,
        duration: AcquisitionDuration,
        abort: &AbortSignal,
        save: Option<SaveTarget<'_>>,
    ) -> AppResult<AcquisitionReport> {
        duration.total_seconds()?;

        let calibration = self.calibrator.calibrate(instruments, abort).await?;
        let session = self
            .acquire(instruments, &calibration, duration, abort)
            .await?;

        let persistence = match save {
            None => PersistenceStatus::NotRequested,
            Some(target) => Self::persist(&session, &target),
        };
        Ok(AcquisitionReport {
            session,
            persistence,
        })
    }

    fn persist(session: &AcquisitionSession, target: &SaveTarget<'_>) -> PersistenceStatus {
        match target
            .store
            .save_session(target.key, session, &target.environment, target.mode)
        {
            Ok(WriteOutcome::Written | WriteOutcome::Overwritten) => PersistenceStatus::Saved,
            Ok(WriteOutcome::Skipped) => PersistenceStatus::Skipped,
            Err(err) => {
                error!(key = target.key, error = %err, "Failed to save session; data kept in memory");
                PersistenceStatus::Failed(err.to_string())
            }
        }
    }

    /// Acquire for `duration` using an existing calibration.
    pub async fn acquire(
        &self,
        instruments: &mut InstrumentSet,
        calibration: &CalibrationResult,
        duration: AcquisitionDuration,
        abort: &AbortSignal,
    ) -> AppResult<AcquisitionSession> {
        let seconds = duration.total_seconds()?;
        let total = duration.total_duration()?;

        instruments.lock_in.set_sensitivity(self.config.sensitivity).await?;
        let modulation = ModulationSettings::read_from(instruments.generator.as_ref()).await?;
        let time_constant =
            read_time_constant(instruments, self.config.buffer_flush_reads).await?;
        let frequency = 1.0 / time_constant;
        let max_voltage = instruments.lock_in.sensitivity().await?;

        self.countdown(abort).await?;

        let start = Utc::now();
        info!(seconds, frequency, max_voltage, "Acquisition started");
        let reporter = ProgressReporter::spawn(self.progress.clone(), total, self.config.progress_steps);
        let daq = &instruments.daq;
        let read = abort
            .guard("acquiring", async {
                daq.read(seconds, frequency, max_voltage)
                    .await
                    .map_err(DaqError::from)
            })
            .await;
        reporter.stop();
        let voltage = read?;

        if voltage.is_empty() {
            return Err(DaqError::Hardware(anyhow!(
                "DAQ returned no samples for a {} s acquisition",
                seconds
            )));
        }
        let nominal = (seconds * frequency).round() as usize;
        if voltage.len() != nominal {
            warn!(nominal, returned = voltage.len(), "DAQ sample count differs from request");
        }

        let scale_factor = calibration.scale_factor;
        let effective_rate = voltage.len() as f64 / seconds;
        let rotation: Vec<f64> = voltage.iter().map(|v| v * scale_factor).collect();
        let curve = allan_deviation(&rotation, 1.0 / effective_rate);

        info!(
            samples = voltage.len(),
            effective_rate,
            windows = curve.len(),
            "Acquisition complete"
        );
        Ok(AcquisitionSession {
            start,
            time_constant,
            duration: seconds,
            sensitivity: max_voltage,
            voltage,
            curve,
            modulation,
            calibration: calibration.clone(),
        })
    }

    async fn countdown(&self, abort: &AbortSignal) -> AppResult<()> {
        let mut remaining = self.config.countdown;
        while !remaining.is_zero() {
            info!("Acquisition starts in {} s", remaining.as_secs_f64().ceil());
            let step = remaining.min(Duration::from_secs(1));
            abort
                .guard("counting down", async {
                    tokio::time::sleep(step).await;
                    Ok(())
                })
                .await?;
            remaining -= step;
        }
        Ok(())
    }
}

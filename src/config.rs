//! Configuration for calibration, acquisition and storage using Figment.
//!
//! Configuration is layered, highest precedence last:
//! 1. Compiled defaults (the historical bench values)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `FOGDAQ_`, nested keys split on `__`
//!
//! ```text
//! FOGDAQ_APPLICATION__LOG_LEVEL=debug
//! FOGDAQ_CALIBRATION__DITHER_ANGLE_DEG=10
//! FOGDAQ_STORAGE__PATH=/data/fog/runs
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fog_daq::config::Settings;
//!
//! let settings = Settings::load(Some("config/fog_daq.toml".as_ref()))?;
//! println!("Dither angle: {} deg", settings.calibration.dither_angle_deg);
//! # Ok::<(), fog_daq::error::DaqError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationConfig, TraceAveraging};
use crate::acquisition::AcquisitionConfig;
use crate::error::{AppResult, DaqError};
use crate::instrument::wait::WaitPolicy;
use crate::units::SECONDS_PER_HOUR;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Scale-factor calibration
    #[serde(default)]
    pub calibration: CalibrationSettings,
    /// Long-run acquisition
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Stage waits
    #[serde(default)]
    pub wait: WaitSettings,
    /// Run persistence
    #[serde(default)]
    pub storage: StorageSettings,
    /// Recorded bench conditions
    #[serde(default)]
    pub environment: EnvironmentSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Dither geometry and instrument settings for scale-factor calibration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Full dither angle in degrees
    pub dither_angle_deg: f64,
    /// Stage velocity during the dither
    pub dither_velocity_deg_per_s: f64,
    /// Seconds trimmed off each constant-speed read window
    pub settle_padding_s: f64,
    /// Pause between starting a half-dither move and touching the amplifier
    pub settle_interval_ms: u64,
    /// Lock-in sensitivity (V) while dithering
    pub coarse_sensitivity_v: f64,
    /// Discarded time-constant reads before the value is trusted
    pub buffer_flush_reads: usize,
    /// How the clockwise and counter-clockwise means are combined
    pub averaging: TraceAveraging,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            dither_angle_deg: 5.0,
            dither_velocity_deg_per_s: 1.0,
            settle_padding_s: 1.0,
            settle_interval_ms: 500,
            coarse_sensitivity_v: 0.1,
            buffer_flush_reads: 5,
            averaging: TraceAveraging::ClockwiseTwice,
        }
    }
}

/// Long-run acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Lock-in sensitivity (V) during the run
    pub sensitivity_v: f64,
    /// Seconds announced before sampling starts
    pub countdown_s: u32,
    /// Progress updates per run
    pub progress_steps: u32,
    /// Discarded time-constant reads before the value is trusted
    pub buffer_flush_reads: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            sensitivity_v: 0.001,
            countdown_s: 5,
            progress_steps: 100,
            buffer_flush_reads: 5,
        }
    }
}

/// Polling behavior for stage state waits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitSettings {
    /// Delay between state polls
    pub poll_interval_ms: u64,
    /// Seconds before a wait is reported as a hang
    pub timeout_s: f64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
            timeout_s: 120.0,
        }
    }
}

/// Where finished runs are written
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Run directory
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Default key for `acquire`
    #[serde(default)]
    pub key: Option<String>,
    /// Replace existing keys instead of skipping them
    #[serde(default)]
    pub overwrite: bool,
}

/// Fixed bench conditions recorded with every run for traceability.
///
/// These are not measured per run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentSettings {
    /// Light source temperature in degrees C
    pub source_temperature_c: f64,
    /// Light source drive current in mA
    pub source_current_ma: f64,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            source_temperature_c: 20.0,
            source_current_ma: 162.63,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Settings {
    /// Load defaults, then `path` if given, then `FOGDAQ_` environment overrides.
    ///
    /// The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment
            .merge(Env::prefixed("FOGDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check values that parse fine but cannot drive a run.
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "unknown log level '{}'",
                self.application.log_level
            )));
        }
        self.calibration_config().validate()?;
        if self.acquisition.progress_steps == 0 {
            return Err(DaqError::Configuration(
                "acquisition.progress_steps must be at least 1".into(),
            ));
        }
        let sensitivity = self.acquisition.sensitivity_v;
        if sensitivity.is_nan() || sensitivity <= 0.0 {
            return Err(DaqError::Configuration(
                "acquisition.sensitivity_v must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Wait policy for stage polling.
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_millis(self.wait.poll_interval_ms),
            timeout: Duration::from_secs_f64(self.wait.timeout_s.max(0.0)),
        }
    }

    /// Calibration settings in the form the calibrator takes.
    pub fn calibration_config(&self) -> CalibrationConfig {
        let c = &self.calibration;
        CalibrationConfig {
            dither_angle: c.dither_angle_deg,
            dither_velocity: c.dither_velocity_deg_per_s,
            padding: c.settle_padding_s,
            settle_interval: Duration::from_millis(c.settle_interval_ms),
            coarse_sensitivity: c.coarse_sensitivity_v,
            buffer_flush_reads: c.buffer_flush_reads,
            averaging: c.averaging,
            wait: self.wait_policy(),
        }
    }

    /// Acquisition settings in the form the controller takes.
    pub fn acquisition_config(&self) -> AcquisitionConfig {
        let a = &self.acquisition;
        AcquisitionConfig {
            sensitivity: a.sensitivity_v,
            countdown: Duration::from_secs(u64::from(a.countdown_s)),
            progress_steps: a.progress_steps,
            buffer_flush_reads: a.buffer_flush_reads,
        }
    }
}

/// A requested acquisition length given as separate seconds, minutes and hours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionDuration {
    /// Seconds
    pub seconds: f64,
    /// Minutes
    pub minutes: f64,
    /// Hours
    pub hours: f64,
}

impl AcquisitionDuration {
    /// A duration given in seconds only.
    pub fn from_seconds(seconds: f64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    /// Total length in seconds.
    ///
    /// Fails with a configuration error unless the sum is positive, finite and
    /// small enough to be a [`Duration`]. A zero sum usually means the caller
    /// forgot to set any of the three fields.
    pub fn total_seconds(&self) -> AppResult<f64> {
        let total = self.seconds + 60.0 * self.minutes + SECONDS_PER_HOUR * self.hours;
        if !total.is_finite() || total <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "duration needs to be positive (got {} s); did you forget to specify seconds, minutes or hours?",
                total
            )));
        }
        Duration::try_from_secs_f64(total).map_err(|err| {
            DaqError::Configuration(format!("duration of {} s is out of range: {}", total, err))
        })?;
        Ok(total)
    }

    /// Total length as a [`Duration`], with the same checks as
    /// [`total_seconds`](Self::total_seconds).
    pub fn total_duration(&self) -> AppResult<Duration> {
        Ok(Duration::from_secs_f64(self.total_seconds()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.calibration.dither_angle_deg, 5.0);
        assert_eq!(settings.environment.source_current_ma, 162.63);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[calibration]
dither_angle_deg = 10.0
dither_velocity_deg_per_s = 2.0
settle_padding_s = 1.0
settle_interval_ms = 250
coarse_sensitivity_v = 0.1
buffer_flush_reads = 3
averaging = "both_directions"

[storage]
path = "/tmp/runs"
key = "night1"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.calibration.dither_angle_deg, 10.0);
        assert_eq!(settings.calibration.averaging, TraceAveraging::BothDirections);
        assert_eq!(settings.storage.key.as_deref(), Some("night1"));
        // Untouched sections keep their defaults
        assert_eq!(settings.acquisition.progress_steps, 100);
    }

    #[test]
    fn test_validation_rejects_empty_read_window() {
        let mut settings = Settings::default();
        settings.calibration.settle_padding_s = 5.0;
        assert!(settings.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "chatty".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duration_sums_units() {
        let d = AcquisitionDuration {
            seconds: 30.0,
            minutes: 2.0,
            hours: 1.0,
        };
        assert_eq!(d.total_seconds().unwrap(), 30.0 + 120.0 + 3600.0);
    }

    #[test]
    fn test_zero_duration_is_configuration_error() {
        let err = AcquisitionDuration::default().total_seconds().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_oversized_duration_is_configuration_error() {
        let d = AcquisitionDuration {
            hours: 1e16,
            ..AcquisitionDuration::default()
        };
        assert!(matches!(d.total_seconds(), Err(DaqError::Configuration(_))));
        assert!(matches!(d.total_duration(), Err(DaqError::Configuration(_))));

        let hour = AcquisitionDuration {
            hours: 1.0,
            ..AcquisitionDuration::default()
        };
        assert_eq!(hour.total_duration().unwrap(), Duration::from_secs(3_600));
    }
}

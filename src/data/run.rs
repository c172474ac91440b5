//! Gyroscope runs and the statistics derived from them.
//!
//! A [`Run`] holds raw samples plus the metadata needed to interpret them.
//! When a scale factor is present the samples are lock-in volts and the
//! rotation rate is `scale_factor * sample` (deg/hr); without one the samples
//! are already deg/hr. Every statistic here resolves through
//! [`Run::rotation_rate`] first and is recomputed on each call.

use std::borrow::Cow;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::data::allan::{allan_deviation, AllanCurve};
use crate::error::{AppResult, DaqError};
use crate::units::{ARW_DIVISOR, SECONDS_PER_HOUR};

/// What a run's raw samples measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesKind {
    /// Lock-in output in volts; needs the scale factor
    Voltage,
    /// Rotation rate in deg/hr
    Rotation,
}

/// An immutable, metadata-tagged sample series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    samples: Vec<f64>,
    rate: f64,
    start: Option<DateTime<Utc>>,
    scale_factor: Option<f64>,
}

impl Run {
    /// Create a run of `samples` taken at `rate` Hz.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::StorageType`] if `rate` is not a positive, finite
    /// number.
    pub fn new(samples: Vec<f64>, rate: f64) -> AppResult<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DaqError::StorageType(format!(
                "sampling rate must be positive and finite, got {}",
                rate
            )));
        }
        Ok(Self {
            samples,
            rate,
            start: None,
            scale_factor: None,
        })
    }

    /// Record when acquisition started.
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// Mark the samples as volts converted by `scale_factor` deg/hr per volt.
    pub fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = Some(scale_factor);
        self
    }

    /// Raw samples, volts or deg/hr depending on [`kind`](Self::kind).
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Sample rate in Hz.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Acquisition start, if recorded.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    /// Scale factor in deg/hr per volt, if the samples are volts.
    pub fn scale_factor(&self) -> Option<f64> {
        self.scale_factor
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the run holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the samples are volts or already deg/hr.
    pub fn kind(&self) -> SeriesKind {
        if self.scale_factor.is_some() {
            SeriesKind::Voltage
        } else {
            SeriesKind::Rotation
        }
    }

    /// Seconds between samples.
    pub fn dt(&self) -> f64 {
        1.0 / self.rate
    }

    /// The series in deg/hr, applying the scale factor when there is one.
    pub fn rotation_rate(&self) -> Cow<'_, [f64]> {
        match self.scale_factor {
            Some(scale) => Cow::Owned(self.samples.iter().map(|v| scale * v).collect()),
            None => Cow::Borrowed(&self.samples),
        }
    }

    /// Time of each sample in hours since the first one.
    pub fn elapsed_hours(&self) -> Vec<f64> {
        let per_sample = 1.0 / (SECONDS_PER_HOUR * self.rate);
        (0..self.samples.len())
            .map(|i| i as f64 * per_sample)
            .collect()
    }

    /// Absolute timestamp of each sample, when the start time is known.
    pub fn timestamps(&self) -> Option<Vec<DateTime<Utc>>> {
        let start = self.start?;
        let step_ns = 1e9 / self.rate;
        Some(
            (0..self.samples.len())
                .map(|i| start + ChronoDuration::nanoseconds((i as f64 * step_ns).round() as i64))
                .collect(),
        )
    }
}

/// Allan deviation of the run's rotation rate (deg/hr against seconds).
pub fn adev(run: &Run) -> AllanCurve {
    allan_deviation(&run.rotation_rate(), run.dt())
}

/// Angular random walk in deg/√hr, read from the shortest-tau deviation.
///
/// `None` when the run is too short to produce any Allan window.
pub fn noise(run: &Run) -> Option<f64> {
    adev(run).first().map(|p| p.sigma / ARW_DIVISOR)
}

/// Bias instability in deg/hr: the floor of the Allan-deviation curve.
pub fn drift(run: &Run) -> Option<f64> {
    adev(run).min_sigma().map(|p| p.sigma)
}

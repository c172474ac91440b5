//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use fog_daq::acquisition::{AcquisitionConfig, AcquisitionController};
use fog_daq::calibration::{CalibrationConfig, ScaleFactorCalibrator};
use fog_daq::instrument::sim::{SimBench, SimConfig};
use fog_daq::instrument::WaitPolicy;

/// Simulated bench sensing a constant bias of `bias_deg_per_hr`.
pub fn bench_with_bias(bias_deg_per_hr: f64) -> SimBench {
    SimBench::new(SimConfig {
        bias_deg_per_hr,
        ..SimConfig::default()
    })
    .expect("Failed to create simulated bench")
}

/// Controller with default bench settings, no countdown and a short hang timeout.
pub fn quick_controller() -> AcquisitionController {
    let calibrator = ScaleFactorCalibrator::new(CalibrationConfig {
        wait: WaitPolicy {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(30),
        },
        ..CalibrationConfig::default()
    })
    .expect("Failed to create calibrator");
    AcquisitionController::new(
        calibrator,
        AcquisitionConfig {
            countdown: Duration::ZERO,
            ..AcquisitionConfig::default()
        },
    )
    .expect("Failed to create controller")
}

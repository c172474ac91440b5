//! Setting tables for SR844-class lock-in amplifiers.
//!
//! Sensitivity and time constant are discrete settings on the front panel; the
//! instrument is commanded by index. Both the simulated amplifier and real
//! drivers resolve requested values through these tables.

/// Full-scale sensitivities in Vrms, indexed as the `SENS` command expects.
pub const SENSITIVITY_STEPS_V: [f64; 15] = [
    100e-9, 300e-9, 1e-6, 3e-6, 10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3,
    300e-3, 1.0,
];

/// Output filter time constants in seconds, indexed as `OFLT` expects.
pub const TIME_CONSTANT_STEPS_S: [f64; 18] = [
    100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0, 30.0, 100.0, 300.0,
    1e3, 3e3, 10e3, 30e3,
];

const RELATIVE_MATCH: f64 = 1e-6;

fn exact_index(steps: &[f64], value: f64) -> Option<usize> {
    steps
        .iter()
        .position(|step| ((step - value) / step).abs() < RELATIVE_MATCH)
}

/// Index of the sensitivity step equal to `volts`, if it is a valid setting.
pub fn sensitivity_index(volts: f64) -> Option<usize> {
    exact_index(&SENSITIVITY_STEPS_V, volts)
}

/// Index of the time-constant step equal to `seconds`, if it is a valid setting.
pub fn time_constant_index(seconds: f64) -> Option<usize> {
    exact_index(&TIME_CONSTANT_STEPS_S, seconds)
}

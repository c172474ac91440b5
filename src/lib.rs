//! Core library for fiber-optic gyroscope noise characterization.
//!
//! A characterization run calibrates the gyroscope's scale factor by dithering
//! its rotation stage, records a long acquisition, and reduces it to an
//! Allan-deviation curve from which angular random walk and bias drift are
//! read. Runs are persisted with their provenance so the statistics can be
//! re-derived later.
//!
//! The library is used by the `fog_daq` binary and by integration tests
//! driving the simulated bench.

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod units;

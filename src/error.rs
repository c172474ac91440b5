//! Custom error types for the library.
//!
//! This module defines the primary error type, `DaqError`, shared by the calibration,
//! acquisition, analysis and storage layers. Using the `thiserror` crate, it provides a
//! centralized and consistent way to handle the different kinds of failure a gyroscope
//! characterization run can hit.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`** / **`UnknownUnit`**: Semantic problems with the requested run,
//!   such as a non-positive acquisition duration or a unit string nobody recognizes.
//!   These are always raised before any instrument is touched.
//! - **`HardwareHang`**: A stage never reported the state we were waiting for within the
//!   configured timeout. Fatal to the run and surfaced to the operator; never retried.
//! - **`Aborted`**: The operator cancelled the run while we were waiting on hardware.
//! - **`Hardware`**: Failures reported by an instrument driver itself.
//! - **`StorageType`**, **`StorageKeyConflict`**, **`StorageNotFound`**: Run store
//!   failures. A key conflict on a non-overwriting write is normally reported as a
//!   skipped write rather than raised; see [`crate::data::storage::RunStore::set`].
//! - **`Io`**, **`Encoding`**, **`Config`**: Wrapped failures from the filesystem, the
//!   on-disk encoding and the configuration loader.
//!
//! Degenerate input to the Allan engine (too few samples for any averaging window) is
//! deliberately *not* an error: the engine returns an empty curve.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by calibration, acquisition and the run store.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Layered configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A setting or request is out of range
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Unit name not recognized
    #[error("Unrecognized unit '{0}'")]
    UnknownUnit(String),

    /// A stage state wait timed out
    #[error("Stage did not become {condition} within {timeout:?}")]
    HardwareHang {
        /// State being waited for
        condition: &'static str,
        /// How long the wait lasted
        timeout: Duration,
    },

    /// The operator aborted the run
    #[error("Operation aborted by operator while {0}")]
    Aborted(String),

    /// A driver call failed
    #[error("Instrument error: {0:#}")]
    Hardware(#[from] anyhow::Error),

    /// A stored entry cannot be read as a run
    #[error("Stored value is not a run: {0}")]
    StorageType(String),

    /// Create-mode write to an existing key
    #[error("Key '{0}' already exists in the run store")]
    StorageKeyConflict(String),

    /// Unknown key
    #[error("Key '{0}' not found in the run store")]
    StorageNotFound(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl DaqError {
    /// True for errors caused by a bad request rather than by hardware or storage.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_) | DaqError::Configuration(_) | DaqError::UnknownUnit(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::StorageNotFound("run1".to_string());
        assert_eq!(err.to_string(), "Key 'run1' not found in the run store");
    }

    #[test]
    fn test_hang_names_the_condition() {
        let err = DaqError::HardwareHang {
            condition: "stationary",
            timeout: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("stationary"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_unknown_unit_is_configuration() {
        assert!(DaqError::UnknownUnit("fortnights".into()).is_configuration());
        assert!(DaqError::Configuration("duration".into()).is_configuration());
    }

    #[test]
    fn test_hardware_error_keeps_context() {
        let err: DaqError = anyhow::anyhow!("serial timeout")
            .context("reading SENS?")
            .into();
        assert!(err.to_string().contains("reading SENS?"));
        assert!(err.to_string().contains("serial timeout"));
    }
}

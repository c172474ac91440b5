//! Explicit unit conversions.
//!
//! Instruments expose a single canonical accessor (volts, seconds, degrees per
//! second). Anything that needs another unit converts through the helpers here
//! instead of growing per-unit accessors on the driver.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DaqError;

/// Seconds in one hour.
pub const SECONDS_PER_HOUR: f64 = 3600.0;

/// Divisor taking the shortest-tau Allan deviation (deg/hr) to angular random
/// walk (deg/√hr).
pub const ARW_DIVISOR: f64 = 60.0;

/// Voltage units accepted in configuration and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltageUnit {
    /// V
    Volts,
    /// mV
    Millivolts,
    /// µV
    Microvolts,
    /// nV
    Nanovolts,
}

impl VoltageUnit {
    fn volts_per_unit(self) -> f64 {
        match self {
            VoltageUnit::Volts => 1.0,
            VoltageUnit::Millivolts => 1e-3,
            VoltageUnit::Microvolts => 1e-6,
            VoltageUnit::Nanovolts => 1e-9,
        }
    }

    /// Express a value given in volts in this unit.
    pub fn from_volts(self, volts: f64) -> f64 {
        volts / self.volts_per_unit()
    }

    /// Convert a value in this unit back to volts.
    pub fn to_volts(self, value: f64) -> f64 {
        value * self.volts_per_unit()
    }

    /// Display symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            VoltageUnit::Volts => "V",
            VoltageUnit::Millivolts => "mV",
            VoltageUnit::Microvolts => "uV",
            VoltageUnit::Nanovolts => "nV",
        }
    }
}

impl fmt::Display for VoltageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for VoltageUnit {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "V" | "v" | "volt" | "volts" => Ok(VoltageUnit::Volts),
            "mV" | "mv" | "millivolts" => Ok(VoltageUnit::Millivolts),
            "uV" | "µV" | "uv" | "microvolts" => Ok(VoltageUnit::Microvolts),
            "nV" | "nv" | "nanovolts" => Ok(VoltageUnit::Nanovolts),
            other => Err(DaqError::UnknownUnit(other.to_string())),
        }
    }
}

/// Time units used for acquisition durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    /// s
    Seconds,
    /// min
    Minutes,
    /// h
    Hours,
}

impl TimeUnit {
    /// Convert `value` in this unit to seconds.
    pub fn to_seconds(self, value: f64) -> f64 {
        match self {
            TimeUnit::Seconds => value,
            TimeUnit::Minutes => value * 60.0,
            TimeUnit::Hours => value * SECONDS_PER_HOUR,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(TimeUnit::Seconds),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(TimeUnit::Minutes),
            "h" | "hr" | "hrs" | "hour" | "hours" => Ok(TimeUnit::Hours),
            other => Err(DaqError::UnknownUnit(other.to_string())),
        }
    }
}

/// Parse a duration such as `90s`, `15min` or `2.5h` into seconds.
pub fn parse_duration_seconds(text: &str) -> Result<f64, DaqError> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| DaqError::Configuration(format!("invalid duration '{}'", text)))?;
    let unit = if unit.trim().is_empty() {
        TimeUnit::Seconds
    } else {
        unit.parse()?
    };
    Ok(unit.to_seconds(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_round_trip_through_units() {
        let v = 0.0025;
        let mv = VoltageUnit::Millivolts.from_volts(v);
        assert!((mv - 2.5).abs() < 1e-12);
        assert!((VoltageUnit::Millivolts.to_volts(mv) - v).abs() < 1e-15);
        assert!((VoltageUnit::Microvolts.from_volts(1e-6) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_voltage_unit_parse() {
        assert_eq!("mV".parse::<VoltageUnit>().unwrap(), VoltageUnit::Millivolts);
        assert_eq!("µV".parse::<VoltageUnit>().unwrap(), VoltageUnit::Microvolts);
        assert!(matches!(
            "kV".parse::<VoltageUnit>(),
            Err(DaqError::UnknownUnit(u)) if u == "kV"
        ));
    }

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration_seconds("90s").unwrap(), 90.0);
        assert_eq!(parse_duration_seconds("15min").unwrap(), 900.0);
        assert_eq!(parse_duration_seconds("2h").unwrap(), 7200.0);
        assert_eq!(parse_duration_seconds("30").unwrap(), 30.0);
    }

    #[test]
    fn test_parse_duration_rejects_unknown_unit() {
        let err = parse_duration_seconds("3 fortnights").unwrap_err();
        assert!(matches!(err, DaqError::UnknownUnit(_)));
        assert!(err.is_configuration());
    }
}

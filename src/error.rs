// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error types shared by the control engine, the calibrator and the CLI.
//!
//! Hardware errors are transient and handled inside the control loop.
//! Configuration errors are never retried: they reject the whole
//! configuration and go straight to the operator.

use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a [`HardwareIo`](crate::hwmon::HardwareIo) binding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    /// A sensor, tachometer or PWM attribute could not be read or parsed.
    #[error("failed to read {target}: {reason}")]
    Read { target: String, reason: String },

    /// The hardware rejected a write.
    #[error("failed to write {value} to {target}: {reason}")]
    Write {
        target: String,
        value: String,
        reason: String,
    },

    /// The capability is absent (e.g. no tachometer paired with a PWM).
    #[error("{target} has no {capability}")]
    Unsupported {
        target: String,
        capability: &'static str,
    },
}

impl HardwareError {
    pub fn read(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Read {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write(target: impl Into<String>, value: impl ToString, reason: impl ToString) -> Self {
        Self::Write {
            target: target.into(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(target: impl Into<String>, capability: &'static str) -> Self {
        Self::Unsupported {
            target: target.into(),
            capability,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Structural or validation failure of a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("failed to access {}: {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("unsupported schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("{} already exists, pass --replace to overwrite it", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("no fan profiles configured")]
    NoProfiles,

    #[error("{pwm} is claimed by more than one profile")]
    DuplicatePwm { pwm: String },

    #[error("{pwm}: curve needs at least 2 points, found {found}")]
    CurveTooShort { pwm: String, found: usize },

    #[error("{pwm}: curve temperatures must be strictly increasing (point {index})")]
    CurveNotIncreasing { pwm: String, index: usize },

    #[error("{pwm}: {field} of {value}% is outside 0-100%")]
    DutyOutOfRange {
        pwm: String,
        field: &'static str,
        value: f64,
    },

    #[error("{pwm}: stop duty {stop}% is above min start duty {min_start}%")]
    StopAboveStart {
        pwm: String,
        stop: f64,
        min_start: f64,
    },

    #[error("{pwm}: hysteresis must be a non-negative number of degrees, got {value}")]
    NegativeHysteresis { pwm: String, value: f64 },

    #[error("{pwm}: poll interval must be greater than zero")]
    InvalidPollInterval { pwm: String },

    #[error("{pwm}: no temperature sensors bound")]
    NoSensors { pwm: String },

    #[error("{pwm}: sensor {sensor} does not exist")]
    UnresolvedSensor { pwm: String, sensor: String },

    #[error("PWM output {pwm} does not exist")]
    UnresolvedPwm { pwm: String },

    #[error("device {device} is {found:?}, configuration expects {expected:?}")]
    DeviceMismatch {
        device: String,
        expected: String,
        found: Option<String>,
    },

    #[error("legacy config line {line}: {reason}")]
    Legacy { line: usize, reason: String },
}

/// A PWM channel is already under exclusive control of another owner.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("{pwm} is in use by another fanctl process ({})", path.display())]
    Busy { pwm: String, path: PathBuf },

    #[error("failed to open lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Probing a single channel did not converge.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration of {pwm} failed: {reason}")]
    Failed { pwm: String, reason: String },

    #[error("calibration of {pwm} was cancelled")]
    Cancelled { pwm: String },

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Top-level error, mapped to a process exit code by the CLI.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Exit code distinguishing configuration, hardware and calibration
    /// failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) => 2,
            Error::Hardware(_) => 3,
            Error::Calibration(CalibrationError::Hardware(_)) => 3,
            Error::Calibration(CalibrationError::Failed { .. }) => 4,
            Error::Calibration(CalibrationError::Lock(_)) | Error::Lock(_) => 5,
            Error::Calibration(CalibrationError::Cancelled { .. }) | Error::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let config = Error::from(ConfigError::NoProfiles);
        let hw = Error::from(HardwareError::read("hwmon0/temp1", "gone"));
        let cal = Error::from(CalibrationError::Failed {
            pwm: "hwmon0/pwm1".to_string(),
            reason: "fan did not respond".to_string(),
        });
        assert_eq!(config.exit_code(), 2);
        assert_eq!(hw.exit_code(), 3);
        assert_eq!(cal.exit_code(), 4);
    }

    #[test]
    fn test_calibration_hardware_error_counts_as_hardware() {
        let err = Error::from(CalibrationError::from(HardwareError::write(
            "hwmon0/pwm1",
            128,
            "permission denied",
        )));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_messages_name_the_channel() {
        let err = ConfigError::StopAboveStart {
            pwm: "hwmon2/pwm1".to_string(),
            stop: 40.0,
            min_start: 30.0,
        };
        assert_eq!(
            err.to_string(),
            "hwmon2/pwm1: stop duty 40% is above min start duty 30%"
        );
    }
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan profiles: which sensors drive which PWM output, and how.
//!
//! A [`ProfileSet`] can only be obtained through [`ProfileSet::validate`],
//! so anything holding one holds a configuration that passed every check.

use crate::curve::{Curve, DUTY_MAX, DUTY_MIN};
use crate::error::ConfigError;
use crate::hwmon::{HardwareIo, PwmRef, SensorRef};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// How several sensor readings bound to one fan become one temperature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Hottest reading wins: a fan cools its hottest component.
    #[default]
    Max,
    Average,
}

impl Reduction {
    /// Reduce readings to one temperature. `None` for an empty slice.
    pub fn reduce(self, readings: &[f64]) -> Option<f64> {
        if readings.is_empty() {
            return None;
        }
        Some(match self {
            Reduction::Max => readings.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reduction::Average => readings.iter().sum::<f64>() / readings.len() as f64,
        })
    }
}

/// One PWM output bound to its sensors, curve and operating range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanProfile {
    /// Owning channel. Stored as the table key on disk.
    #[serde(skip)]
    pub pwm: PwmRef,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Temperature sensors feeding this fan
    pub sensors: Vec<SensorRef>,

    #[serde(default)]
    pub reduction: Reduction,

    /// Degrees the temperature must fall before duty is lowered
    #[serde(default)]
    pub hysteresis: f64,

    /// Duty commanded to get a stopped fan spinning, in percent
    #[serde(default)]
    pub min_start: f64,

    /// Lowest running duty before the fan stalls, in percent
    #[serde(default)]
    pub stop: f64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Largest duty change per poll, in percent. Unlimited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_step: Option<f64>,

    pub curve: Curve,
}

impl FanProfile {
    pub fn new(pwm: PwmRef, sensors: Vec<SensorRef>, curve: Curve) -> Self {
        Self {
            pwm,
            name: None,
            sensors,
            reduction: Reduction::default(),
            hysteresis: 0.0,
            min_start: 0.0,
            stop: 0.0,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_step: None,
            curve,
        }
    }

    /// Name for logs: the display name if set, else the PWM id.
    pub fn title(&self) -> &str {
        self.name.as_deref().unwrap_or(self.pwm.as_str())
    }

    /// Structural checks that need no hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pwm = self.pwm.to_string();

        if self.sensors.is_empty() {
            return Err(ConfigError::NoSensors { pwm });
        }
        self.curve.validate(&pwm)?;

        for (field, value) in [("min start duty", self.min_start), ("stop duty", self.stop)] {
            if !(DUTY_MIN..=DUTY_MAX).contains(&value) {
                return Err(ConfigError::DutyOutOfRange { pwm, field, value });
            }
        }
        if self.stop > self.min_start {
            return Err(ConfigError::StopAboveStart {
                pwm,
                stop: self.stop,
                min_start: self.min_start,
            });
        }
        if !(self.hysteresis >= 0.0 && self.hysteresis.is_finite()) {
            return Err(ConfigError::NegativeHysteresis {
                pwm,
                value: self.hysteresis,
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval { pwm });
        }
        if let Some(step) = self
            .max_step
            .filter(|step| !(*step > DUTY_MIN && *step <= DUTY_MAX))
        {
            return Err(ConfigError::DutyOutOfRange {
                pwm,
                field: "max step",
                value: step,
            });
        }
        Ok(())
    }

    /// Check every referenced sensor and the PWM exist on `hw`.
    pub fn resolve(&self, hw: &dyn HardwareIo) -> Result<(), ConfigError> {
        if !hw.has_pwm(&self.pwm) {
            return Err(ConfigError::UnresolvedPwm {
                pwm: self.pwm.to_string(),
            });
        }
        if let Some(missing) = self.sensors.iter().find(|s| !hw.has_sensor(s)) {
            return Err(ConfigError::UnresolvedSensor {
                pwm: self.pwm.to_string(),
                sensor: missing.to_string(),
            });
        }
        Ok(())
    }
}

/// A validated set of profiles, at most one per PWM output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSet {
    profiles: Vec<FanProfile>,
}

impl ProfileSet {
    /// Validate the whole set against `hw`. The first violation rejects
    /// everything.
    pub fn validate(profiles: Vec<FanProfile>, hw: &dyn HardwareIo) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for profile in &profiles {
            if !seen.insert(&profile.pwm) {
                return Err(ConfigError::DuplicatePwm {
                    pwm: profile.pwm.to_string(),
                });
            }
        }
        for profile in &profiles {
            profile.validate()?;
            profile.resolve(hw)?;
        }
        Ok(Self { profiles })
    }

    pub fn profiles(&self) -> &[FanProfile] {
        &self.profiles
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn get(&self, pwm: &PwmRef) -> Option<&FanProfile> {
        self.profiles.iter().find(|p| &p.pwm == pwm)
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

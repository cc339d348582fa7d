// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve definitions, interpolation and hysteresis.
//!
//! A curve maps temperature readings to duty cycles in percent (0-100).
//! Points are linearly interpolated between defined thresholds and
//! clamped to the first/last point outside the curve's domain.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Lowest duty cycle, in percent.
pub const DUTY_MIN: f64 = 0.0;

/// Highest duty cycle, in percent.
pub const DUTY_MAX: f64 = 100.0;

/// Duties closer than this are treated as equal.
pub const DUTY_EPSILON: f64 = 0.05;

/// A single point on a fan curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CurvePoint {
    /// Temperature in degrees Celsius
    pub temp_c: f64,
    /// Duty cycle in percent (0-100)
    pub duty: f64,
}

impl CurvePoint {
    pub const fn new(temp_c: f64, duty: f64) -> Self {
        Self { temp_c, duty }
    }
}

/// An ordered list of temperature-to-duty points.
///
/// Points are kept in the order given. A curve whose temperatures are not
/// strictly increasing is rejected by [`Curve::validate`], never reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Curve {
    points: Vec<CurvePoint>,
}

impl Curve {
    pub fn new(points: Vec<CurvePoint>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Duty below the curve's domain.
    pub fn floor(&self) -> f64 {
        self.points.first().map_or(DUTY_MAX, |p| p.duty)
    }

    /// Duty above the curve's domain.
    pub fn ceiling(&self) -> f64 {
        self.points.last().map_or(DUTY_MAX, |p| p.duty)
    }

    /// Interpolate the duty for a given temperature.
    ///
    /// - Below the lowest point: returns the floor duty
    /// - Above the highest point: returns the ceiling duty
    /// - Between two points: linear interpolation
    /// - Empty curve or unreadable (NaN) temperature: the ceiling, since a
    ///   glitching sensor must not stop a fan
    pub fn interpolate(&self, temp_c: f64) -> f64 {
        if self.points.is_empty() || temp_c.is_nan() {
            return clamp_duty(self.ceiling());
        }
        let first = &self.points[0];
        if self.points.len() == 1 || temp_c <= first.temp_c {
            return clamp_duty(first.duty);
        }

        let last = &self.points[self.points.len() - 1];
        if temp_c >= last.temp_c {
            return clamp_duty(last.duty);
        }

        for window in self.points.windows(2) {
            let lo = &window[0];
            let hi = &window[1];

            if temp_c >= lo.temp_c && temp_c <= hi.temp_c {
                let range_t = hi.temp_c - lo.temp_c;
                if range_t <= 0.0 {
                    return clamp_duty(lo.duty);
                }
                let frac = (temp_c - lo.temp_c) / range_t;
                return clamp_duty(lo.duty + frac * (hi.duty - lo.duty));
            }
        }

        clamp_duty(last.duty)
    }

    /// Validate point count, temperature ordering and duty range.
    /// `pwm` names the owning channel in the error.
    pub fn validate(&self, pwm: &str) -> Result<(), ConfigError> {
        if self.points.len() < 2 {
            return Err(ConfigError::CurveTooShort {
                pwm: pwm.to_string(),
                found: self.points.len(),
            });
        }
        for (i, p) in self.points.iter().enumerate() {
            if !p.temp_c.is_finite() || (i > 0 && p.temp_c <= self.points[i - 1].temp_c) {
                return Err(ConfigError::CurveNotIncreasing {
                    pwm: pwm.to_string(),
                    index: i,
                });
            }
            if !(DUTY_MIN..=DUTY_MAX).contains(&p.duty) {
                return Err(ConfigError::DutyOutOfRange {
                    pwm: pwm.to_string(),
                    field: "curve duty",
                    value: p.duty,
                });
            }
        }
        Ok(())
    }
}

/// Result of one curve evaluation: the duty to command and the temperature
/// at which that duty was established.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub duty: f64,
    /// Temperature where the current duty level was set. A lower duty is
    /// only accepted once the temperature falls `hysteresis` below this.
    pub anchor_c: f64,
}

/// Evaluate `curve` at `temp_c`, given the previous evaluation.
///
/// Increases are applied immediately. A decrease is held back until the
/// temperature has dropped at least `hysteresis` degrees below the anchor of
/// the previous evaluation.
pub fn evaluate(
    curve: &Curve,
    temp_c: f64,
    previous: Option<Evaluation>,
    hysteresis: f64,
) -> Evaluation {
    let target = curve.interpolate(temp_c);

    let Some(prev) = previous else {
        return Evaluation {
            duty: target,
            anchor_c: temp_c,
        };
    };

    if target < prev.duty {
        if temp_c <= prev.anchor_c - hysteresis.max(0.0) {
            return Evaluation {
                duty: target,
                anchor_c: temp_c,
            };
        }
        return prev;
    }

    // A rise within the epsilon keeps the anchor.
    let anchor_c = if target > prev.duty + DUTY_EPSILON {
        temp_c
    } else {
        prev.anchor_c
    };
    Evaluation {
        duty: target,
        anchor_c,
    }
}

/// Clamp a duty into 0-100%. NaN becomes full duty.
pub fn clamp_duty(duty: f64) -> f64 {
    if duty.is_nan() {
        return DUTY_MAX;
    }
    duty.clamp(DUTY_MIN, DUTY_MAX)
}

/// A "silent" curve: fan stopped until 30C, ramp up to full at 90C.
pub fn default_silent_curve() -> Curve {
    Curve::new(vec![
        CurvePoint::new(30.0, 0.0),
        CurvePoint::new(50.0, 25.0),
        CurvePoint::new(70.0, 60.0),
        CurvePoint::new(80.0, 80.0),
        CurvePoint::new(90.0, 100.0),
    ])
}

/// A "performance" curve: always some airflow, aggressive ramp.
pub fn default_performance_curve() -> Curve {
    Curve::new(vec![
        CurvePoint::new(30.0, 25.0),
        CurvePoint::new(50.0, 50.0),
        CurvePoint::new(65.0, 80.0),
        CurvePoint::new(75.0, 100.0),
    ])
}

/// Look up one of the built-in curves by name.
pub fn builtin_curve(name: &str) -> Option<Curve> {
    match name {
        "silent" => Some(default_silent_curve()),
        "performance" => Some(default_performance_curve()),
        _ => None,
    }
}

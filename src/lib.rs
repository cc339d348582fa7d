// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! hwmon fan control: a curve-driven control daemon and a PWM channel
//! calibrator for Linux hwmon devices.

pub mod calibrate;
pub mod config;
pub mod control;
pub mod curve;
pub mod daemon;
pub mod error;
pub mod hwmon;
pub mod legacy;
pub mod lock;
pub mod profile;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};

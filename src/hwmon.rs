// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Hardware access: the [`HardwareIo`] capability and its hwmon sysfs binding.
//!
//! The engine only ever talks to [`HardwareIo`]. [`SysfsHardware`] binds it
//! to `/sys/class/hwmon/`, scanning for fan and temperature entries and
//! converting between the kernel's native units and the engine's units
//! (degrees Celsius and duty percent).

use crate::error::HardwareError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Default sysfs hwmon root.
pub const HWMON_ROOT: &str = "/sys/class/hwmon";

/// Native PWM range exposed by hwmon drivers.
pub const PWM_RAW_MAX: u8 = 255;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of a temperature sensor, e.g. "hwmon3/temp1".
///
/// Readings behind a `SensorRef` are always degrees Celsius; bindings that
/// see other units (hwmon reports millidegrees) convert on read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorRef(String);

/// Identifier of a PWM control channel, e.g. "hwmon3/pwm1".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PwmRef(String);

impl SensorRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PwmRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PwmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Control mode of a PWM channel (`pwmN_enable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PwmMode {
    /// `0`: no control, the fan runs at full speed on most chips
    FullSpeed,
    /// `1`: duty is set by software
    Manual,
    /// `2` and above: chip/BIOS control. The raw value is kept so it can be
    /// restored verbatim, drivers use several automatic variants.
    Automatic(u8),
}

impl PwmMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PwmMode::FullSpeed,
            1 => PwmMode::Manual,
            n => PwmMode::Automatic(n),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            PwmMode::FullSpeed => 0,
            PwmMode::Manual => 1,
            PwmMode::Automatic(n) => n,
        }
    }
}

impl fmt::Display for PwmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PwmMode::FullSpeed => write!(f, "full speed"),
            PwmMode::Manual => write!(f, "manual"),
            PwmMode::Automatic(n) => write!(f, "automatic ({n})"),
        }
    }
}

/// Convert a duty in percent to the native 0-255 range.
pub fn duty_to_raw(duty: f64) -> u8 {
    let duty = crate::curve::clamp_duty(duty);
    (duty * PWM_RAW_MAX as f64 / 100.0).round() as u8
}

/// Convert a native 0-255 PWM value to percent.
pub fn raw_to_duty(raw: u8) -> f64 {
    raw as f64 * 100.0 / PWM_RAW_MAX as f64
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Everything the engine needs from the hardware.
///
/// Implementations must be cheap to call from async tasks: each call is a
/// single attribute read or write.
pub trait HardwareIo: Send + Sync {
    /// Current temperature in degrees Celsius.
    fn read_sensor(&self, sensor: &SensorRef) -> Result<f64, HardwareError>;

    fn read_pwm_mode(&self, pwm: &PwmRef) -> Result<PwmMode, HardwareError>;

    fn write_pwm_mode(&self, pwm: &PwmRef, mode: PwmMode) -> Result<(), HardwareError>;

    /// Current duty in percent.
    fn read_duty(&self, pwm: &PwmRef) -> Result<f64, HardwareError>;

    /// Command a duty in percent. The channel must be in manual mode.
    fn write_duty(&self, pwm: &PwmRef, duty: f64) -> Result<(), HardwareError>;

    /// Fan speed in RPM of the fan paired with `pwm`, or
    /// [`HardwareError::Unsupported`] if there is no tachometer.
    fn read_tach(&self, pwm: &PwmRef) -> Result<u32, HardwareError>;

    fn has_sensor(&self, sensor: &SensorRef) -> bool;

    fn has_pwm(&self, pwm: &PwmRef) -> bool;

    /// Driver name of a device (hwmon `name` attribute), if known.
    fn device_name(&self, _device: &str) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Discovery data
// ---------------------------------------------------------------------------

/// A discovered fan (PWM output + optional tachometer input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fan {
    /// Unique identifier, e.g. "hwmon3/pwm1"
    pub pwm: PwmRef,
    /// Human-readable label if available
    pub label: Option<String>,
    /// Whether a `fanN_input` tachometer exists
    pub has_tach: bool,
    /// Name of the parent hwmon device
    pub hwmon_name: String,
}

/// A discovered temperature sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempSensor {
    /// Unique identifier, e.g. "hwmon3/temp1"
    pub sensor: SensorRef,
    /// Human-readable label if available
    pub label: Option<String>,
    /// Name of the parent hwmon device
    pub hwmon_name: String,
}

// ---------------------------------------------------------------------------
// Sysfs binding
// ---------------------------------------------------------------------------

/// [`HardwareIo`] over a hwmon sysfs tree.
#[derive(Debug, Clone)]
pub struct SysfsHardware {
    root: PathBuf,
}

impl Default for SysfsHardware {
    fn default() -> Self {
        Self::new(HWMON_ROOT)
    }
}

impl SysfsHardware {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scan the hwmon root and return all discovered fans.
    pub fn discover_fans(&self) -> Result<Vec<Fan>, HardwareError> {
        let mut fans = Vec::new();

        for (hwmon_dir, hwmon_basename) in self.hwmon_dirs()? {
            let hwmon_name = read_trimmed(&hwmon_dir.join("name")).unwrap_or_default();

            for n in 1..=16 {
                if !hwmon_dir.join(format!("pwm{n}")).exists() {
                    break;
                }

                fans.push(Fan {
                    pwm: PwmRef::new(format!("{hwmon_basename}/pwm{n}")),
                    label: read_trimmed(&hwmon_dir.join(format!("fan{n}_label"))),
                    has_tach: hwmon_dir.join(format!("fan{n}_input")).exists(),
                    hwmon_name: hwmon_name.clone(),
                });
            }
        }

        fans.sort_by(|a, b| a.pwm.cmp(&b.pwm));
        Ok(fans)
    }

    /// Scan the hwmon root and return all discovered temperature sensors.
    pub fn discover_temp_sensors(&self) -> Result<Vec<TempSensor>, HardwareError> {
        let mut sensors = Vec::new();

        for (hwmon_dir, hwmon_basename) in self.hwmon_dirs()? {
            let hwmon_name = read_trimmed(&hwmon_dir.join("name")).unwrap_or_default();

            for n in 1..=32 {
                if !hwmon_dir.join(format!("temp{n}_input")).exists() {
                    break;
                }

                sensors.push(TempSensor {
                    sensor: SensorRef::new(format!("{hwmon_basename}/temp{n}")),
                    label: read_trimmed(&hwmon_dir.join(format!("temp{n}_label"))),
                    hwmon_name: hwmon_name.clone(),
                });
            }
        }

        sensors.sort_by(|a, b| a.sensor.cmp(&b.sensor));
        Ok(sensors)
    }

    fn hwmon_dirs(&self) -> Result<Vec<(PathBuf, String)>, HardwareError> {
        let target = self.root.display().to_string();
        let entries = fs::read_dir(&self.root).map_err(|e| HardwareError::read(&target, e))?;
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HardwareError::read(&target, e))?;
            dirs.push((entry.path(), entry.file_name().to_string_lossy().to_string()));
        }
        Ok(dirs)
    }

    /// Resolve "hwmonN/attr" to a path under the root, appending `suffix`.
    /// Ids that would escape the root are rejected.
    fn attr_path(&self, id: &str, suffix: &str) -> Option<PathBuf> {
        let (device, attr) = id.split_once('/')?;
        let plain = |s: &str| !s.is_empty() && s != "." && s != ".." && !s.contains('/');
        if !plain(device) || !plain(attr) {
            return None;
        }
        Some(self.root.join(device).join(format!("{attr}{suffix}")))
    }

    fn sensor_path(&self, sensor: &SensorRef) -> Option<PathBuf> {
        let suffix = if sensor.as_str().ends_with("_input") {
            ""
        } else {
            "_input"
        };
        self.attr_path(sensor.as_str(), suffix)
    }

    fn pwm_path(&self, pwm: &PwmRef) -> Option<PathBuf> {
        self.attr_path(pwm.as_str(), "")
    }

    fn enable_path(&self, pwm: &PwmRef) -> Option<PathBuf> {
        self.attr_path(pwm.as_str(), "_enable")
    }

    /// `fanN_input` paired with `pwmN` on the same device.
    fn tach_path(&self, pwm: &PwmRef) -> Option<PathBuf> {
        let (device, attr) = pwm.as_str().split_once('/')?;
        let n = attr.strip_prefix("pwm")?;
        if n.is_empty() || !n.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        self.attr_path(&format!("{device}/fan{n}"), "_input")
    }

    fn read_value<T: std::str::FromStr>(
        &self,
        target: &str,
        path: Option<PathBuf>,
    ) -> Result<T, HardwareError>
    where
        T::Err: fmt::Display,
    {
        let path = path.ok_or_else(|| HardwareError::read(target, "malformed id"))?;
        let raw = fs::read_to_string(&path).map_err(|e| HardwareError::read(target, e))?;
        let value = raw
            .trim()
            .parse::<T>()
            .map_err(|e| HardwareError::read(target, format!("bad value {:?}: {e}", raw.trim())))?;
        log::trace!("{} = {}", path.display(), raw.trim());
        Ok(value)
    }

    fn write_value(&self, target: &str, path: Option<PathBuf>, value: u8) -> Result<(), HardwareError> {
        let path = path.ok_or_else(|| HardwareError::write(target, value, "malformed id"))?;
        fs::write(&path, format!("{value}")).map_err(|e| HardwareError::write(target, value, e))
    }
}

impl HardwareIo for SysfsHardware {
    fn read_sensor(&self, sensor: &SensorRef) -> Result<f64, HardwareError> {
        let millic: i64 = self.read_value(sensor.as_str(), self.sensor_path(sensor))?;
        Ok(millic as f64 / 1000.0)
    }

    fn read_pwm_mode(&self, pwm: &PwmRef) -> Result<PwmMode, HardwareError> {
        let target = format!("{pwm}_enable");
        let raw: u8 = self.read_value(&target, self.enable_path(pwm))?;
        Ok(PwmMode::from_raw(raw))
    }

    fn write_pwm_mode(&self, pwm: &PwmRef, mode: PwmMode) -> Result<(), HardwareError> {
        let target = format!("{pwm}_enable");
        self.write_value(&target, self.enable_path(pwm), mode.raw())
    }

    fn read_duty(&self, pwm: &PwmRef) -> Result<f64, HardwareError> {
        let raw: u8 = self.read_value(pwm.as_str(), self.pwm_path(pwm))?;
        Ok(raw_to_duty(raw))
    }

    fn write_duty(&self, pwm: &PwmRef, duty: f64) -> Result<(), HardwareError> {
        self.write_value(pwm.as_str(), self.pwm_path(pwm), duty_to_raw(duty))
    }

    fn read_tach(&self, pwm: &PwmRef) -> Result<u32, HardwareError> {
        let path = self
            .tach_path(pwm)
            .filter(|p| p.exists())
            .ok_or_else(|| HardwareError::unsupported(pwm.as_str(), "tachometer"))?;
        self.read_value(&format!("{pwm} tachometer"), Some(path))
    }

    fn has_sensor(&self, sensor: &SensorRef) -> bool {
        self.sensor_path(sensor).is_some_and(|p| p.is_file())
    }

    fn has_pwm(&self, pwm: &PwmRef) -> bool {
        self.pwm_path(pwm).is_some_and(|p| p.is_file())
            && self.enable_path(pwm).is_some_and(|p| p.is_file())
    }

    fn device_name(&self, device: &str) -> Option<String> {
        if device.is_empty() || device.contains('/') || device == ".." {
            return None;
        }
        read_trimmed(&self.root.join(device).join("name"))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

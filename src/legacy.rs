// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Import of lm-sensors `fancontrol` configuration files (`/etc/fancontrol`).
//!
//! The legacy format is a set of `KEY=value` lines. Per-channel keys hold
//! space separated `hwmonN/pwmM=value` pairs:
//!
//! ```text
//! INTERVAL=10
//! DEVNAME=hwmon0=it8718 hwmon1=coretemp
//! FCTEMPS=hwmon0/pwm1=hwmon1/temp1_input+hwmon0/temp2_input
//! MINTEMP=hwmon0/pwm1=40
//! MAXTEMP=hwmon0/pwm1=70
//! ```
//!
//! Every `FCTEMPS` entry becomes one [`FanProfile`]. The result is an
//! ordinary [`Config`] and goes through the same validation as a native one.

use crate::config::{self, Config};
use crate::curve::{Curve, CurvePoint};
use crate::error::ConfigError;
use crate::hwmon::{PwmRef, SensorRef, raw_to_duty};
use crate::profile::{FanProfile, Reduction};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Default location of the legacy file.
pub const LEGACY_CONFIG_PATH: &str = "/etc/fancontrol";

const DEFAULT_INTERVAL_S: u64 = 10;
const DEFAULT_MIN_TEMP: f64 = 20.0;
const DEFAULT_MAX_TEMP: f64 = 60.0;
const DEFAULT_MIN_PWM: u8 = 0;
const DEFAULT_MAX_PWM: u8 = 255;
const DEFAULT_MIN_START: u8 = 32;
const DEFAULT_MIN_STOP: u8 = 40;

/// Raw value of one key, with the line it came from.
#[derive(Debug, Clone)]
struct Entry<'a> {
    line: usize,
    value: &'a str,
}

/// Per-channel key: `hwmonN/pwmM=value` pairs.
type Channels<'a> = BTreeMap<PwmRef, Entry<'a>>;

/// Parse a legacy file into a configuration (not yet validated).
pub fn parse_legacy(contents: &str) -> Result<Config, ConfigError> {
    let mut globals: BTreeMap<&str, Entry> = BTreeMap::new();
    let mut channels: BTreeMap<&str, Channels> = BTreeMap::new();

    for (index, raw) in contents.lines().enumerate() {
        let line = index + 1;
        let text = raw.split('#').next().unwrap_or_default().trim();
        if text.is_empty() {
            continue;
        }
        let Some((key, value)) = text.split_once('=') else {
            log::warn!("line {line}: could not parse {text:?}, skipping");
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "INTERVAL" | "DEVPATH" | "DEVNAME" => {
                globals.insert(key, Entry { line, value });
            }
            "FCTEMPS" | "FCFANS" | "MINTEMP" | "MAXTEMP" | "MINSTART" | "MINSTOP" | "MINPWM"
            | "MAXPWM" => {
                channels.insert(key, parse_channels(line, value)?);
            }
            _ => log::warn!("line {line}: unknown key {key}, skipping"),
        }
    }

    let interval_s = match globals.get("INTERVAL") {
        Some(entry) => parse_number::<u64>(entry)?,
        None => DEFAULT_INTERVAL_S,
    };
    if interval_s == 0 {
        let line = globals.get("INTERVAL").map_or(0, |e| e.line);
        return Err(legacy_err(line, "INTERVAL must be at least 1 second"));
    }

    let mut cfg = Config::default();
    if let Some(entry) = globals.get("DEVNAME") {
        for pair in entry.value.split_whitespace() {
            let (device, name) = pair
                .split_once('=')
                .ok_or_else(|| legacy_err(entry.line, format!("malformed DEVNAME entry {pair:?}")))?;
            cfg.devices
                .insert(normalise_id(device), name.trim().to_string());
        }
    }

    let Some(temps) = channels.get("FCTEMPS") else {
        return Err(ConfigError::NoProfiles);
    };

    for (pwm, entry) in temps {
        let sensors: Vec<SensorRef> = entry
            .value
            .split('+')
            .map(|s| SensorRef::new(normalise_id(s).trim_end_matches("_input")))
            .collect();
        if sensors.iter().any(|s| s.as_str().is_empty()) {
            return Err(legacy_err(entry.line, format!("empty sensor for {pwm}")));
        }

        if let Some(fan) = channels.get("FCFANS").and_then(|f| f.get(pwm)) {
            check_tach_pairing(pwm, fan);
        }

        let min_temp = channel_value(&channels, "MINTEMP", pwm, DEFAULT_MIN_TEMP)?;
        let max_temp = channel_value(&channels, "MAXTEMP", pwm, DEFAULT_MAX_TEMP)?;
        let min_pwm = channel_value(&channels, "MINPWM", pwm, DEFAULT_MIN_PWM)?;
        let max_pwm = channel_value(&channels, "MAXPWM", pwm, DEFAULT_MAX_PWM)?;
        let min_stop = channel_value(&channels, "MINSTOP", pwm, DEFAULT_MIN_STOP)?;
        // The stock start default sits below the stock stop default.
        let min_start = channel_value(&channels, "MINSTART", pwm, DEFAULT_MIN_START.max(min_stop))?;

        let mut points = Vec::with_capacity(3);
        if min_pwm != min_stop {
            points.push(CurvePoint::new(min_temp - 1.0, raw_to_duty(min_pwm)));
        }
        points.push(CurvePoint::new(min_temp, raw_to_duty(min_stop)));
        points.push(CurvePoint::new(max_temp, raw_to_duty(max_pwm)));

        let mut profile = FanProfile::new(pwm.clone(), sensors, Curve::new(points));
        profile.reduction = Reduction::Max;
        profile.min_start = raw_to_duty(min_start);
        profile.stop = raw_to_duty(min_stop);
        profile.poll_interval_ms = interval_s * 1000;
        cfg.upsert_profile(profile);
    }

    for (key, entries) in &channels {
        for (pwm, entry) in entries {
            if !temps.contains_key(pwm) {
                log::warn!(
                    "line {}: {key} for {pwm} has no FCTEMPS entry, skipping",
                    entry.line
                );
            }
        }
    }

    log::info!("Imported {} fan profile(s)", cfg.fans.len());
    Ok(cfg)
}

/// Read and parse a legacy file.
pub fn import_legacy(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    log::info!("Importing {}", path.display());
    parse_legacy(&contents)
}

/// Write an imported configuration to `dest`, refusing to overwrite an
/// existing file unless `replace` is set.
pub fn install(cfg: &Config, dest: &Path, replace: bool) -> Result<(), ConfigError> {
    if dest.exists() && !replace {
        return Err(ConfigError::AlreadyExists {
            path: dest.to_path_buf(),
        });
    }
    config::save_config(dest, cfg)
}

fn parse_channels(line: usize, value: &str) -> Result<Channels<'_>, ConfigError> {
    let mut channels = Channels::new();
    for pair in value.split_whitespace() {
        let (pwm, value) = pair
            .split_once('=')
            .ok_or_else(|| legacy_err(line, format!("malformed entry {pair:?}")))?;
        channels.insert(PwmRef::new(normalise_id(pwm)), Entry { line, value });
    }
    Ok(channels)
}

fn channel_value<T>(
    channels: &BTreeMap<&str, Channels>,
    key: &str,
    pwm: &PwmRef,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match channels.get(key).and_then(|c| c.get(pwm)) {
        Some(entry) => parse_number(entry),
        None => {
            log::debug!("{pwm}: no {key}, using default");
            Ok(default)
        }
    }
}

fn parse_number<T: std::str::FromStr>(entry: &Entry) -> Result<T, ConfigError> {
    entry
        .value
        .parse()
        .map_err(|_| legacy_err(entry.line, format!("invalid number {:?}", entry.value)))
}

/// `hwmonN/fanM_input` is expected to pair with `hwmonN/pwmM`; tachometers
/// are always paired that way here.
fn check_tach_pairing(pwm: &PwmRef, fan: &Entry) {
    let fan_id = normalise_id(fan.value);
    let expected = pwm.as_str().replacen("/pwm", "/fan", 1) + "_input";
    if fan_id != expected {
        log::warn!(
            "line {}: {pwm} is paired with {fan_id}, the tachometer of {expected} will be used",
            fan.line
        );
    }
}

/// Strip the sysfs prefix and `device/` components older configs carry:
/// `/sys/class/hwmon/hwmon0/device/pwm1` becomes `hwmon0/pwm1`.
fn normalise_id(raw: &str) -> String {
    let raw = raw.trim().trim_start_matches("/sys/class/hwmon/");
    raw.split('/')
        .filter(|part| !part.is_empty() && *part != "device")
        .collect::<Vec<_>>()
        .join("/")
}

fn legacy_err(line: usize, reason: impl Into<String>) -> ConfigError {
    ConfigError::Legacy {
        line,
        reason: reason.into(),
    }
}

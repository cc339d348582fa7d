// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Persists daemon settings and fan profiles to TOML, keyed by PWM id.
//! Default path: `/etc/fanctl/config.toml`

use crate::curve::{DUTY_MAX, DUTY_MIN};
use crate::error::ConfigError;
use crate::hwmon::{HardwareIo, PwmRef};
use crate::lock::DEFAULT_LOCK_DIR;
use crate::profile::{FanProfile, ProfileSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fanctl/config.toml";

/// Default daemon socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/fanctl.sock";

/// Schema version written by this build. Files with any other version are
/// rejected.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub schema_version: u32,

    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Expected driver name per hwmon device, e.g. `hwmon2 = "nct6775"`.
    /// hwmon numbering is not stable across boots, so a mismatch rejects
    /// the configuration instead of driving the wrong fan.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, String>,

    /// Fan profiles, keyed by PWM id (e.g. "hwmon3/pwm1").
    #[serde(default)]
    pub fans: BTreeMap<PwmRef, FanProfile>,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Path for the Unix domain status socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Directory holding per-channel lock files.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,

    /// Whether to hand fans back to their original mode on daemon exit.
    #[serde(default = "default_true")]
    pub restore_on_exit: bool,

    /// Duty commanded while a profile is faulted, in percent.
    #[serde(default = "default_fallback_duty")]
    pub fallback_duty: f64,

    /// Consecutive good reads needed to leave the faulted state.
    #[serde(default = "default_recovery_reads")]
    pub recovery_reads: u32,

    /// How long a stopped fan is driven at its min start duty, in milliseconds.
    #[serde(default = "default_kick_ms")]
    pub kick_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            lock_dir: DEFAULT_LOCK_DIR.to_string(),
            restore_on_exit: true,
            fallback_duty: default_fallback_duty(),
            recovery_reads: default_recovery_reads(),
            kick_ms: default_kick_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(DUTY_MIN..=DUTY_MAX).contains(&self.fallback_duty) {
            return Err(ConfigError::InvalidSetting {
                key: "daemon.fallback_duty",
                reason: format!("{} is outside 0-100%", self.fallback_duty),
            });
        }
        if self.recovery_reads == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "daemon.recovery_reads",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            daemon: DaemonConfig::default(),
            devices: BTreeMap::new(),
            fans: BTreeMap::new(),
        }
    }
}

impl Config {
    /// All profiles, ordered by PWM id.
    pub fn profiles(&self) -> Vec<FanProfile> {
        self.fans.values().cloned().collect()
    }

    /// Insert or replace the profile for `profile.pwm`.
    pub fn upsert_profile(&mut self, profile: FanProfile) {
        self.fans.insert(profile.pwm.clone(), profile);
    }

    pub fn with_profiles(mut self, profiles: Vec<FanProfile>) -> Self {
        for profile in profiles {
            self.upsert_profile(profile);
        }
        self
    }
}

/// A configuration that passed validation and may be activated.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveConfig {
    pub daemon: DaemonConfig,
    pub profiles: ProfileSet,
}

/// Validate daemon settings, device identity and every profile.
pub fn validate_config(config: &Config, hw: &dyn HardwareIo) -> Result<ActiveConfig, ConfigError> {
    if config.schema_version != SCHEMA_VERSION {
        return Err(ConfigError::SchemaVersion {
            found: config.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    config.daemon.validate()?;

    for (device, expected) in &config.devices {
        let found = hw.device_name(device);
        if found.as_deref() != Some(expected.as_str()) {
            return Err(ConfigError::DeviceMismatch {
                device: device.clone(),
                expected: expected.clone(),
                found,
            });
        }
    }

    let profiles = ProfileSet::validate(config.profiles(), hw)?;
    Ok(ActiveConfig {
        daemon: config.daemon.clone(),
        profiles,
    })
}

// ---------------------------------------------------------------------------
// Load / Save
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SchemaHeader {
    #[serde(default)]
    schema_version: u32,
}

/// Parse TOML text. The schema version is checked before the body so a
/// file from another version reports that rather than a field error.
pub fn parse_config(contents: &str, path: &Path) -> Result<Config, ConfigError> {
    let parse_err = |e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let header: SchemaHeader = toml::from_str(contents).map_err(parse_err)?;
    if header.schema_version != SCHEMA_VERSION {
        return Err(ConfigError::SchemaVersion {
            found: header.schema_version,
            expected: SCHEMA_VERSION,
        });
    }

    let mut config: Config = toml::from_str(contents).map_err(parse_err)?;
    for (pwm, profile) in config.fans.iter_mut() {
        profile.pwm = pwm.clone();
    }
    Ok(config)
}

/// Load config from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let config = parse_config(&contents, path)?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Load config, or return the default if the file doesn't exist.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    load_config(path)
}

/// Load and validate in one step. Nothing is returned unless every check
/// passed.
pub fn load_active(path: &Path, hw: &dyn HardwareIo) -> Result<ActiveConfig, ConfigError> {
    validate_config(&load_config(path)?, hw)
}

/// Save config to a TOML file, creating parent directories if needed.
/// Writes to a sibling temp file first so a crash never leaves a torn file.
pub fn save_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let io_err = |e: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let contents = toml::to_string_pretty(config).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: format!("failed to serialize config: {e}"),
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;

    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_lock_dir() -> String {
    DEFAULT_LOCK_DIR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_fallback_duty() -> f64 {
    DUTY_MAX
}

fn default_recovery_reads() -> u32 {
    3
}

fn default_kick_ms() -> u64 {
    2000
}

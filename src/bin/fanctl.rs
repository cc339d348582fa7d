// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fanctl: runs the fan control daemon, calibrates PWM channels, imports
//! legacy lm-sensors configurations and queries a running daemon.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hwmon_fancontrol::calibrate::{CalibrationReport, Calibrator, Confirm};
use hwmon_fancontrol::config;
use hwmon_fancontrol::curve::builtin_curve;
use hwmon_fancontrol::daemon::{self, DaemonContext};
use hwmon_fancontrol::error::{CalibrationError, ConfigError, Error, HardwareError, LockError};
use hwmon_fancontrol::hwmon::{HardwareIo, PwmRef, SensorRef, SysfsHardware};
use hwmon_fancontrol::legacy;
use hwmon_fancontrol::protocol::{Connection, Request, Response};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fanctl", about = "Linux hwmon fan control daemon and calibrator")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control daemon in the foreground.
    Run {
        /// Override the socket path.
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Validate a configuration file against the hardware.
    Validate { path: PathBuf },

    /// Import an lm-sensors fancontrol file into the configuration.
    Import {
        #[arg(default_value = legacy::LEGACY_CONFIG_PATH)]
        path: PathBuf,

        /// Overwrite an existing configuration.
        #[arg(long)]
        replace: bool,
    },

    /// Calibrate one PWM channel, e.g. "hwmon2/pwm1".
    Calibrate {
        pwm: String,

        /// Sensor to bind when writing a profile (repeatable).
        #[arg(short, long = "sensor")]
        sensors: Vec<String>,

        /// Built-in curve for the written profile.
        #[arg(long, default_value = "silent")]
        curve: String,

        /// Add the calibrated profile to the configuration.
        #[arg(short, long)]
        write: bool,
    },

    /// Show the state of a running daemon.
    Status {
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Ask a running daemon to reload its configuration.
    Reload {
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// List the fans and temperature sensors found under /sys/class/hwmon.
    List,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config_path = config::resolve_config_path(Some(&cli.config));

    match cli.command {
        Command::Run { socket } => run(&config_path, socket).await,
        Command::Validate { path } => validate(&path),
        Command::Import { path, replace } => import(&path, &config_path, replace),
        Command::Calibrate {
            pwm,
            sensors,
            curve,
            write,
        } => calibrate(&config_path, PwmRef::new(pwm), sensors, &curve, write).await,
        Command::Status { socket } => status(&config_path, socket),
        Command::Reload { socket } => reload(&config_path, socket),
        Command::List => list(),
    }
}

/// Map the typed error at the bottom of the chain to an exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<Error>() {
        return e.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    if err.downcast_ref::<HardwareError>().is_some() {
        return 3;
    }
    if let Some(e) = err.downcast_ref::<CalibrationError>() {
        return match e {
            CalibrationError::Failed { .. } => 4,
            CalibrationError::Hardware(_) => 3,
            CalibrationError::Lock(_) => 5,
            CalibrationError::Cancelled { .. } => 1,
        };
    }
    if err.downcast_ref::<LockError>().is_some() {
        return 5;
    }
    1
}

fn hardware() -> Arc<SysfsHardware> {
    Arc::new(SysfsHardware::default())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(config_path: &Path, socket: Option<PathBuf>) -> anyhow::Result<()> {
    let hw = hardware();
    let ctx = DaemonContext::load(config_path, hw)?;
    log::info!(
        "Loaded {} profile(s) from {}",
        ctx.active().profiles.len(),
        config_path.display()
    );
    daemon::run(ctx, socket).await?;
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let hw = hardware();
    let active = config::load_active(path, hw.as_ref())?;
    for profile in active.profiles.profiles() {
        println!(
            "{:<16} {:<12} sensors: {}",
            profile.pwm.as_str(),
            profile.name.as_deref().unwrap_or("-"),
            join(&profile.sensors)
        );
    }
    println!(
        "{}: OK, {} profile(s)",
        path.display(),
        active.profiles.len()
    );
    Ok(())
}

fn import(source: &Path, dest: &Path, replace: bool) -> anyhow::Result<()> {
    let mut cfg = legacy::import_legacy(source)?;
    if let Ok(existing) = config::load_config(dest) {
        // Keep daemon settings the operator already chose.
        cfg.daemon = existing.daemon;
    }

    let hw = hardware();
    config::validate_config(&cfg, hw.as_ref())
        .with_context(|| format!("imported configuration from {} is invalid", source.display()))?;
    legacy::install(&cfg, dest, replace)?;
    println!(
        "Imported {} profile(s) into {}",
        cfg.fans.len(),
        dest.display()
    );
    Ok(())
}

async fn calibrate(
    config_path: &Path,
    pwm: PwmRef,
    sensors: Vec<String>,
    curve_name: &str,
    write: bool,
) -> anyhow::Result<()> {
    let curve = builtin_curve(curve_name).with_context(|| {
        format!("unknown curve '{curve_name}', expected 'silent' or 'performance'")
    })?;
    if write && sensors.is_empty() {
        anyhow::bail!("--write needs at least one --sensor");
    }

    let cfg = config::load_or_default(config_path)?;
    let hw = hardware();
    if !hw.has_pwm(&pwm) {
        return Err(ConfigError::UnresolvedPwm {
            pwm: pwm.to_string(),
        }
        .into());
    }

    let token = daemon::cancel_on_signals(&[
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::hangup(),
        SignalKind::quit(),
    ])?;

    eprintln!(
        "WARNING: {pwm} will be taken over and driven from 0% to 100%. \
         Press Ctrl-C to abort; the channel is restored either way."
    );
    let calibrator = Calibrator::new(hw.clone(), &cfg.daemon.lock_dir)
        .with_confirm(Box::new(StdinConfirm));
    let report = calibrator.calibrate(&pwm, &token).await?;
    print_report(&report);

    if write {
        let sensors = sensors.into_iter().map(SensorRef::new).collect();
        let profile = report.into_profile(sensors, curve);
        let mut updated = cfg.clone();
        updated.upsert_profile(profile);
        config::validate_config(&updated, hw.as_ref())?;
        config::save_config(config_path, &updated)?;
        println!("Wrote profile for {pwm} to {}", config_path.display());
    }
    Ok(())
}

fn status(config_path: &Path, socket: Option<PathBuf>) -> anyhow::Result<()> {
    let socket = socket_path(config_path, socket);
    let mut conn = Connection::connect(&socket)
        .with_context(|| format!("could not connect to daemon at {}", socket.display()))?;

    match conn.send_request(&Request::GetStatus)? {
        Response::Status { profiles } => {
            println!(
                "{:<16} {:<12} {:<9} {:>7} {:>6}  FAULT",
                "PWM", "NAME", "STATE", "TEMP", "DUTY"
            );
            for p in profiles {
                println!(
                    "{:<16} {:<12} {:<9} {:>7} {:>6}  {}",
                    p.pwm.as_str(),
                    p.name.as_deref().unwrap_or("-"),
                    p.state.to_string(),
                    p.temp_c.map_or("-".to_string(), |t| format!("{t:.1}C")),
                    p.duty.map_or("-".to_string(), |d| format!("{d:.0}%")),
                    p.fault.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Response::Error { message } => anyhow::bail!("daemon error: {message}"),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

fn reload(config_path: &Path, socket: Option<PathBuf>) -> anyhow::Result<()> {
    let socket = socket_path(config_path, socket);
    let mut conn = Connection::connect(&socket)
        .with_context(|| format!("could not connect to daemon at {}", socket.display()))?;

    match conn.send_request(&Request::Reload)? {
        Response::Ok { message } => {
            println!("{message}");
            Ok(())
        }
        Response::Error { message } => anyhow::bail!("{message}"),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

fn list() -> anyhow::Result<()> {
    let hw = SysfsHardware::default();

    println!("Fans:");
    for fan in hw.discover_fans()? {
        println!(
            "  {:<16} {:<12} {:<16} {}",
            fan.pwm.as_str(),
            fan.hwmon_name,
            fan.label.as_deref().unwrap_or("-"),
            if fan.has_tach { "tach" } else { "no tach" }
        );
    }

    println!("Temperature sensors:");
    for sensor in hw.discover_temp_sensors()? {
        let reading = hw
            .read_sensor(&sensor.sensor)
            .map_or("?".to_string(), |t| format!("{t:.1}C"));
        println!(
            "  {:<16} {:<12} {:<16} {reading}",
            sensor.sensor.as_str(),
            sensor.hwmon_name,
            sensor.label.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Operator confirmation on stdin, for fans without a tachometer.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn is_spinning(&self, pwm: &PwmRef, duty: f64) -> bool {
        eprint!("Is the fan on {pwm} spinning at {duty:.0}%? [y/N] ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

fn print_report(report: &CalibrationReport) {
    println!("Calibration of {}", report.pwm);
    println!("  min start: {:.0}%", report.min_start);
    println!("  stop:      {:.0}%", report.stop);
    if let Some(rpm) = report.max_rpm {
        println!("  max speed: {rpm} RPM");
    }
    for point in &report.response {
        println!("  {:>5.0}% {:>6} RPM", point.duty, point.rpm);
    }
}

fn socket_path(config_path: &Path, socket: Option<PathBuf>) -> PathBuf {
    socket.unwrap_or_else(|| {
        let cfg = config::load_or_default(config_path).unwrap_or_else(|e| {
            log::warn!("Could not load config: {e}, using defaults");
            config::Config::default()
        });
        PathBuf::from(cfg.daemon.socket_path)
    })
}

fn join(sensors: &[SensorRef]) -> String {
    sensors
        .iter()
        .map(SensorRef::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! PWM channel calibration.
//!
//! Drives one channel through its range while watching the paired
//! tachometer (or asking a [`Confirm`] collaborator when there is none) to
//! find the duty that gets a stopped fan spinning and the duty at which a
//! spinning fan stops.
//!
//! The channel is locked and put under a [`ManualOverride`] for the whole
//! run, so its original mode and duty come back however the run ends.

use crate::control::ManualOverride;
use crate::curve::{Curve, DUTY_MAX, DUTY_MIN};
use crate::error::CalibrationError;
use crate::hwmon::{HardwareIo, PwmRef, SensorRef};
use crate::lock::ChannelLock;
use crate::profile::FanProfile;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Asks whoever can see the fan whether it is spinning. Used for channels
/// without a tachometer.
///
/// Each question runs on its own thread and may block, e.g. on stdin.
pub trait Confirm: Send + Sync {
    fn is_spinning(&self, pwm: &PwmRef, duty: f64) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSettings {
    /// Ramp step in percent
    pub step: f64,
    /// Wait after each duty change
    pub settle: Duration,
    /// How long a fan commanded to 0% may take to report 0 RPM
    pub stop_timeout: Duration,
    /// Tachometer poll period while waiting for a stop
    pub poll: Duration,
    /// Safety margin added to the measured duties, in percent
    pub margin: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            step: 5.0,
            settle: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(20),
            poll: Duration::from_millis(500),
            margin: 5.0,
        }
    }
}

/// Fan speed observed at one duty on the way up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponsePoint {
    pub duty: f64,
    pub rpm: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub pwm: PwmRef,
    /// Whether a tachometer was paired and followed the channel
    pub has_tach: bool,
    /// Duty that starts a stopped fan, margin included
    pub min_start: f64,
    /// Duty at which a spinning fan stops, margin included
    pub stop: f64,
    /// Highest speed seen, if there is a tachometer
    pub max_rpm: Option<u32>,
    /// (duty, rpm) from `min_start` up to 100%, empty without a tachometer
    pub response: Vec<ResponsePoint>,
}

impl CalibrationReport {
    /// A profile skeleton for this channel, driven by `sensors` along `curve`.
    pub fn into_profile(self, sensors: Vec<SensorRef>, curve: Curve) -> FanProfile {
        let mut profile = FanProfile::new(self.pwm, sensors, curve);
        profile.min_start = self.min_start;
        profile.stop = self.stop;
        profile
    }
}

pub struct Calibrator {
    hw: Arc<dyn HardwareIo>,
    lock_dir: PathBuf,
    settings: CalibrationSettings,
    confirm: Option<Arc<dyn Confirm>>,
}

impl Calibrator {
    pub fn new(hw: Arc<dyn HardwareIo>, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            hw,
            lock_dir: lock_dir.into(),
            settings: CalibrationSettings::default(),
            confirm: None,
        }
    }

    pub fn with_settings(mut self, settings: CalibrationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_confirm(mut self, confirm: Box<dyn Confirm>) -> Self {
        self.confirm = Some(Arc::from(confirm));
        self
    }

    /// Calibrate `pwm`. Cancelling `token` aborts any settle wait or pending
    /// confirmation.
    pub async fn calibrate(
        &self,
        pwm: &PwmRef,
        token: &CancellationToken,
    ) -> Result<CalibrationReport, CalibrationError> {
        let _lock = ChannelLock::acquire(&self.lock_dir, pwm)?;

        let has_tach = match self.hw.read_tach(pwm) {
            Ok(_) => true,
            Err(e) if e.is_unsupported() => false,
            Err(e) => return Err(e.into()),
        };
        if !has_tach && self.confirm.is_none() {
            return Err(self.failed(pwm, "no tachometer and nobody to confirm the fan is spinning"));
        }

        let _guard = ManualOverride::engage(self.hw.clone(), pwm)?;
        log::info!(
            "Calibrating {pwm} ({})",
            if has_tach { "tachometer" } else { "manual confirmation" }
        );

        // Stop
        self.hw.write_duty(pwm, DUTY_MIN)?;
        self.settle(pwm, token).await?;
        if has_tach {
            self.wait_for_stop(pwm, token).await?;
        }

        // Ramp up until it spins
        let step = self.settings.step;
        let mut min_start = None;
        for duty in ramp_up(DUTY_MIN + step, DUTY_MAX, step) {
            self.hw.write_duty(pwm, duty)?;
            self.settle(pwm, token).await?;
            if self.spinning(pwm, duty, has_tach, token).await? {
                log::info!("{pwm}: started at {duty:.0}%");
                min_start = Some(duty);
                break;
            }
        }
        let Some(min_start) = min_start else {
            return Err(self.failed(pwm, "fan did not respond"));
        };

        // Response curve, for the record
        let mut response = Vec::new();
        if has_tach {
            for duty in std::iter::once(min_start).chain(ramp_up(min_start + step, DUTY_MAX, step)) {
                self.hw.write_duty(pwm, duty)?;
                self.settle(pwm, token).await?;
                let rpm = self.hw.read_tach(pwm)?;
                log::debug!("{pwm}: {duty:.0}% -> {rpm} RPM");
                response.push(ResponsePoint { duty, rpm });
            }
        }

        // Ramp down from min start until it stops
        self.hw.write_duty(pwm, min_start)?;
        self.settle(pwm, token).await?;
        let mut stop = DUTY_MIN;
        for duty in ramp_down(min_start - step, DUTY_MIN, step) {
            self.hw.write_duty(pwm, duty)?;
            self.settle(pwm, token).await?;
            if !self.spinning(pwm, duty, has_tach, token).await? {
                stop = duty;
                break;
            }
        }
        log::info!("{pwm}: stopped at {stop:.0}%");

        let margin = self.settings.margin;
        let min_start = (min_start + margin).clamp(DUTY_MIN, DUTY_MAX);
        let stop = (stop + margin).clamp(DUTY_MIN, min_start);

        Ok(CalibrationReport {
            pwm: pwm.clone(),
            has_tach,
            min_start,
            stop,
            max_rpm: response.iter().map(|p| p.rpm).max(),
            response,
        })
    }

    async fn spinning(
        &self,
        pwm: &PwmRef,
        duty: f64,
        has_tach: bool,
        token: &CancellationToken,
    ) -> Result<bool, CalibrationError> {
        if has_tach {
            return Ok(self.hw.read_tach(pwm)? > 0);
        }
        let Some(confirm) = self.confirm.clone() else {
            return Ok(false);
        };

        // A plain thread: an answer blocked on stdin must not hold up
        // cancellation or runtime shutdown.
        let (tx, rx) = oneshot::channel();
        let asked = pwm.clone();
        std::thread::spawn(move || {
            let _ = tx.send(confirm.is_spinning(&asked, duty));
        });

        tokio::select! {
            _ = token.cancelled() => Err(self.cancelled(pwm)),
            answer = rx => Ok(answer.unwrap_or(false)),
        }
    }

    async fn settle(&self, pwm: &PwmRef, token: &CancellationToken) -> Result<(), CalibrationError> {
        self.sleep(pwm, token, self.settings.settle).await
    }

    async fn sleep(
        &self,
        pwm: &PwmRef,
        token: &CancellationToken,
        period: Duration,
    ) -> Result<(), CalibrationError> {
        tokio::select! {
            _ = token.cancelled() => Err(self.cancelled(pwm)),
            _ = time::sleep(period) => Ok(()),
        }
    }

    /// A channel that does not stop its fan at 0% probably is not wired to
    /// the tachometer it is paired with.
    async fn wait_for_stop(&self, pwm: &PwmRef, token: &CancellationToken) -> Result<(), CalibrationError> {
        let deadline = Instant::now() + self.settings.stop_timeout;
        loop {
            if self.hw.read_tach(pwm)? == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.failed(
                    pwm,
                    "fan never stopped, the channel may not control this fan",
                ));
            }
            self.sleep(pwm, token, self.settings.poll).await?;
        }
    }

    fn cancelled(&self, pwm: &PwmRef) -> CalibrationError {
        log::warn!("{pwm}: calibration cancelled");
        CalibrationError::Cancelled {
            pwm: pwm.to_string(),
        }
    }

    fn failed(&self, pwm: &PwmRef, reason: &str) -> CalibrationError {
        CalibrationError::Failed {
            pwm: pwm.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// `from`, `from + step`, ... up to and including `to`. The last step is cut
/// short so `to` is always visited.
fn ramp_up(from: f64, to: f64, step: f64) -> Vec<f64> {
    let mut duties = Vec::new();
    if step <= 0.0 || from > to {
        return duties;
    }
    let mut duty = from;
    while duty < to {
        duties.push(duty);
        duty += step;
    }
    duties.push(to);
    duties
}

/// Like [`ramp_up`], counting down.
fn ramp_down(from: f64, to: f64, step: f64) -> Vec<f64> {
    let mut duties = Vec::new();
    if step <= 0.0 || from < to {
        return duties;
    }
    let mut duty = from;
    while duty > to {
        duties.push(duty);
        duty -= step;
    }
    duties.push(to);
    duties
}

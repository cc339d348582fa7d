// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The control loop: one task per fan profile, polling sensors, evaluating
//! the curve and writing the PWM output.
//!
//! Each profile owns its channel exclusively for the lifetime of its task
//! (a [`ChannelLock`] plus a [`ManualOverride`]). A sensor or PWM failure
//! drives that one fan to the fallback duty while the other profiles keep
//! running.

use crate::config::{ActiveConfig, DaemonConfig};
use crate::curve::{DUTY_EPSILON, DUTY_MAX, Evaluation, evaluate};
use crate::error::{Error, HardwareError};
use crate::hwmon::{HardwareIo, PwmMode, PwmRef};
use crate::lock::ChannelLock;
use crate::profile::FanProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ---------------------------------------------------------------------------
// Manual override guard
// ---------------------------------------------------------------------------

/// Switches a channel to manual mode and restores its original mode and
/// duty when dropped.
///
/// Restoration runs on every exit path of the owner: normal return, error,
/// task cancellation and panic unwinding.
pub struct ManualOverride {
    hw: Arc<dyn HardwareIo>,
    pwm: PwmRef,
    original_mode: PwmMode,
    original_duty: f64,
    armed: bool,
}

impl ManualOverride {
    pub fn engage(hw: Arc<dyn HardwareIo>, pwm: &PwmRef) -> Result<Self, HardwareError> {
        let original_mode = hw.read_pwm_mode(pwm)?;
        let original_duty = hw.read_duty(pwm)?;
        hw.write_pwm_mode(pwm, PwmMode::Manual)?;
        log::debug!("{pwm}: manual control (was {original_mode}, {original_duty:.0}%)");
        Ok(Self {
            hw,
            pwm: pwm.clone(),
            original_mode,
            original_duty,
            armed: true,
        })
    }

    /// Leave the channel as it is instead of restoring it.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for ManualOverride {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Duty first: the write only sticks while the channel is manual.
        if let Err(e) = self.hw.write_duty(&self.pwm, self.original_duty) {
            log::error!("{}: failed to restore duty: {e}", self.pwm);
        }
        match self.hw.write_pwm_mode(&self.pwm, self.original_mode) {
            Ok(()) => log::info!("{}: restored {} control", self.pwm, self.original_mode),
            Err(e) => {
                // Still manual: a fan left at a low duty must not stay there.
                log::error!("{}: failed to restore mode: {e}, leaving fan at full speed", self.pwm);
                if let Err(e) = self.hw.write_duty(&self.pwm, DUTY_MAX) {
                    log::error!("{}: failed to write full duty: {e}", self.pwm);
                }
            }
        }
    }
}

impl fmt::Debug for ManualOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualOverride")
            .field("pwm", &self.pwm)
            .field("original_mode", &self.original_mode)
            .field("original_duty", &self.original_duty)
            .field("armed", &self.armed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-profile state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileState {
    Idle,
    /// `starting` while a stopped fan is being kicked at its min start duty.
    Running { starting: bool },
    Faulted,
}

impl fmt::Display for ProfileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileState::Idle => write!(f, "idle"),
            ProfileState::Running { starting: true } => write!(f, "starting"),
            ProfileState::Running { starting: false } => write!(f, "running"),
            ProfileState::Faulted => write!(f, "faulted"),
        }
    }
}

/// Snapshot of one profile, as reported over the status socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStatus {
    pub pwm: PwmRef,
    pub name: Option<String>,
    pub state: ProfileState,
    /// Last reduced temperature in degrees Celsius
    pub temp_c: Option<f64>,
    /// Last commanded duty in percent
    pub duty: Option<f64>,
    pub fault: Option<String>,
}

/// Engine-wide settings shared by all profiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSettings {
    pub fallback_duty: f64,
    pub recovery_reads: u32,
    pub kick: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self::from(&DaemonConfig::default())
    }
}

impl From<&DaemonConfig> for ControlSettings {
    fn from(daemon: &DaemonConfig) -> Self {
        Self {
            fallback_duty: daemon.fallback_duty,
            recovery_reads: daemon.recovery_reads.max(1),
            kick: Duration::from_millis(daemon.kick_ms),
        }
    }
}

/// Drives one profile, one tick at a time. Holds no hardware handle so it
/// can be stepped directly in tests.
#[derive(Debug)]
pub struct ProfileController {
    profile: FanProfile,
    settings: ControlSettings,
    state: ProfileState,
    previous: Option<Evaluation>,
    commanded: Option<f64>,
    kick_until: Option<Instant>,
    good_reads: u32,
    last_temp: Option<f64>,
    fault: Option<String>,
}

impl ProfileController {
    pub fn new(profile: FanProfile, settings: ControlSettings) -> Self {
        Self {
            profile,
            settings,
            state: ProfileState::Idle,
            previous: None,
            commanded: None,
            kick_until: None,
            good_reads: 0,
            last_temp: None,
            fault: None,
        }
    }

    pub fn profile(&self) -> &FanProfile {
        &self.profile
    }

    pub fn state(&self) -> ProfileState {
        self.state
    }

    pub fn status(&self) -> ProfileStatus {
        ProfileStatus {
            pwm: self.profile.pwm.clone(),
            name: self.profile.name.clone(),
            state: self.state,
            temp_c: self.last_temp,
            duty: self.commanded,
            fault: self.fault.clone(),
        }
    }

    /// Read, evaluate, write.
    pub fn tick(&mut self, hw: &dyn HardwareIo, now: Instant) {
        let temp = match self.read_temperature(hw) {
            Ok(temp) => temp,
            Err(e) => {
                self.enter_fault(hw, e);
                return;
            }
        };
        self.last_temp = Some(temp);

        if self.state == ProfileState::Faulted {
            self.good_reads += 1;
            if self.good_reads < self.settings.recovery_reads {
                log::debug!(
                    "{}: good read {}/{} while faulted",
                    self.profile.title(),
                    self.good_reads,
                    self.settings.recovery_reads
                );
                self.command_fallback(hw);
                return;
            }
            log::info!("{}: sensors recovered, resuming curve", self.profile.title());
            self.previous = None;
            self.good_reads = 0;
            self.fault = None;
        }

        let eval = evaluate(
            &self.profile.curve,
            temp,
            self.previous,
            self.profile.hysteresis,
        );
        self.previous = Some(eval);

        let target = self.apply_ramp(self.apply_stop(eval.duty));
        self.check_stall(hw, now);
        let duty = self.apply_kick(target, now);

        if let Err(e) = hw.write_duty(&self.profile.pwm, duty) {
            self.enter_fault(hw, e);
            return;
        }
        log::debug!("{}: {temp:.1}C -> {duty:.1}%", self.profile.title());

        if self.state == ProfileState::Idle {
            log::info!("{}: running", self.profile.title());
        }
        self.state = ProfileState::Running {
            starting: self.kick_until.is_some(),
        };
        self.commanded = Some(duty);
    }

    fn read_temperature(&self, hw: &dyn HardwareIo) -> Result<f64, HardwareError> {
        let readings = self
            .profile
            .sensors
            .iter()
            .map(|s| {
                let temp = hw.read_sensor(s)?;
                if temp.is_finite() {
                    Ok(temp)
                } else {
                    Err(HardwareError::read(s.as_str(), format!("invalid reading {temp}")))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.profile
            .reduction
            .reduce(&readings)
            .ok_or_else(|| HardwareError::read(self.profile.pwm.as_str(), "no sensors bound"))
    }

    /// A running fan below its stop duty would stall, so stop it outright.
    fn apply_stop(&self, target: f64) -> f64 {
        if target > DUTY_EPSILON && target < self.profile.stop {
            0.0
        } else {
            target
        }
    }

    /// Limit the change from the last commanded duty to `max_step`. Starting
    /// and stopping are not limited.
    fn apply_ramp(&self, target: f64) -> f64 {
        let (Some(step), Some(current)) = (self.profile.max_step, self.commanded) else {
            return target;
        };
        if target <= DUTY_EPSILON || current <= DUTY_EPSILON {
            return target;
        }
        target.max(current - step).min(current + step)
    }

    /// A fan reading 0 RPM under a running duty has stalled. Kick it again.
    fn check_stall(&mut self, hw: &dyn HardwareIo, now: Instant) {
        if self.kick_until.is_some() {
            return;
        }
        let Some(current) = self.commanded else {
            return;
        };
        if current <= DUTY_EPSILON || current < self.profile.stop {
            return;
        }
        match hw.read_tach(&self.profile.pwm) {
            Ok(0) => {
                log::warn!("{}: fan stalled at {current:.0}%, restarting", self.profile.title());
                self.kick_until = Some(now + self.settings.kick);
            }
            Ok(_) => {}
            Err(e) if e.is_unsupported() => {}
            Err(e) => log::debug!("{}: tachometer unreadable: {e}", self.profile.title()),
        }
    }

    fn apply_kick(&mut self, target: f64, now: Instant) -> f64 {
        if target <= DUTY_EPSILON {
            self.kick_until = None;
            return 0.0;
        }

        let stopped = self.commanded.is_none_or(|d| d <= DUTY_EPSILON);
        if stopped && self.kick_until.is_none() {
            self.kick_until = Some(now + self.settings.kick);
        }

        match self.kick_until {
            Some(until) if now < until => target.max(self.profile.min_start),
            _ => {
                self.kick_until = None;
                target
            }
        }
    }

    fn enter_fault(&mut self, hw: &dyn HardwareIo, err: HardwareError) {
        if self.state != ProfileState::Faulted {
            log::warn!(
                "{}: {err}, driving fan at {:.0}%",
                self.profile.title(),
                self.settings.fallback_duty
            );
        }
        self.state = ProfileState::Faulted;
        self.fault = Some(err.to_string());
        self.good_reads = 0;
        self.kick_until = None;
        self.command_fallback(hw);
    }

    fn command_fallback(&mut self, hw: &dyn HardwareIo) {
        let duty = self.settings.fallback_duty;
        match hw.write_duty(&self.profile.pwm, duty) {
            Ok(()) => self.commanded = Some(duty),
            Err(e) => log::error!("{}: failed to write fallback duty: {e}", self.profile.title()),
        }
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

/// Latest status of every running profile, keyed by PWM id.
pub type StatusBoard = Arc<Mutex<BTreeMap<PwmRef, ProfileStatus>>>;

/// The running set of profile tasks.
#[derive(Debug)]
pub struct ControlLoop {
    token: CancellationToken,
    tracker: TaskTracker,
    status: StatusBoard,
}

impl ControlLoop {
    /// Claim every channel and spawn one task per profile.
    ///
    /// All channels are claimed before any task starts. If one cannot be
    /// locked or switched to manual, the ones already claimed are released
    /// and restored and nothing runs.
    pub fn start(active: &ActiveConfig, hw: Arc<dyn HardwareIo>) -> Result<Self, Error> {
        let settings = ControlSettings::from(&active.daemon);
        let lock_dir = Path::new(&active.daemon.lock_dir);

        let mut claimed = Vec::with_capacity(active.profiles.len());
        for profile in active.profiles.profiles() {
            let lock = ChannelLock::acquire(lock_dir, &profile.pwm)?;
            let guard = ManualOverride::engage(hw.clone(), &profile.pwm)?;
            // Dropped in order on a later failure: restore, then unlock.
            claimed.push((profile.clone(), guard, lock));
        }

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let status: StatusBoard = Arc::new(Mutex::new(BTreeMap::new()));

        for (profile, guard, lock) in claimed {
            let controller = ProfileController::new(profile, settings);
            let task = ProfileTask {
                controller,
                hw: hw.clone(),
                status: status.clone(),
                restore: active.daemon.restore_on_exit,
                _lock: lock,
                guard,
            };
            tracker.spawn(task.run(token.clone()));
        }

        log::info!("Control loop started with {} profile(s)", active.profiles.len());
        Ok(Self {
            token,
            tracker,
            status,
        })
    }

    pub async fn snapshot(&self) -> Vec<ProfileStatus> {
        self.status.lock().await.values().cloned().collect()
    }

    /// Cancel every task and wait until all channels are released.
    pub async fn stop(self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        log::info!("Control loop stopped");
    }
}

struct ProfileTask {
    controller: ProfileController,
    hw: Arc<dyn HardwareIo>,
    status: StatusBoard,
    restore: bool,
    // Field order matters: the override restores the channel before the
    // lock is released.
    guard: ManualOverride,
    _lock: ChannelLock,
}

impl ProfileTask {
    async fn run(mut self, token: CancellationToken) {
        let pwm = self.controller.profile().pwm.clone();
        let period = Duration::from_millis(self.controller.profile().poll_interval_ms);
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.status
            .lock()
            .await
            .insert(pwm.clone(), self.controller.status());

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.controller.tick(self.hw.as_ref(), Instant::now());
                    self.status
                        .lock()
                        .await
                        .insert(pwm.clone(), self.controller.status());
                }
            }
        }

        self.status.lock().await.remove(&pwm);
        if !self.restore {
            log::info!("{pwm}: leaving fan under manual control");
            self.guard.keep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, validate_config};
    use crate::curve::{Curve, CurvePoint};
    use crate::hwmon::SensorRef;
    use crate::testutil::MockHardware;
    use tempfile::TempDir;

    const PWM: &str = "hwmon2/pwm1";
    const TEMP: &str = "hwmon1/temp1";

    fn profile() -> FanProfile {
        let mut p = FanProfile::new(
            PwmRef::new(PWM),
            vec![SensorRef::new(TEMP)],
            Curve::new(vec![
                CurvePoint::new(40.0, 20.0),
                CurvePoint::new(60.0, 60.0),
                CurvePoint::new(80.0, 100.0),
            ]),
        );
        p.min_start = 35.0;
        p.stop = 15.0;
        p.hysteresis = 5.0;
        p
    }

    fn settings() -> ControlSettings {
        ControlSettings {
            fallback_duty: 100.0,
            recovery_reads: 3,
            kick: Duration::from_secs(2),
        }
    }

    fn mock() -> MockHardware {
        MockHardware::new()
            .with_sensor(TEMP, 50.0)
            .with_pwm(PWM, PwmMode::Manual)
    }

    fn last_write(hw: &MockHardware) -> f64 {
        *hw.writes(PWM).last().unwrap()
    }

    #[test]
    fn test_first_tick_runs_curve() {
        let hw = mock();
        let mut c = ProfileController::new(profile(), settings());
        assert_eq!(c.state(), ProfileState::Idle);

        c.tick(&hw, Instant::now());
        assert_eq!(last_write(&hw), 40.0);
        assert!(matches!(c.state(), ProfileState::Running { .. }));
        assert_eq!(c.status().temp_c, Some(50.0));
    }

    #[test]
    fn test_fault_commands_fallback_and_recovers_on_nth_read() {
        let hw = mock();
        let mut c = ProfileController::new(profile(), settings());
        let t0 = Instant::now();
        c.tick(&hw, t0);

        hw.fail_reads(TEMP, 1);
        c.tick(&hw, t0 + Duration::from_secs(2));
        assert_eq!(c.state(), ProfileState::Faulted);
        assert_eq!(last_write(&hw), 100.0);
        assert!(c.status().fault.unwrap().contains("simulated failure"));

        c.tick(&hw, t0 + Duration::from_secs(4));
        assert_eq!(c.state(), ProfileState::Faulted);
        c.tick(&hw, t0 + Duration::from_secs(6));
        assert_eq!(c.state(), ProfileState::Faulted);
        assert_eq!(last_write(&hw), 100.0);

        c.tick(&hw, t0 + Duration::from_secs(8));
        assert_eq!(c.state(), ProfileState::Running { starting: false });
        assert_eq!(last_write(&hw), 40.0);
        assert_eq!(c.status().fault, None);
    }

    #[test]
    fn test_failure_during_recovery_resets_count() {
        let hw = mock();
        let mut c = ProfileController::new(profile(), settings());
        let t0 = Instant::now();

        hw.fail_reads(TEMP, 1);
        c.tick(&hw, t0);
        c.tick(&hw, t0);
        c.tick(&hw, t0);
        hw.fail_reads(TEMP, 1);
        c.tick(&hw, t0);
        c.tick(&hw, t0);
        c.tick(&hw, t0);
        assert_eq!(c.state(), ProfileState::Faulted);
        c.tick(&hw, t0);
        assert!(matches!(c.state(), ProfileState::Running { .. }));
    }

    #[test]
    fn test_write_failure_faults() {
        let hw = mock();
        let mut c = ProfileController::new(profile(), settings());
        hw.fail_writes(PWM, 1);
        c.tick(&hw, Instant::now());
        assert_eq!(c.state(), ProfileState::Faulted);
        assert_eq!(hw.duty(PWM), 100.0);
    }

    #[test]
    fn test_stopped_fan_is_kicked() {
        let hw = mock();
        let mut p = profile();
        p.curve = Curve::new(vec![CurvePoint::new(40.0, 0.0), CurvePoint::new(60.0, 40.0)]);
        let mut c = ProfileController::new(p, settings());
        let t0 = Instant::now();

        hw.set_temp(TEMP, 30.0);
        c.tick(&hw, t0);
        assert_eq!(last_write(&hw), 0.0);

        // 50C -> 20%, below min start: kick at 35% first
        hw.set_temp(TEMP, 50.0);
        c.tick(&hw, t0 + Duration::from_secs(1));
        assert_eq!(last_write(&hw), 35.0);
        assert_eq!(c.state(), ProfileState::Running { starting: true });

        c.tick(&hw, t0 + Duration::from_millis(2500));
        assert_eq!(last_write(&hw), 35.0);
        assert!(c.state() == ProfileState::Running { starting: true });

        c.tick(&hw, t0 + Duration::from_secs(4));
        assert_eq!(last_write(&hw), 20.0);
        assert_eq!(c.state(), ProfileState::Running { starting: false });
    }

    #[test]
    fn test_target_below_stop_stops_fan() {
        let hw = mock();
        let mut p = profile();
        p.curve = Curve::new(vec![CurvePoint::new(40.0, 10.0), CurvePoint::new(60.0, 50.0)]);
        p.hysteresis = 0.0;
        let mut c = ProfileController::new(p, settings());
        let t0 = Instant::now();

        hw.set_temp(TEMP, 60.0);
        c.tick(&hw, t0);
        assert_eq!(last_write(&hw), 50.0);

        // 42C -> 14%, below the 15% stop duty
        hw.set_temp(TEMP, 42.0);
        c.tick(&hw, t0 + Duration::from_secs(2));
        assert_eq!(last_write(&hw), 0.0);
    }

    #[test]
    fn test_hysteresis_holds_duty() {
        let hw = mock();
        let mut c = ProfileController::new(profile(), settings());
        let t0 = Instant::now();

        hw.set_temp(TEMP, 65.0);
        c.tick(&hw, t0);
        assert_eq!(last_write(&hw), 70.0);

        hw.set_temp(TEMP, 62.0);
        c.tick(&hw, t0 + Duration::from_secs(2));
        assert_eq!(last_write(&hw), 70.0);

        hw.set_temp(TEMP, 58.0);
        c.tick(&hw, t0 + Duration::from_secs(4));
        assert!((last_write(&hw) - 56.0).abs() < 0.1);
    }

    #[test]
    fn test_slow_fall_holds_commanded_duty() {
        let hw = mock();
        let mut c = ProfileController::new(profile(), settings());
        let t0 = Instant::now();

        hw.set_temp(TEMP, 70.0);
        c.tick(&hw, t0);
        assert_eq!(last_write(&hw), 80.0);

        let mut temp = 70.0;
        while temp > 65.2 {
            temp -= 0.02;
            hw.set_temp(TEMP, temp);
            c.tick(&hw, t0);
            assert_eq!(last_write(&hw), 80.0, "dropped at {temp:.2}C");
        }
    }

    #[test]
    fn test_average_reduction() {
        let hw = mock().with_sensor("hwmon1/temp2", 70.0);
        let mut p = profile();
        p.sensors.push(SensorRef::new("hwmon1/temp2"));
        p.reduction = crate::profile::Reduction::Average;
        let mut c = ProfileController::new(p, settings());

        // (50 + 70) / 2 = 60C -> 60%
        c.tick(&hw, Instant::now());
        assert_eq!(c.status().temp_c, Some(60.0));
        assert_eq!(last_write(&hw), 60.0);
    }

    #[test]
    fn test_nan_reading_faults() {
        let hw = mock().with_sensor("hwmon1/temp2", f64::NAN);
        let mut p = profile();
        p.sensors.push(SensorRef::new("hwmon1/temp2"));
        let mut c = ProfileController::new(p, settings());
        let t0 = Instant::now();

        c.tick(&hw, t0);
        assert_eq!(c.state(), ProfileState::Faulted);
        assert_eq!(last_write(&hw), 100.0);
        assert!(c.status().fault.unwrap().contains("hwmon1/temp2"));

        hw.set_temp("hwmon1/temp2", 45.0);
        for _ in 0..3 {
            c.tick(&hw, t0);
        }
        assert!(matches!(c.state(), ProfileState::Running { .. }));
        assert_eq!(last_write(&hw), 40.0);
    }

    #[test]
    fn test_stalled_fan_is_kicked_again() {
        let hw = mock().with_fan(PWM, 30.0, 12.0);
        let mut c = ProfileController::new(profile(), settings());
        let t0 = Instant::now();

        // 42C -> 24%, under the 35% min start
        hw.set_temp(TEMP, 42.0);
        c.tick(&hw, t0);
        assert_eq!(last_write(&hw), 35.0);
        c.tick(&hw, t0 + Duration::from_secs(3));
        assert!((last_write(&hw) - 24.0).abs() < 1e-9);
        assert_eq!(c.state(), ProfileState::Running { starting: false });
        assert!(hw.read_tach(&PwmRef::new(PWM)).unwrap() > 0);

        hw.stall_fan(PWM);
        c.tick(&hw, t0 + Duration::from_secs(5));
        assert_eq!(last_write(&hw), 35.0);
        assert_eq!(c.state(), ProfileState::Running { starting: true });
        assert!(hw.read_tach(&PwmRef::new(PWM)).unwrap() > 0);

        c.tick(&hw, t0 + Duration::from_secs(8));
        assert!((last_write(&hw) - 24.0).abs() < 1e-9);
        assert_eq!(c.state(), ProfileState::Running { starting: false });
    }

    #[test]
    fn test_max_step_limits_change_per_tick() {
        let hw = mock();
        let mut p = profile();
        p.max_step = Some(10.0);
        p.hysteresis = 0.0;
        let mut c = ProfileController::new(p, settings());
        let t0 = Instant::now();

        c.tick(&hw, t0);
        assert_eq!(last_write(&hw), 40.0);

        // 80C -> 100%, reached in steps of 10
        hw.set_temp(TEMP, 80.0);
        for expected in [50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 100.0] {
            c.tick(&hw, t0);
            assert_eq!(last_write(&hw), expected);
        }

        hw.set_temp(TEMP, 65.0);
        c.tick(&hw, t0);
        assert_eq!(last_write(&hw), 90.0);

        // stopping is never delayed
        let mut stop = profile();
        stop.curve = Curve::new(vec![CurvePoint::new(40.0, 0.0), CurvePoint::new(80.0, 100.0)]);
        stop.max_step = Some(10.0);
        let mut c = ProfileController::new(stop, settings());
        hw.set_temp(TEMP, 80.0);
        c.tick(&hw, t0);
        hw.set_temp(TEMP, 20.0);
        c.tick(&hw, t0);
        assert_eq!(last_write(&hw), 0.0);
    }

    #[test]
    fn test_failed_mode_restore_leaves_full_speed() {
        let hw = Arc::new(MockHardware::new().with_pwm(PWM, PwmMode::Automatic(2)));
        let shared: Arc<dyn HardwareIo> = hw.clone();
        hw.write_duty(&PwmRef::new(PWM), 10.0).unwrap();

        let guard = ManualOverride::engage(shared, &PwmRef::new(PWM)).unwrap();
        hw.fail_mode_writes(PWM, 1);
        drop(guard);

        assert_eq!(hw.mode(PWM), PwmMode::Manual);
        assert_eq!(hw.duty(PWM), 100.0);
    }

    fn active(dir: &TempDir, hw: &MockHardware, profiles: Vec<FanProfile>) -> ActiveConfig {
        let mut config = Config::default().with_profiles(profiles);
        config.daemon.lock_dir = dir.path().display().to_string();
        config.daemon.recovery_reads = 2;
        validate_config(&config, hw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_restores_channels_on_stop() {
        let dir = TempDir::new().unwrap();
        let hw = Arc::new(
            MockHardware::new()
                .with_sensor(TEMP, 50.0)
                .with_pwm(PWM, PwmMode::Automatic(5)),
        );
        let cfg = active(&dir, &hw, vec![profile()]);

        let control = ControlLoop::start(&cfg, hw.clone()).unwrap();
        assert_eq!(hw.mode(PWM), PwmMode::Manual);

        time::sleep(Duration::from_secs(5)).await;
        let snapshot = control.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].duty, Some(40.0));
        assert!(hw.writes(PWM).len() >= 3);

        control.stop().await;
        assert_eq!(hw.mode(PWM), PwmMode::Automatic(5));
        assert_eq!(hw.duty(PWM), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_channel_claims_nothing() {
        let dir = TempDir::new().unwrap();
        let hw = Arc::new(
            MockHardware::new()
                .with_sensor(TEMP, 50.0)
                .with_pwm(PWM, PwmMode::Automatic(2))
                .with_pwm("hwmon2/pwm2", PwmMode::Automatic(2)),
        );
        let mut second = profile();
        second.pwm = PwmRef::new("hwmon2/pwm2");
        let cfg = active(&dir, &hw, vec![profile(), second]);

        let _held = ChannelLock::acquire(dir.path(), &PwmRef::new("hwmon2/pwm2")).unwrap();
        let err = ControlLoop::start(&cfg, hw.clone()).unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert_eq!(hw.mode(PWM), PwmMode::Automatic(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_in_one_profile_leaves_others_running() {
        let dir = TempDir::new().unwrap();
        let hw = Arc::new(
            MockHardware::new()
                .with_sensor(TEMP, 50.0)
                .with_sensor("hwmon1/temp2", 70.0)
                .with_pwm(PWM, PwmMode::Automatic(2))
                .with_pwm("hwmon2/pwm2", PwmMode::Automatic(2)),
        );
        let mut second = profile();
        second.pwm = PwmRef::new("hwmon2/pwm2");
        second.sensors = vec![SensorRef::new("hwmon1/temp2")];
        let cfg = active(&dir, &hw, vec![profile(), second]);

        hw.fail_reads("hwmon1/temp2", 1000);
        let control = ControlLoop::start(&cfg, hw.clone()).unwrap();
        time::sleep(Duration::from_secs(7)).await;

        let snapshot = control.snapshot().await;
        let first = snapshot.iter().find(|s| s.pwm.as_str() == PWM).unwrap();
        let other = snapshot.iter().find(|s| s.pwm.as_str() == "hwmon2/pwm2").unwrap();
        assert!(matches!(first.state, ProfileState::Running { .. }));
        assert_eq!(first.duty, Some(40.0));
        assert_eq!(other.state, ProfileState::Faulted);
        assert_eq!(other.duty, Some(100.0));

        control.stop().await;
        assert_eq!(hw.mode("hwmon2/pwm2"), PwmMode::Automatic(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_on_exit_leaves_manual() {
        let dir = TempDir::new().unwrap();
        let hw = Arc::new(mock());
        let mut cfg = active(&dir, &hw, vec![profile()]);
        cfg.daemon.restore_on_exit = false;
        hw.set_temp(TEMP, 80.0);

        let control = ControlLoop::start(&cfg, hw.clone()).unwrap();
        time::sleep(Duration::from_secs(3)).await;
        control.stop().await;

        assert_eq!(hw.mode(PWM), PwmMode::Manual);
        assert_eq!(hw.duty(PWM), 100.0);
    }

    #[test]
    fn test_override_restores_on_panic() {
        let hw = Arc::new(
            MockHardware::new().with_pwm(PWM, PwmMode::Automatic(3)),
        );
        let shared: Arc<dyn HardwareIo> = hw.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ManualOverride::engage(shared, &PwmRef::new(PWM)).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(hw.mode(PWM), PwmMode::Automatic(3));
    }
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! In-memory [`HardwareIo`] for tests.

use crate::error::HardwareError;
use crate::hwmon::{HardwareIo, PwmMode, PwmRef, SensorRef};
use std::collections::HashMap;
use std::sync::Mutex;

/// Mechanical model of a fan: starts at `start` duty, keeps spinning down
/// to `stop` duty.
#[derive(Debug, Clone, Copy)]
pub struct FanModel {
    pub start: f64,
    pub stop: f64,
    pub spinning: bool,
}

impl FanModel {
    fn apply(&mut self, duty: f64) {
        if !self.spinning && duty >= self.start {
            self.spinning = true;
        } else if self.spinning && duty < self.stop {
            self.spinning = false;
        }
    }

    fn rpm(&self, duty: f64) -> u32 {
        if self.spinning { 300 + (duty * 15.0) as u32 } else { 0 }
    }
}

#[derive(Debug)]
struct MockPwm {
    mode: PwmMode,
    duty: f64,
    fan: Option<FanModel>,
}

#[derive(Debug, Default)]
struct State {
    sensors: HashMap<SensorRef, f64>,
    pwms: HashMap<PwmRef, MockPwm>,
    failing_reads: HashMap<SensorRef, u32>,
    failing_writes: HashMap<PwmRef, u32>,
    failing_mode_writes: HashMap<PwmRef, u32>,
    writes: Vec<(PwmRef, f64)>,
    mode_writes: Vec<(PwmRef, PwmMode)>,
}

/// In-memory hardware with scriptable failures.
#[derive(Debug, Default)]
pub struct MockHardware {
    state: Mutex<State>,
}

impl MockHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensor(self, id: &str, temp_c: f64) -> Self {
        self.set_temp(id, temp_c);
        self
    }

    pub fn with_pwm(self, id: &str, mode: PwmMode) -> Self {
        self.state.lock().unwrap().pwms.insert(
            PwmRef::new(id),
            MockPwm {
                mode,
                duty: 50.0,
                fan: None,
            },
        );
        self
    }

    /// Attach a tachometer-equipped fan to an existing PWM.
    pub fn with_fan(self, id: &str, start: f64, stop: f64) -> Self {
        {
            let mut st = self.state.lock().unwrap();
            let pwm = st.pwms.get_mut(&PwmRef::new(id)).unwrap();
            let mut fan = FanModel {
                start,
                stop,
                spinning: false,
            };
            fan.apply(pwm.duty);
            pwm.fan = Some(fan);
        }
        self
    }

    pub fn set_temp(&self, id: &str, temp_c: f64) {
        self.state
            .lock()
            .unwrap()
            .sensors
            .insert(SensorRef::new(id), temp_c);
    }

    /// Make the next `count` reads of `id` fail.
    pub fn fail_reads(&self, id: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_reads
            .insert(SensorRef::new(id), count);
    }

    /// Make the next `count` duty writes to `id` fail.
    pub fn fail_writes(&self, id: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(PwmRef::new(id), count);
    }

    /// Make the next `count` mode writes to `id` fail.
    pub fn fail_mode_writes(&self, id: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_mode_writes
            .insert(PwmRef::new(id), count);
    }

    /// Stop the fan on `id` as if it had jammed. It only restarts once a
    /// duty at or above its start duty is written.
    pub fn stall_fan(&self, id: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(fan) = st.pwms.get_mut(&PwmRef::new(id)).and_then(|p| p.fan.as_mut()) {
            fan.spinning = false;
        }
    }

    pub fn mode(&self, id: &str) -> PwmMode {
        self.state.lock().unwrap().pwms[&PwmRef::new(id)].mode
    }

    pub fn duty(&self, id: &str) -> f64 {
        self.state.lock().unwrap().pwms[&PwmRef::new(id)].duty
    }

    /// All duties written to `id`, in order.
    pub fn writes(&self, id: &str) -> Vec<f64> {
        let pwm = PwmRef::new(id);
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(p, _)| *p == pwm)
            .map(|(_, d)| *d)
            .collect()
    }

    pub fn mode_writes(&self, id: &str) -> Vec<PwmMode> {
        let pwm = PwmRef::new(id);
        self.state
            .lock()
            .unwrap()
            .mode_writes
            .iter()
            .filter(|(p, _)| *p == pwm)
            .map(|(_, m)| *m)
            .collect()
    }
}

impl HardwareIo for MockHardware {
    fn read_sensor(&self, sensor: &SensorRef) -> Result<f64, HardwareError> {
        let mut st = self.state.lock().unwrap();
        if let Some(left) = st.failing_reads.get_mut(sensor) {
            if *left > 0 {
                *left -= 1;
                return Err(HardwareError::read(sensor.as_str(), "simulated failure"));
            }
        }
        st.sensors
            .get(sensor)
            .copied()
            .ok_or_else(|| HardwareError::read(sensor.as_str(), "no such sensor"))
    }

    fn read_pwm_mode(&self, pwm: &PwmRef) -> Result<PwmMode, HardwareError> {
        let st = self.state.lock().unwrap();
        st.pwms
            .get(pwm)
            .map(|p| p.mode)
            .ok_or_else(|| HardwareError::read(pwm.as_str(), "no such pwm"))
    }

    fn write_pwm_mode(&self, pwm: &PwmRef, mode: PwmMode) -> Result<(), HardwareError> {
        let mut st = self.state.lock().unwrap();
        if let Some(left) = st.failing_mode_writes.get_mut(pwm) {
            if *left > 0 {
                *left -= 1;
                return Err(HardwareError::write(pwm.as_str(), mode.raw(), "simulated failure"));
            }
        }
        let entry = st
            .pwms
            .get_mut(pwm)
            .ok_or_else(|| HardwareError::write(pwm.as_str(), mode.raw(), "no such pwm"))?;
        entry.mode = mode;
        st.mode_writes.push((pwm.clone(), mode));
        Ok(())
    }

    fn read_duty(&self, pwm: &PwmRef) -> Result<f64, HardwareError> {
        let st = self.state.lock().unwrap();
        st.pwms
            .get(pwm)
            .map(|p| p.duty)
            .ok_or_else(|| HardwareError::read(pwm.as_str(), "no such pwm"))
    }

    fn write_duty(&self, pwm: &PwmRef, duty: f64) -> Result<(), HardwareError> {
        let mut st = self.state.lock().unwrap();
        if let Some(left) = st.failing_writes.get_mut(pwm) {
            if *left > 0 {
                *left -= 1;
                return Err(HardwareError::write(pwm.as_str(), duty, "simulated failure"));
            }
        }
        let entry = st
            .pwms
            .get_mut(pwm)
            .ok_or_else(|| HardwareError::write(pwm.as_str(), duty, "no such pwm"))?;
        entry.duty = duty;
        if let Some(fan) = entry.fan.as_mut() {
            fan.apply(duty);
        }
        st.writes.push((pwm.clone(), duty));
        Ok(())
    }

    fn read_tach(&self, pwm: &PwmRef) -> Result<u32, HardwareError> {
        let st = self.state.lock().unwrap();
        let entry = st
            .pwms
            .get(pwm)
            .ok_or_else(|| HardwareError::read(pwm.as_str(), "no such pwm"))?;
        match &entry.fan {
            Some(fan) => Ok(fan.rpm(entry.duty)),
            None => Err(HardwareError::unsupported(pwm.as_str(), "tachometer")),
        }
    }

    fn has_sensor(&self, sensor: &SensorRef) -> bool {
        self.state.lock().unwrap().sensors.contains_key(sensor)
    }

    fn has_pwm(&self, pwm: &PwmRef) -> bool {
        self.state.lock().unwrap().pwms.contains_key(pwm)
    }
}

//! Thermostat node: turns a slow, noisy sensor and asynchronous network
//! commands into a steady cadence of control evaluations and broadcasts.
//!
//! [`Orchestrator`] holds the decision state and never touches a socket;
//! [`ThermostatNode`] drives it from the single cooperative loop.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::climate::{self, Controller};
use crate::messages::Msg;
use crate::model::{Device, Mode, Motion, Reading, Settings, Thermometer, Thermostat};
use crate::protocol::Presence;
use crate::sensor::{self, ClimateSensor, MotionSensor};

pub const SAMPLE_INTERVAL_MINUTES: i64 = 2;

/// A jump larger than this between accepted readings is a sensor glitch.
pub const OUTLIER_DELTA: f32 = 10.0;

/// Readings closer than this (°C and %RH) to the last one carry no news.
pub const DUPLICATE_EPSILON: f32 = 0.01;

/// Accepted readings averaged before feeding the controller.
pub const WINDOW: usize = 2;

const IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Accepted,
    Outlier,
    Duplicate,
}

/// Rolling window of the last [`WINDOW`] accepted readings.
#[derive(Debug, Default)]
pub struct Readings {
    window: VecDeque<Reading>,
}

impl Readings {
    pub fn offer(&mut self, reading: Reading) -> Sample {
        if let Some(last) = self.window.back() {
            let diff = (reading.temp - last.temp).abs();
            if diff > OUTLIER_DELTA {
                return Sample::Outlier;
            }
            if diff < DUPLICATE_EPSILON && (reading.humidity - last.humidity).abs() < DUPLICATE_EPSILON
            {
                return Sample::Duplicate;
            }
        }
        self.window.push_back(reading);
        if self.window.len() > WINDOW {
            self.window.pop_front();
        }
        Sample::Accepted
    }

    /// Mean temperature of the window and the latest humidity.
    pub fn smoothed(&self) -> Option<(f32, f32)> {
        let latest = self.window.back()?;
        let sum: f32 = self.window.iter().map(|r| r.temp).sum();
        Some((sum / self.window.len() as f32, latest.humidity))
    }
}

pub struct Orchestrator<C> {
    controller: C,
    settings: Settings,
    device: Device,
    readings: Readings,
    last_sample: Option<DateTime<Utc>>,
    last_motion: DateTime<Utc>,
    motion_seen: bool,
    dirty: bool,
}

impl<C: Controller> Orchestrator<C> {
    /// `has_motion` says whether a motion sensor is attached; only then does
    /// the snapshot carry a motion capability.
    pub fn new(
        name: &str,
        addr: SocketAddr,
        settings: Settings,
        controller: C,
        has_motion: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut device = Device::new(name, addr.to_string());
        device.thermostat = Some(Thermostat {
            state: controller.state(),
            target: None,
            settings,
        });
        if has_motion {
            device.motion = Some(Motion {
                last_motion_unix: now.timestamp(),
            });
        }
        Orchestrator {
            controller,
            settings,
            device,
            readings: Readings::default(),
            last_sample: None,
            last_motion: now,
            motion_seen: true,
            dirty: false,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    #[cfg(test)]
    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// Reacts to a decoded direct message. Returns whether control needs a
    /// re-run.
    pub fn handle(&mut self, msg: &Msg) -> bool {
        match msg {
            Msg::Settings(cmd) => self.apply_settings(cmd),
            Msg::Ping(_) => {
                self.dirty = true;
                true
            }
            other => {
                warn!("Thermostat ignoring {} command", other.kind());
                false
            }
        }
    }

    /// Takes new bounds, and a new mode unless the command leaves it unset.
    /// An inverted band is rejected and nothing changes.
    pub fn apply_settings(&mut self, cmd: &Settings) -> bool {
        let mode = if cmd.mode == Mode::Unset {
            self.settings.mode
        } else {
            cmd.mode
        };
        let next = match Settings::new(cmd.low, cmd.high, mode) {
            Ok(next) => next,
            Err(err) => {
                warn!("Rejecting settings {:?}: {}", cmd, err);
                return false;
            }
        };
        info!("New settings: {:?}", next);
        self.settings = next;
        if let Some(thermostat) = self.device.thermostat.as_mut() {
            thermostat.settings = next;
        }
        self.dirty = true;
        true
    }

    /// `None` means no motion sensor: the room always counts as occupied.
    pub fn observe_motion(&mut self, motion: Option<bool>, now: DateTime<Utc>) {
        let Some(motion) = motion else {
            self.last_motion = now;
            return;
        };
        if motion {
            self.last_motion = now;
        }
        if motion != self.motion_seen {
            info!(
                "Motion changed to {}, last motion at {}",
                motion,
                self.last_motion.format("%b %e %H:%M:%S")
            );
            self.motion_seen = motion;
            self.dirty = true;
        }
    }

    pub fn sample_due(&self, now: DateTime<Utc>) -> bool {
        self.last_sample
            .is_none_or(|last| now - last >= TimeDelta::minutes(SAMPLE_INTERVAL_MINUTES))
    }

    /// Records a sampling cycle. A failed, outlying or duplicate reading
    /// still counts toward the cadence.
    pub fn record_sample(&mut self, reading: Option<Reading>, now: DateTime<Utc>) {
        self.last_sample = Some(now);
        let Some(reading) = reading else {
            return;
        };
        match self.readings.offer(reading) {
            Sample::Accepted => self.dirty = true,
            Sample::Outlier => warn!(
                "Ignoring reading of {:.1}C, more than {}C from the last one",
                reading.temp, OUTLIER_DELTA
            ),
            Sample::Duplicate => debug!("Reading unchanged, ignoring"),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Runs control if anything changed since the last run and a reading is
    /// available. Returns whether the snapshot was refreshed.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> bool {
        if !self.dirty {
            return false;
        }
        let Some((temp, humidity)) = self.readings.smoothed() else {
            return false;
        };
        self.dirty = false;

        let reading = Reading {
            temp,
            humidity,
            time: now,
        };
        let target =
            climate::control(&mut self.controller, &self.settings, self.last_motion, &reading);

        if let Some(thermostat) = self.device.thermostat.as_mut() {
            thermostat.state = self.controller.state();
            thermostat.target = target;
        }
        self.device.thermometer = Some(Thermometer { temp, humidity });
        if let Some(motion) = self.device.motion.as_mut() {
            motion.last_motion_unix = self.last_motion.timestamp();
        }
        info!(
            "Control run: {:.2}C {:.1}% -> {:?} (target {:?})",
            temp,
            humidity,
            self.controller.state(),
            target
        );
        true
    }
}

pub struct ThermostatNode<C, S> {
    orchestrator: Orchestrator<C>,
    presence: Presence,
    sensor: S,
    motion: Option<Box<dyn MotionSensor + Send>>,
}

impl<C: Controller, S: ClimateSensor> ThermostatNode<C, S> {
    pub fn new(
        name: &str,
        presence: Presence,
        settings: Settings,
        controller: C,
        sensor: S,
        motion: Option<Box<dyn MotionSensor + Send>>,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            name,
            presence.local_addr(),
            settings,
            controller,
            motion.is_some(),
            Utc::now(),
        );
        ThermostatNode {
            orchestrator,
            presence,
            sensor,
            motion,
        }
    }

    /// Ticks until `shutdown` flips, then releases the actuators.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Thermostat {} running", self.orchestrator.device().name);
        while !*shutdown.borrow_and_update() {
            self.tick().await;
        }
        info!("Thermostat stopping, turning everything off");
        self.orchestrator.controller_mut().off();
    }

    async fn tick(&mut self) {
        if self.orchestrator.evaluate(Utc::now()) {
            self.presence.broadcast(self.orchestrator.device()).await;
        }

        self.presence.poll_discovery(self.orchestrator.device()).await;

        if let Some(inbound) = self.presence.poll_direct().await {
            self.presence.update_listener(inbound.from);
            self.orchestrator.handle(&inbound.msg);
            return;
        }

        let motion = self.motion.as_mut().map(|sensor| sensor.motion());
        self.orchestrator.observe_motion(motion, Utc::now());

        if !self.orchestrator.sample_due(Utc::now()) {
            if !self.orchestrator.is_dirty() {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
            return;
        }

        debug!("Reading thermometer");
        let reading = sensor::sample(&mut self.sensor);
        self.orchestrator.record_sample(reading, Utc::now());
    }
}

use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use embedded_hal::digital::{InputPin, OutputPin};
use log::{error, info, warn};
use tokio::sync::watch;

use crate::messages::Msg;
use crate::model::{Device, Portal, PortalState};
use crate::protocol::Presence;

const PULSE: Duration = Duration::from_millis(100);
const SENSE_INTERVAL_SECS: i64 = 1;
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Garage door style node. The contact reads high while closed; the control
/// is a push-button that toggles on an active-low pulse.
pub struct PortalNode<O, I> {
    presence: Presence,
    device: Device,
    control: O,
    sensor: Option<I>,
    last_sense: Option<DateTime<Utc>>,
}

impl<O: OutputPin, I: InputPin> PortalNode<O, I> {
    pub fn new(name: &str, presence: Presence, control: O, sensor: Option<I>) -> Self {
        let mut device = Device::new(name, presence.local_addr().to_string());
        device.portal = Some(Portal {
            state: PortalState::Unknown,
        });
        let mut node = PortalNode {
            presence,
            device,
            control,
            sensor,
            last_sense: None,
        };
        node.release();
        node
    }

    fn state(&self) -> PortalState {
        self.device
            .portal
            .map_or(PortalState::Unknown, |portal| portal.state)
    }

    fn release(&mut self) {
        if let Err(err) = self.control.set_high() {
            error!("Error releasing portal control: {:?}", err);
        }
    }

    pub fn needs_pulse(&self, requested: PortalState) -> bool {
        requested != PortalState::Unknown && requested != self.state()
    }

    async fn pulse(&mut self) {
        if let Err(err) = self.control.set_low() {
            error!("Error pressing portal control: {:?}", err);
            return;
        }
        tokio::time::sleep(PULSE).await;
        self.release();
    }

    // At most once per second. True when the state changed.
    pub fn sense(&mut self, now: DateTime<Utc>) -> bool {
        if self
            .last_sense
            .is_some_and(|last| now - last < TimeDelta::seconds(SENSE_INTERVAL_SECS))
        {
            return false;
        }
        self.last_sense = Some(now);

        let Some(sensor) = self.sensor.as_mut() else {
            return false;
        };
        let sensed = match sensor.is_high() {
            Ok(true) => PortalState::Closed,
            Ok(false) => PortalState::Open,
            Err(err) => {
                error!("Error reading portal sensor: {:?}", err);
                return false;
            }
        };
        if sensed == self.state() {
            return false;
        }
        info!("{} is now {}", self.device.name, sensed);
        self.device.portal = Some(Portal { state: sensed });
        true
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Portal {} running", self.device.name);
        while !*shutdown.borrow_and_update() {
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        self.presence.poll_discovery(&self.device).await;

        if let Some(inbound) = self.presence.poll_direct().await {
            self.presence.update_listener(inbound.from);
            match inbound.msg {
                Msg::Portal(cmd) => {
                    if self.needs_pulse(cmd.state) {
                        info!("Requested {}, toggling {}", cmd.state, self.device.name);
                        self.pulse().await;
                    } else {
                        info!("{} already {}", self.device.name, self.state());
                    }
                }
                Msg::Ping(_) => self.presence.broadcast(&self.device).await,
                other => warn!("Portal ignoring {} command", other.kind()),
            }
            return;
        }

        if self.sense(Utc::now()) {
            self.presence.broadcast(&self.device).await;
        } else {
            tokio::time::sleep(IDLE_SLEEP).await;
        }
    }
}

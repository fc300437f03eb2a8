use std::time::Duration;

use embedded_hal::digital::OutputPin;
use log::{error, info, warn};
use tokio::sync::watch;

use crate::messages::Msg;
use crate::model::{Device, Switch};
use crate::protocol::Presence;

const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// On/off node (fireplace, lights). The relay is active-low.
pub struct SwitchNode<P> {
    presence: Presence,
    device: Device,
    pin: P,
}

impl<P: OutputPin> SwitchNode<P> {
    pub fn new(name: &str, presence: Presence, pin: P) -> Self {
        let mut device = Device::new(name, presence.local_addr().to_string());
        device.switch = Some(Switch { on: false });
        let mut node = SwitchNode {
            presence,
            device,
            pin,
        };
        node.drive(false);
        node
    }

    fn drive(&mut self, on: bool) {
        let result = if on {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        };
        if let Err(err) = result {
            error!("Error driving switch pin: {:?}", err);
        }
    }

    pub fn apply(&mut self, cmd: Switch) {
        info!("Setting {} to {}", self.device.name, if cmd.on { "on" } else { "off" });
        self.drive(cmd.on);
        self.device.switch = Some(cmd);
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Switch {} running", self.device.name);
        while !*shutdown.borrow_and_update() {
            self.tick().await;
        }
        self.drive(false);
    }

    async fn tick(&mut self) {
        self.presence.poll_discovery(&self.device).await;

        let Some(inbound) = self.presence.poll_direct().await else {
            tokio::time::sleep(IDLE_SLEEP).await;
            return;
        };
        self.presence.update_listener(inbound.from);
        match inbound.msg {
            Msg::Switch(cmd) => self.apply(cmd),
            Msg::Ping(_) => {}
            other => {
                warn!("Switch ignoring {} command", other.kind());
                return;
            }
        }
        self.presence.broadcast(&self.device).await;
    }
}

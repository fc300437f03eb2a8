use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use tokio::sync::watch;

use crate::alert::{CommandNotifier, LogNotifier};
use crate::climate::{Controller, NoopController, RelayController};
use crate::config::{AppConfig, MonitorConfig, NetworkConfig};
use crate::gpio::{NoopPin, SysfsPin};
use crate::messages::Msg;
use crate::model::{Mode, Portal, PortalState, Settings, Switch};
use crate::monitor::Monitor;
use crate::portal::PortalNode;
use crate::protocol::Presence;
use crate::sensor::{ClimateSensor, FixedSensor, IioSensor, MotionSensor, PinMotion};
use crate::switch::SwitchNode;
use crate::thermostat::ThermostatNode;

mod alert;
mod climate;
mod config;
mod error;
mod gpio;
mod messages;
mod model;
mod monitor;
mod portal;
mod protocol;
mod sensor;
mod switch;
mod thermostat;

/// How long `send --to <name>` waits for the device to answer discovery.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(version, about = "Home climate, switch and portal nodes")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the thermostat node.
    Thermostat {
        #[arg(long, default_value = "Thermostat")]
        name: String,
    },
    /// Run a switch node.
    Switch {
        #[arg(long)]
        name: String,
    },
    /// Run a portal node.
    Portal {
        #[arg(long)]
        name: String,
    },
    /// Watch every node and raise alerts.
    Monitor,
    /// Send one command and exit.
    Send {
        /// `ip:port` of a node, or a device name resolved over discovery.
        #[arg(long)]
        to: String,

        #[command(subcommand)]
        command: SendCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SendCommand {
    Settings {
        #[arg(long)]
        low: f32,
        #[arg(long)]
        high: f32,
        /// Leaves the mode alone when omitted.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    Switch {
        #[arg(value_enum)]
        state: OnOff,
    },
    Portal {
        #[arg(value_enum)]
        state: PortalArg,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ModeArg {
    Off,
    Auto,
    Fan,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum OnOff {
    On,
    Off,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PortalArg {
    Open,
    Closed,
}

impl SendCommand {
    fn into_msg(self) -> anyhow::Result<Msg> {
        Ok(match self {
            SendCommand::Settings { low, high, mode } => {
                let mode = match mode {
                    None => Mode::Unset,
                    Some(ModeArg::Off) => Mode::Off,
                    Some(ModeArg::Auto) => Mode::Auto,
                    Some(ModeArg::Fan) => Mode::Fan,
                };
                Msg::Settings(Settings::new(low, high, mode)?)
            }
            SendCommand::Switch { state } => Msg::Switch(Switch {
                on: matches!(state, OnOff::On),
            }),
            SendCommand::Portal { state } => Msg::Portal(Portal {
                state: match state {
                    PortalArg::Open => PortalState::Open,
                    PortalArg::Closed => PortalState::Closed,
                },
            }),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    let network = config.network.clone().unwrap_or_default();

    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                // Receivers may already be gone.
                let _ = shutdown_tx.send(true);
            }
            Err(err) => error!("Error listening for ctrl-c: {}", err),
        }
    });

    match cli.role {
        Role::Thermostat { name } => {
            let thermostat = config.thermostat.unwrap_or_default();
            let settings = thermostat.settings()?;

            let controller: Box<dyn Controller + Send> = match thermostat.relay_pins() {
                Some((heat, cool, fan)) => Box::new(RelayController::new(
                    SysfsPin::output(heat)?,
                    SysfsPin::output(cool)?,
                    SysfsPin::output(fan)?,
                )),
                None => {
                    info!("No relay pins configured, running without hardware");
                    Box::new(NoopController::default())
                }
            };
            let motion = match thermostat.motion_pin {
                Some(pin) => {
                    let sensor: Box<dyn MotionSensor + Send> =
                        Box::new(PinMotion::new(SysfsPin::input(pin)?));
                    Some(sensor)
                }
                None => None,
            };

            let sensor: Box<dyn ClimateSensor + Send> = match &thermostat.sensor {
                Some(dir) => Box::new(IioSensor::new(dir)),
                None => {
                    info!("No climate sensor configured, reporting a fixed reading");
                    Box::new(FixedSensor::default())
                }
            };

            let presence = Presence::announce(&network).await?;
            ThermostatNode::new(&name, presence, settings, controller, sensor, motion)
            .run(shutdown)
            .await;
        }
        Role::Switch { name } => {
            let pin = config.switch.unwrap_or_default().pin;
            let presence = Presence::announce(&network).await?;
            match pin {
                Some(pin) => {
                    SwitchNode::new(&name, presence, SysfsPin::output(pin)?)
                        .run(shutdown)
                        .await
                }
                None => SwitchNode::new(&name, presence, NoopPin).run(shutdown).await,
            }
        }
        Role::Portal { name } => {
            let portal = config.portal.unwrap_or_default();
            let sensor = portal.sensor_pin.map(SysfsPin::input).transpose()?;
            let presence = Presence::announce(&network).await?;
            match portal.control_pin {
                Some(pin) => {
                    PortalNode::new(&name, presence, SysfsPin::output(pin)?, sensor)
                        .run(shutdown)
                        .await
                }
                None => PortalNode::new(&name, presence, NoopPin, sensor).run(shutdown).await,
            }
        }
        Role::Monitor => {
            let monitor_config = config.monitor.unwrap_or_default();
            monitor_config.validate()?;
            let presence = Presence::bind_direct(&network).await?;
            let (monitor, handle) = Monitor::new(presence, &monitor_config);
            match &monitor_config.notify_command {
                Some(argv) => monitor.run(CommandNotifier::new(argv)?, shutdown).await?,
                None => monitor.run(LogNotifier, shutdown).await?,
            }
            for record in handle.devices().await {
                info!(
                    "{} at {} last reported {}",
                    record.device.name, record.device.addr, record.last_update
                );
            }
        }
        Role::Send { to, command } => {
            let msg = command.into_msg()?;
            match to.parse::<SocketAddr>() {
                Ok(addr) => {
                    let presence = Presence::bind_direct(&network).await?;
                    presence.try_send(&msg, addr).await?;
                }
                Err(_) => send_by_name(&network, &to, msg).await?,
            }
        }
    }

    Ok(())
}

/// Discovers `name` through a short-lived monitor and sends it `msg`.
async fn send_by_name(network: &NetworkConfig, name: &str, msg: Msg) -> anyhow::Result<()> {
    let presence = Presence::bind_direct(network).await?;
    let (monitor, handle) = Monitor::new(presence, &MonitorConfig::default());
    let (stop_tx, stop) = watch::channel(false);

    let deliver = async move {
        let found = tokio::time::timeout(LOOKUP_TIMEOUT, async {
            while handle.lookup(name).await.is_none() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        let result = match found {
            Ok(()) => handle.command(name, msg).await.map_err(anyhow::Error::from),
            Err(_) => Err(anyhow!("{name} did not answer discovery")),
        };
        let _ = stop_tx.send(true);
        result
    };

    let (ran, delivered) = tokio::join!(monitor.run(LogNotifier, stop), deliver);
    ran?;
    delivered
}

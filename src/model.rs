use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::error::SettingsError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Only meaningful in a command: leave the current mode alone.
    #[default]
    Unset,
    Off,
    Auto,
    Fan,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    #[default]
    Idle,
    Heating,
    Cooling,
    Fanning,
}

/// Acceptable temperature band in °C plus the operating mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub low: f32,
    pub high: f32,
    pub mode: Mode,
}

impl Settings {
    pub fn new(low: f32, high: f32, mode: Mode) -> Result<Self, SettingsError> {
        let settings = Settings { low, high, mode };
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects bands where `low` is not strictly below `high` (NaN included).
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.low < self.high {
            Ok(())
        } else {
            Err(SettingsError::InvertedBand {
                low: self.low,
                high: self.high,
            })
        }
    }
}

/// One temperature/humidity sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temp: f32,
    pub humidity: f32,
    pub time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Thermostat {
    pub state: ControlState,
    /// `None` when nothing is being driven toward (idle, fan-only, or off).
    pub target: Option<f32>,
    pub settings: Settings,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Thermometer {
    pub temp: f32,
    pub humidity: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Motion {
    pub last_motion_unix: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub on: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortalState {
    #[default]
    Unknown,
    Closed,
    Open,
}

impl std::fmt::Display for PortalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortalState::Unknown => f.write_str("unknown"),
            PortalState::Closed => f.write_str("closed"),
            PortalState::Open => f.write_str("open"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Portal {
    pub state: PortalState,
}

/// A node on the network and whatever it can sense or control.
///
/// Each capability is present only when the node actually has it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Device {
    pub name: String,
    /// `ip:port` of the node's direct socket.
    pub addr: String,
    pub thermostat: Option<Thermostat>,
    pub thermometer: Option<Thermometer>,
    pub motion: Option<Motion>,
    pub switch: Option<Switch>,
    pub portal: Option<Portal>,
}

impl Device {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Device {
            name: name.into(),
            addr: addr.into(),
            thermostat: None,
            thermometer: None,
            motion: None,
            switch: None,
            portal: None,
        }
    }
}

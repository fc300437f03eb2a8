use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};
use chrono::Duration;
use serde_derive::Deserialize;

use crate::model::{Mode, Settings};

pub const DEFAULT_DISCOVERY: &str = "225.1.2.3:8778";

/// Longest alert window or ping interval accepted, one year.
const MAX_MINUTES: i64 = 365 * 24 * 60;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub network: Option<NetworkConfig>,
    pub thermostat: Option<ThermostatConfig>,
    pub switch: Option<SwitchConfig>,
    pub portal: Option<PortalConfig>,
    pub monitor: Option<MonitorConfig>,
}

impl AppConfig {
    /// Reads `path`, or falls back to all defaults if it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::de::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct NetworkConfig {
    /// Multicast `ip:port` used only for discovery pings.
    pub discovery: Option<String>,
    /// Local IPv4 address for the direct socket. When unset, the address
    /// routed toward the discovery group is used.
    pub interface: Option<Ipv4Addr>,
}

impl NetworkConfig {
    pub fn discovery(&self) -> anyhow::Result<SocketAddrV4> {
        let raw = self.discovery.as_deref().unwrap_or(DEFAULT_DISCOVERY);
        raw.parse()
            .with_context(|| format!("invalid discovery address {raw:?}"))
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModeConfig {
    Off,
    Auto,
    Fan,
}

impl From<ModeConfig> for Mode {
    fn from(mode: ModeConfig) -> Self {
        match mode {
            ModeConfig::Off => Mode::Off,
            ModeConfig::Auto => Mode::Auto,
            ModeConfig::Fan => Mode::Fan,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ThermostatConfig {
    pub low: Option<f32>,
    pub high: Option<f32>,
    pub mode: Option<ModeConfig>,
    pub heat_pin: Option<u32>,
    pub cool_pin: Option<u32>,
    pub fan_pin: Option<u32>,
    pub motion_pin: Option<u32>,
    /// IIO device directory of the climate sensor. Without one the node
    /// reports a fixed reading.
    pub sensor: Option<PathBuf>,
}

impl ThermostatConfig {
    /// Settings the thermostat starts with.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mode = self.mode.map_or(Mode::Auto, Mode::from);
        Settings::new(
            self.low.unwrap_or(19.0),
            self.high.unwrap_or(26.66),
            mode,
        )
        .context("invalid [thermostat] band")
    }

    /// Relay pins, only when all three are configured.
    pub fn relay_pins(&self) -> Option<(u32, u32, u32)> {
        Some((self.heat_pin?, self.cool_pin?, self.fan_pin?))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SwitchConfig {
    pub pin: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PortalConfig {
    pub control_pin: Option<u32>,
    pub sensor_pin: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct MonitorConfig {
    pub silence_minutes: Option<i64>,
    pub portal_open_minutes: Option<i64>,
    pub backoff_minutes: Option<i64>,
    pub ping_minutes: Option<u64>,
    /// Program (and arguments) fed each alert on stdin.
    pub notify_command: Option<Vec<String>>,
}

impl MonitorConfig {
    /// Rejects windows that are not positive or run past a year.
    pub fn validate(&self) -> anyhow::Result<()> {
        let windows = [
            ("silence_minutes", self.silence_minutes),
            ("portal_open_minutes", self.portal_open_minutes),
            ("backoff_minutes", self.backoff_minutes),
        ];
        for (field, minutes) in windows {
            let Some(minutes) = minutes else { continue };
            if !(1..=MAX_MINUTES).contains(&minutes) {
                bail!("[monitor] {field} must be between 1 and {MAX_MINUTES}, got {minutes}");
            }
            Duration::try_minutes(minutes)
                .with_context(|| format!("[monitor] {field} = {minutes} is out of range"))?;
        }

        if let Some(minutes) = self.ping_minutes {
            if minutes == 0 || minutes > MAX_MINUTES as u64 {
                bail!("[monitor] ping_minutes must be between 1 and {MAX_MINUTES}, got {minutes}");
            }
            minutes
                .checked_mul(60)
                .with_context(|| format!("[monitor] ping_minutes = {minutes} is out of range"))?;
        }
        Ok(())
    }

    pub fn silence(&self) -> Duration {
        window(self.silence_minutes, 30)
    }

    pub fn portal_open(&self) -> Duration {
        window(self.portal_open_minutes, 30)
    }

    pub fn backoff(&self) -> Duration {
        window(self.backoff_minutes, 60)
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        let minutes = self.ping_minutes.unwrap_or(5).clamp(1, MAX_MINUTES as u64);
        std::time::Duration::from_secs(minutes * 60)
    }
}

// Clamped so an unvalidated config still cannot panic.
fn window(minutes: Option<i64>, default: i64) -> Duration {
    Duration::minutes(minutes.unwrap_or(default).clamp(1, MAX_MINUTES))
}

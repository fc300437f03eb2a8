use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::process::Stdio;

use anyhow::{Context as _, bail};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

use crate::model::{Device, PortalState};

/// Doublings stop here so the delay cannot overflow.
const MAX_DOUBLINGS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Silent,
    PortalOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub device: String,
    pub kind: AlertKind,
    /// When the condition started: last snapshot, or when the portal opened.
    pub since: DateTime<Utc>,
    pub count: u32,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let since = self.since.format("%Y-%m-%d %H:%M:%S UTC");
        match self.kind {
            AlertKind::Silent => write!(f, "{} has not reported since {}", self.device, since),
            AlertKind::PortalOpen => write!(f, "{} has been open since {}", self.device, since),
        }
    }
}

/// Exponential re-alert schedule for one condition on one device.
///
/// The first alert fires at once; after `n` alerts the next waits
/// `base * 2^(n-1)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    sent: u32,
    next_at: Option<DateTime<Utc>>,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Backoff {
            base,
            sent: 0,
            next_at: None,
        }
    }

    pub fn fire(&mut self, now: DateTime<Utc>) -> bool {
        if self.next_at.is_some_and(|next| now < next) {
            return false;
        }
        self.sent += 1;
        let factor = 1i32 << (self.sent - 1).min(MAX_DOUBLINGS);
        self.next_at = Some(now + self.base * factor);
        true
    }

    pub fn reset(&mut self) {
        self.sent = 0;
        self.next_at = None;
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }
}

#[derive(Debug)]
struct Watched {
    last_update: DateTime<Utc>,
    open_since: Option<DateTime<Utc>>,
    silent: Backoff,
    portal: Backoff,
}

#[derive(Debug)]
pub struct AlertWatcher {
    silence: Duration,
    portal_open: Duration,
    backoff: Duration,
    devices: HashMap<String, Watched>,
}

impl AlertWatcher {
    pub fn new(silence: Duration, portal_open: Duration, backoff: Duration) -> Self {
        AlertWatcher {
            silence,
            portal_open,
            backoff,
            devices: HashMap::new(),
        }
    }

    pub fn observe(&mut self, device: &Device, now: DateTime<Utc>) {
        let backoff = self.backoff;
        let watched = self
            .devices
            .entry(device.name.clone())
            .or_insert_with(|| Watched {
                last_update: now,
                open_since: None,
                silent: Backoff::new(backoff),
                portal: Backoff::new(backoff),
            });
        watched.last_update = now;

        let open = device
            .portal
            .is_some_and(|portal| portal.state == PortalState::Open);
        if !open {
            watched.open_since = None;
        } else if watched.open_since.is_none() {
            watched.open_since = Some(now);
        }
    }

    pub fn is_silent(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.devices
            .get(name)
            .is_some_and(|watched| now - watched.last_update > self.silence)
    }

    pub fn portal_open_too_long(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.devices.get(name).is_some_and(|watched| {
            watched
                .open_since
                .is_some_and(|since| now - since > self.portal_open)
        })
    }

    /// Alerts due at `now`. Backoff advances as they are returned, whether or
    /// not the caller manages to deliver them.
    pub fn check(&mut self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();

        let mut alerts = Vec::new();
        for name in names {
            let silent = self.is_silent(&name, now);
            let open_too_long = self.portal_open_too_long(&name, now);
            let Some(watched) = self.devices.get_mut(&name) else {
                continue;
            };

            if !silent {
                watched.silent.reset();
            } else if watched.silent.fire(now) {
                alerts.push(Alert {
                    device: name.clone(),
                    kind: AlertKind::Silent,
                    since: watched.last_update,
                    count: watched.silent.sent(),
                });
            }

            match watched.open_since {
                Some(since) if open_too_long => {
                    if watched.portal.fire(now) {
                        alerts.push(Alert {
                            device: name.clone(),
                            kind: AlertKind::PortalOpen,
                            since,
                            count: watched.portal.sent(),
                        });
                    }
                }
                _ => watched.portal.reset(),
            }
        }
        alerts
    }
}

pub trait Notifier {
    fn notify(&self, alert: &Alert) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        warn!("ALERT #{}: {}", alert.count, alert);
        Ok(())
    }
}

/// Runs an external program per alert and feeds it the alert text on stdin.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: &[String]) -> anyhow::Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("notify_command must name a program");
        };
        Ok(CommandNotifier {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Notifier for CommandNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        info!("Sending alert through {}", self.program);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("starting {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{alert}\n").as_bytes())
                .await
                .context("writing alert")?;
        }

        let status = child.wait().await.context("waiting for notifier")?;
        if !status.success() {
            bail!("{} exited with {}", self.program, status);
        }
        Ok(())
    }
}

//! Central monitor: keeps the device table current and raises alerts.
//!
//! Two loops run side by side. The receive loop owns the direct socket: it
//! pings the discovery group, stores every snapshot in the shared table and
//! forwards it to the alert loop over a bounded queue. When that queue is
//! full the receive loop waits, so a slow notifier holds back packet
//! processing instead of growing memory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::sync::{Mutex, mpsc, watch};

use crate::alert::{AlertWatcher, Notifier};
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::messages::Msg;
use crate::model::Device;
use crate::protocol::{Inbound, Presence};

pub const UPDATE_QUEUE: usize = 10;
const COMMAND_QUEUE: usize = 10;
const CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device: Device,
    pub last_update: DateTime<Utc>,
}

pub type DeviceTable = Arc<Mutex<HashMap<String, DeviceRecord>>>;

struct Outgoing {
    addr: SocketAddr,
    msg: Msg,
}

struct Update {
    device: Device,
    at: DateTime<Utc>,
}

enum Event {
    Shutdown,
    Ping,
    Command(Outgoing),
    Inbound(Option<Inbound>),
}

/// Cloneable access to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    table: DeviceTable,
    commands: mpsc::Sender<Outgoing>,
}

impl MonitorHandle {
    pub async fn lookup(&self, name: &str) -> Option<DeviceRecord> {
        self.table.lock().await.get(name).cloned()
    }

    pub async fn devices(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self.table.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.device.name.cmp(&b.device.name));
        records
    }

    /// Sends `msg` to the device that last reported as `name`.
    pub async fn command(&self, name: &str, msg: Msg) -> Result<(), MonitorError> {
        let record = self
            .lookup(name)
            .await
            .ok_or_else(|| MonitorError::UnknownDevice(name.to_string()))?;
        let addr = record
            .device
            .addr
            .parse()
            .map_err(|_| MonitorError::BadAddress {
                name: name.to_string(),
                addr: record.device.addr.clone(),
            })?;
        self.commands
            .send(Outgoing { addr, msg })
            .await
            .map_err(|_| MonitorError::Stopped)
    }
}

pub struct Monitor {
    presence: Presence,
    table: DeviceTable,
    commands: mpsc::Receiver<Outgoing>,
    watcher: AlertWatcher,
    ping_interval: Duration,
}

impl Monitor {
    pub fn new(presence: Presence, config: &MonitorConfig) -> (Self, MonitorHandle) {
        let table = DeviceTable::default();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let monitor = Monitor {
            presence,
            table: table.clone(),
            commands: rx,
            watcher: AlertWatcher::new(config.silence(), config.portal_open(), config.backoff()),
            ping_interval: config.ping_interval(),
        };
        (monitor, MonitorHandle { table, commands: tx })
    }

    pub async fn run<N: Notifier>(
        self,
        notifier: N,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("Monitor listening on {}", self.presence.local_addr());
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE);

        let receive = receive_loop(
            self.presence,
            self.table,
            self.commands,
            updates_tx,
            self.ping_interval,
            shutdown.clone(),
        );
        let alerts = alert_loop(self.watcher, updates_rx, notifier, shutdown);

        futures::try_join!(receive, alerts)?;
        info!("Monitor stopped");
        Ok(())
    }
}

async fn receive_loop(
    mut presence: Presence,
    table: DeviceTable,
    mut commands: mpsc::Receiver<Outgoing>,
    updates: mpsc::Sender<Update>,
    ping_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // First tick completes at once, so the group is pinged on start.
    let mut ping = tokio::time::interval(ping_interval);

    while !*shutdown.borrow_and_update() {
        let event = tokio::select! {
            changed = shutdown.changed() => match changed {
                Ok(()) => continue,
                Err(_) => Event::Shutdown,
            },
            _ = ping.tick() => Event::Ping,
            Some(outgoing) = commands.recv() => Event::Command(outgoing),
            inbound = presence.recv_direct() => Event::Inbound(inbound),
        };

        match event {
            Event::Shutdown => break,
            Event::Ping => {
                debug!("Requesting updates");
                presence.request_updates().await;
            }
            Event::Command(Outgoing { addr, msg }) => {
                info!("Sending {} command to {}", msg.kind(), addr);
                presence.send(&msg, addr).await;
            }
            Event::Inbound(Some(Inbound {
                msg: Msg::Device(device),
                ..
            })) => {
                let now = Utc::now();
                debug!("Snapshot from {} at {}", device.name, device.addr);
                table.lock().await.insert(
                    device.name.clone(),
                    DeviceRecord {
                        device: device.clone(),
                        last_update: now,
                    },
                );
                if updates.send(Update { device, at: now }).await.is_err() {
                    break;
                }
            }
            Event::Inbound(Some(other)) => {
                debug!("Ignoring {} message from {}", other.msg.kind(), other.from);
            }
            Event::Inbound(None) => {}
        }
    }

    // Commands queued before shutdown still go out.
    while let Ok(Outgoing { addr, msg }) = commands.try_recv() {
        info!("Sending {} command to {}", msg.kind(), addr);
        presence.send(&msg, addr).await;
    }
    Ok(())
}

async fn alert_loop<N: Notifier>(
    mut watcher: AlertWatcher,
    mut updates: mpsc::Receiver<Update>,
    notifier: N,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut check = tokio::time::interval(CHECK_INTERVAL);

    while !*shutdown.borrow_and_update() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            update = updates.recv() => match update {
                Some(update) => watcher.observe(&update.device, update.at),
                None => break,
            },
            _ = check.tick() => {
                for alert in watcher.check(Utc::now()) {
                    if let Err(err) = notifier.notify(&alert).await {
                        error!("Error delivering alert for {}: {:#}", alert.device, err);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogNotifier;
    use crate::messages::Ping;
    use crate::model::Switch;
    use tokio::net::UdpSocket;

    async fn recv(socket: &UdpSocket) -> (Msg, SocketAddr) {
        let mut buf = [0u8; 2048];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (Msg::decode(&buf[..n]).unwrap(), from)
    }

    #[tokio::test]
    async fn test_snapshot_lands_in_table_and_commands_route_by_name() {
        // Stands in for both the discovery group and a switch node.
        let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let node_addr = node.local_addr().unwrap();

        let direct = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let presence = Presence::from_sockets(direct, None, node_addr).unwrap();
        let (monitor, handle) = Monitor::new(presence, &MonitorConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(monitor.run(LogNotifier, shutdown_rx));

        let (msg, monitor_addr) = recv(&node).await;
        assert_eq!(msg, Msg::Ping(Ping { respond: true }));

        let mut device = Device::new("Fireplace", node_addr.to_string());
        device.switch = Some(Switch { on: false });
        let frame = Msg::Device(device.clone()).encode().unwrap();
        node.send_to(&frame, monitor_addr).await.unwrap();

        let mut record = None;
        for _ in 0..100 {
            record = handle.lookup("Fireplace").await;
            if record.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(record.unwrap().device, device);
        assert_eq!(handle.devices().await.len(), 1);

        handle
            .command("Fireplace", Msg::Switch(Switch { on: true }))
            .await
            .unwrap();
        let (msg, _) = recv(&node).await;
        assert_eq!(msg, Msg::Switch(Switch { on: true }));

        assert_eq!(
            handle.command("Porch", Msg::Switch(Switch { on: true })).await,
            Err(MonitorError::UnknownDevice("Porch".to_string()))
        );

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(
            handle.command("Fireplace", Msg::Switch(Switch { on: false })).await,
            Err(MonitorError::Stopped)
        );
    }

    #[tokio::test]
    async fn test_unusable_address_is_reported() {
        let direct = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let group = direct.local_addr().unwrap();
        let presence = Presence::from_sockets(direct, None, group).unwrap();
        let (_monitor, handle) = Monitor::new(presence, &MonitorConfig::default());

        handle.table.lock().await.insert(
            "Broken".to_string(),
            DeviceRecord {
                device: Device::new("Broken", "not-an-address"),
                last_update: Utc::now(),
            },
        );
        assert!(matches!(
            handle.command("Broken", Msg::Ping(Ping { respond: false })).await,
            Err(MonitorError::BadAddress { .. })
        ));
    }
}

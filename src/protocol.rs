//! Broker-free presence protocol.
//!
//! Every node owns two sockets: a *direct* unicast socket whose `ip:port`
//! is the node's identity, and a *discovery* socket joined to the
//! well-known multicast group. The group only ever carries [`Ping`]s.
//! Anyone who sends a `Ping { respond: true }` (to the group or straight to
//! the direct socket) becomes a [`Listener`] and gets every snapshot the
//! node broadcasts until it goes quiet for [`IDLE_TIMEOUT_MINUTES`].
//!
//! All reads are bounded by [`POLL_DEADLINE`] so a node's single loop can
//! interleave network, sensor and control work.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context as _, bail};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::NetworkConfig;
use crate::messages::{Msg, Ping};
use crate::model::Device;

/// A listener not heard from for this long is dropped on the next broadcast.
pub const IDLE_TIMEOUT_MINUTES: i64 = 30;

/// Upper bound on any single non-blocking socket read.
pub const POLL_DEADLINE: Duration = Duration::from_millis(10);

const RECV_BUFFER: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub addr: SocketAddr,
    pub last_ping_unix: i64,
}

/// Addresses currently watching this node.
///
/// Expected to hold tens of entries at most, so lookups are linear.
#[derive(Debug, Default)]
pub struct Listeners {
    entries: Vec<Listener>,
}

impl Listeners {
    /// Refreshes `addr` if known, otherwise starts tracking it.
    pub fn update(&mut self, addr: SocketAddr, now: DateTime<Utc>) {
        let now = now.timestamp();
        match self.entries.iter_mut().find(|l| l.addr == addr) {
            Some(listener) => listener.last_ping_unix = now,
            None => {
                info!("New listener: {}", addr);
                self.entries.push(Listener {
                    addr,
                    last_ping_unix: now,
                });
            }
        }
    }

    /// Drops listeners idle past the timeout and returns the rest.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<SocketAddr> {
        let now = now.timestamp();
        let timeout = IDLE_TIMEOUT_MINUTES * 60;
        self.entries.retain(|l| {
            let live = now - l.last_ping_unix <= timeout;
            if !live {
                info!("Listener {} expired", l.addr);
            }
            live
        });
        self.entries.iter().map(|l| l.addr).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A decoded envelope and who sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: SocketAddr,
    pub msg: Msg,
}

pub struct Presence {
    direct: UdpSocket,
    discovery: Option<UdpSocket>,
    group: SocketAddr,
    local_addr: SocketAddr,
    listeners: Listeners,
    buf: Vec<u8>,
}

impl Presence {
    /// Binds both sockets and sends a `Ping { respond: false }` beacon to
    /// the discovery group. Nobody is expected to answer it.
    pub async fn announce(config: &NetworkConfig) -> anyhow::Result<Self> {
        let (group, ip) = resolve(config).await?;

        let direct = UdpSocket::bind((ip, 0))
            .await
            .with_context(|| format!("binding direct socket on {ip}"))?;

        let discovery = bind_shared(group.port())
            .with_context(|| format!("binding discovery socket on port {}", group.port()))?;
        discovery
            .join_multicast_v4(*group.ip(), ip)
            .with_context(|| format!("joining multicast group {group}"))?;

        let presence = Presence::from_sockets(direct, Some(discovery), group.into())?;
        info!(
            "Listening on {}, discovery group {}",
            presence.local_addr, group
        );
        presence.send(&Msg::Ping(Ping { respond: false }), presence.group).await;
        Ok(presence)
    }

    /// Binds only the direct socket. Used by the monitor, which asks for
    /// updates rather than answering discovery.
    pub async fn bind_direct(config: &NetworkConfig) -> anyhow::Result<Self> {
        let (group, ip) = resolve(config).await?;
        let direct = UdpSocket::bind((ip, 0))
            .await
            .with_context(|| format!("binding direct socket on {ip}"))?;
        let presence = Presence::from_sockets(direct, None, group.into())?;
        info!("Listening on {}", presence.local_addr);
        Ok(presence)
    }

    pub fn from_sockets(
        direct: UdpSocket,
        discovery: Option<UdpSocket>,
        group: SocketAddr,
    ) -> std::io::Result<Self> {
        let local_addr = direct.local_addr()?;
        Ok(Presence {
            direct,
            discovery,
            group,
            local_addr,
            listeners: Listeners::default(),
            buf: vec![0; RECV_BUFFER],
        })
    }

    /// `ip:port` of the direct socket; the node's published `addr`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn update_listener(&mut self, addr: SocketAddr) {
        self.listeners.update(addr, Utc::now());
    }

    /// Answers a pending `Ping { respond: true }` on the discovery group by
    /// registering the sender and sending it `snapshot` directly.
    pub async fn poll_discovery(&mut self, snapshot: &Device) {
        let Some(discovery) = self.discovery.as_ref() else {
            return;
        };
        let (n, from) =
            match tokio::time::timeout(POLL_DEADLINE, discovery.recv_from(&mut self.buf)).await {
                Err(_) => return,
                Ok(Err(err)) => {
                    warn!("Error reading discovery socket: {}", err);
                    return;
                }
                Ok(Ok(received)) => received,
            };

        match Msg::decode(&self.buf[..n]) {
            Ok(Msg::Ping(ping)) => {
                debug!("Discovery ping from {} (respond: {})", from, ping.respond);
                if ping.respond {
                    self.update_listener(from);
                    self.send(&Msg::Device(snapshot.clone()), from).await;
                }
            }
            Ok(other) => warn!(
                "Ignoring {} message on discovery group from {}",
                other.kind(),
                from
            ),
            Err(err) => warn!("Dropping bad discovery packet from {}: {}", from, err),
        }
    }

    /// Sends `snapshot` to every live listener, dropping the expired ones.
    pub async fn broadcast(&mut self, snapshot: &Device) {
        self.broadcast_at(snapshot, Utc::now()).await;
    }

    async fn broadcast_at(&mut self, snapshot: &Device, now: DateTime<Utc>) {
        let targets = self.listeners.sweep(now);
        if targets.is_empty() {
            debug!("No listeners to broadcast to");
            return;
        }
        let frame = match Msg::Device(snapshot.clone()).encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!("Error encoding snapshot: {}", err);
                return;
            }
        };
        debug!("Broadcasting snapshot to {} listeners", targets.len());
        for addr in targets {
            self.send_frame(&frame, addr).await;
        }
    }

    /// Reads one envelope from the direct socket, waiting at most
    /// [`POLL_DEADLINE`].
    pub async fn poll_direct(&mut self) -> Option<Inbound> {
        match tokio::time::timeout(POLL_DEADLINE, self.direct.recv_from(&mut self.buf)).await {
            Err(_) => None,
            Ok(received) => self.decode_direct(received),
        }
    }

    /// Like [`Presence::poll_direct`] but waits until a datagram arrives.
    /// Packets that fail to decode are reported as `None`.
    pub async fn recv_direct(&mut self) -> Option<Inbound> {
        let received = self.direct.recv_from(&mut self.buf).await;
        self.decode_direct(received)
    }

    fn decode_direct(&self, received: std::io::Result<(usize, SocketAddr)>) -> Option<Inbound> {
        let (n, from) = match received {
            Ok(received) => received,
            Err(err) => {
                warn!("Error reading direct socket: {}", err);
                return None;
            }
        };
        match Msg::decode(&self.buf[..n]) {
            Ok(msg) => {
                debug!("Received {} message from {}", msg.kind(), from);
                Some(Inbound { from, msg })
            }
            Err(err) => {
                warn!("Dropping bad packet from {}: {}", from, err);
                None
            }
        }
    }

    /// Asks every node on the group to register us and send its state.
    pub async fn request_updates(&self) {
        self.send(&Msg::Ping(Ping { respond: true }), self.group).await;
    }

    /// Fire-and-forget send; failures are logged and not retried.
    pub async fn send(&self, msg: &Msg, addr: SocketAddr) {
        if let Err(err) = self.try_send(msg, addr).await {
            error!("{:#}", err);
        }
    }

    pub async fn try_send(&self, msg: &Msg, addr: SocketAddr) -> anyhow::Result<()> {
        let frame = msg
            .encode()
            .with_context(|| format!("encoding {} message", msg.kind()))?;
        self.direct
            .send_to(&frame, addr)
            .await
            .with_context(|| format!("sending to {addr}"))?;
        Ok(())
    }

    async fn send_frame(&self, frame: &[u8], addr: SocketAddr) {
        if let Err(err) = self.direct.send_to(frame, addr).await {
            error!("Error sending to {}: {}", addr, err);
        }
    }
}

/// Binds `0.0.0.0:port` so that every node on the host can share the
/// discovery group.
fn bind_shared(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Works out the discovery group and the local IPv4 address to bind.
async fn resolve(config: &NetworkConfig) -> anyhow::Result<(SocketAddrV4, Ipv4Addr)> {
    let group = config.discovery()?;
    if !group.ip().is_multicast() {
        bail!("discovery address {group} is not a multicast group");
    }
    let ip = match config.interface {
        Some(ip) => ip,
        None => route_to(group).await?,
    };
    Ok((group, ip))
}

/// The local address the OS would use to reach `group`. Connecting a UDP
/// socket sends nothing; it only picks a route.
async fn route_to(group: SocketAddrV4) -> anyhow::Result<Ipv4Addr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    probe
        .connect(group)
        .await
        .with_context(|| format!("no route to {group}"))?;
    match probe.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => bail!("no usable IPv4 interface (got {other})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Switch;
    use chrono::Duration as TimeDelta;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_update_listener_upserts() {
        let now = Utc::now();
        let mut listeners = Listeners::default();
        listeners.update(addr("10.0.0.5:4000"), now - TimeDelta::minutes(10));
        listeners.update(addr("10.0.0.6:4000"), now);
        listeners.update(addr("10.0.0.5:4000"), now);

        assert_eq!(listeners.len(), 2);
        assert!(listeners.entries.iter().all(|l| l.last_ping_unix == now.timestamp()));
    }

    #[test]
    fn test_sweep_drops_idle_listeners() {
        let now = Utc::now();
        let mut listeners = Listeners::default();
        listeners.update(addr("10.0.0.5:4000"), now - TimeDelta::minutes(31));
        listeners.update(addr("10.0.0.6:4000"), now - TimeDelta::minutes(30));
        listeners.update(addr("10.0.0.7:4000"), now);

        let live = listeners.sweep(now);
        assert_eq!(live, vec![addr("10.0.0.6:4000"), addr("10.0.0.7:4000")]);
        assert_eq!(listeners.len(), 2);
    }

    async fn loopback() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn node() -> Presence {
        let discovery = loopback().await;
        let group = discovery.local_addr().unwrap();
        Presence::from_sockets(loopback().await, Some(discovery), group).unwrap()
    }

    async fn recv(socket: &UdpSocket) -> (Msg, SocketAddr) {
        let mut buf = [0u8; RECV_BUFFER];
        let (n, from) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (Msg::decode(&buf[..n]).unwrap(), from)
    }

    fn snapshot(presence: &Presence) -> Device {
        let mut device = Device::new("Fireplace", presence.local_addr().to_string());
        device.switch = Some(Switch { on: true });
        device
    }

    #[tokio::test]
    async fn test_discovery_ping_gets_snapshot() {
        let mut presence = node().await;
        let watcher = loopback().await;
        let frame = Msg::Ping(Ping { respond: true }).encode().unwrap();
        watcher.send_to(&frame, presence.group).await.unwrap();

        let device = snapshot(&presence);
        presence.poll_discovery(&device).await;

        let (msg, from) = recv(&watcher).await;
        assert_eq!(msg, Msg::Device(device));
        assert_eq!(from, presence.local_addr());
        assert_eq!(presence.listeners().len(), 1);
    }

    #[tokio::test]
    async fn test_beacon_ping_is_not_answered() {
        let mut presence = node().await;
        let watcher = loopback().await;
        let frame = Msg::Ping(Ping { respond: false }).encode().unwrap();
        watcher.send_to(&frame, presence.group).await.unwrap();

        presence.poll_discovery(&snapshot(&presence)).await;
        assert!(presence.listeners().is_empty());
    }

    #[tokio::test]
    async fn test_poll_direct_decodes_and_drops_garbage() {
        let mut presence = node().await;
        let sender = loopback().await;

        assert_eq!(presence.poll_direct().await, None);

        sender
            .send_to(&[0xff, 0x00], presence.local_addr())
            .await
            .unwrap();
        let frame = Msg::Switch(Switch { on: false }).encode().unwrap();
        sender.send_to(&frame, presence.local_addr()).await.unwrap();

        assert_eq!(presence.poll_direct().await, None);
        let inbound = presence.poll_direct().await.unwrap();
        assert_eq!(inbound.msg, Msg::Switch(Switch { on: false }));
        assert_eq!(inbound.from, sender.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_prunes_expired_listeners() {
        let mut presence = node().await;
        let stale = loopback().await;
        let live = loopback().await;
        let now = Utc::now();
        presence
            .listeners
            .update(stale.local_addr().unwrap(), now - TimeDelta::minutes(31));
        presence.listeners.update(live.local_addr().unwrap(), now);

        let device = snapshot(&presence);
        presence.broadcast_at(&device, now).await;

        assert_eq!(presence.listeners().len(), 1);
        assert_eq!(recv(&live).await.0, Msg::Device(device));

        let mut buf = [0u8; 64];
        let nothing =
            tokio::time::timeout(Duration::from_millis(50), stale.recv_from(&mut buf)).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_two_nodes_share_the_discovery_port() {
        let config = NetworkConfig {
            discovery: Some("225.1.2.3:18778".to_string()),
            interface: Some(Ipv4Addr::LOCALHOST),
        };
        let first = Presence::announce(&config).await.unwrap();
        let second = Presence::announce(&config).await.unwrap();
        assert_ne!(first.local_addr(), second.local_addr());
    }

    #[tokio::test]
    async fn test_try_send_reports_failures() {
        let presence = node().await;
        let peer = loopback().await;
        let addr = peer.local_addr().unwrap();

        let msg = Msg::Switch(Switch { on: true });
        presence.try_send(&msg, addr).await.unwrap();
        assert_eq!(recv(&peer).await.0, msg);

        let oversized = Msg::Device(Device::new(&"x".repeat(2048), "127.0.0.1:1"));
        assert!(presence.try_send(&oversized, addr).await.is_err());
    }
}

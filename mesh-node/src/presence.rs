//! Presence over UDP: the primary endpoint is a LAN multicast group, the fallback a unicast relay
//! (`mesh-node --relay`). Beacons wrap core packets with the sender's transport port.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_core::{Endpoint, Packet, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::driver::Event;

/// Relay forgets clients silent for this long.
const RELAY_CLIENT_TTL: Duration = Duration::from_secs(30);
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub version: u8,
    pub topic: String,
    /// TCP port the sender accepts peers on.
    pub listen_port: u16,
    pub packet: Packet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Datagram {
    /// Register with a relay without publishing.
    Join,
    Beacon(Beacon),
    /// A beacon forwarded by the relay, with the address it came from.
    Relayed { origin: SocketAddr, beacon: Beacon },
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub port: u16,
    pub group: Ipv4Addr,
    pub relay: Option<SocketAddr>,
    pub listen_port: u16,
}

enum Command {
    Subscribe(String),
    Publish(String, Packet),
}

/// One live presence session.
pub struct Session {
    pub id: u64,
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Session {
    pub fn subscribe(&self, topic: String) {
        let _ = self.tx.send(Command::Subscribe(topic));
    }

    pub fn publish(&self, topic: String, packet: Packet) {
        let _ = self.tx.send(Command::Publish(topic, packet));
    }

    /// Intentional close; the core is not notified.
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Start a session against `endpoint`. Reports `PresenceUp` once the socket is ready, then
/// `PresenceMessage` per beacon and `PresenceDown` on failure.
pub fn connect(
    cfg: PresenceConfig,
    endpoint: Endpoint,
    timeout: Duration,
    session: u64,
    events: mpsc::UnboundedSender<Event>,
) -> Session {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let setup = tokio::time::timeout(timeout, open_socket(&cfg, endpoint)).await;
        let (socket, dest) = match setup {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                let _ = events.send(Event::PresenceDown {
                    session,
                    reason: e.to_string(),
                });
                return;
            }
            Err(_) => return, // the core's own timer reports this
        };
        let _ = events.send(Event::PresenceUp { session });
        let reason = run_session(socket, dest, cfg.listen_port, rx, session, &events).await;
        let _ = events.send(Event::PresenceDown { session, reason });
    });
    Session { id: session, tx, task }
}

async fn open_socket(cfg: &PresenceConfig, endpoint: Endpoint) -> std::io::Result<(UdpSocket, SocketAddr)> {
    match endpoint {
        Endpoint::Primary => {
            let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.port))?;
            std_sock.join_multicast_v4(&cfg.group, &Ipv4Addr::UNSPECIFIED)?;
            std_sock.set_multicast_ttl_v4(1)?;
            std_sock.set_nonblocking(true)?;
            Ok((UdpSocket::from_std(std_sock)?, SocketAddr::from((cfg.group, cfg.port))))
        }
        Endpoint::Fallback => {
            let relay = cfg.relay.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no fallback relay configured")
            })?;
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
            socket.send_to(&encode(&Datagram::Join)?, relay).await?;
            Ok((socket, relay))
        }
    }
}

async fn run_session(
    socket: UdpSocket,
    dest: SocketAddr,
    listen_port: u16,
    mut rx: mpsc::UnboundedReceiver<Command>,
    session: u64,
    events: &mpsc::UnboundedSender<Event>,
) -> String {
    let mut topics = HashSet::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Subscribe(topic)) => {
                    topics.insert(topic);
                }
                Some(Command::Publish(topic, packet)) => {
                    let beacon = Datagram::Beacon(Beacon {
                        version: PROTOCOL_VERSION,
                        topic,
                        listen_port,
                        packet,
                    });
                    let sent = match encode(&beacon) {
                        Ok(bytes) => socket.send_to(&bytes, dest).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        return format!("publish failed: {e}");
                    }
                }
                None => return mesh_core::CLEAN_DISCONNECT.to_owned(),
            },
            r = socket.recv_from(&mut buf) => {
                let (n, from) = match r {
                    Ok(x) => x,
                    Err(e) => return e.to_string(),
                };
                let (origin, beacon) = match bincode::deserialize::<Datagram>(&buf[..n]) {
                    Ok(Datagram::Beacon(b)) => (from, b),
                    Ok(Datagram::Relayed { origin, beacon }) => (origin, beacon),
                    Ok(Datagram::Join) => continue,
                    Err(e) => {
                        tracing::trace!(%from, error = %e, "ignoring malformed beacon");
                        continue;
                    }
                };
                if beacon.version != PROTOCOL_VERSION || !topics.contains(&beacon.topic) {
                    continue;
                }
                let _ = events.send(Event::PresenceMessage {
                    session,
                    packet: beacon.packet,
                    addr: SocketAddr::new(origin.ip(), beacon.listen_port),
                });
            }
        }
    }
}

fn encode(d: &Datagram) -> std::io::Result<Vec<u8>> {
    bincode::serialize(d).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Fallback relay: forwards every beacon to every other client heard from recently.
pub async fn run_relay(port: u16) -> std::io::Result<()> {
    let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?);
    tracing::info!(port, "presence relay listening");
    let mut relay = Relay::default();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok(datagram) = bincode::deserialize::<Datagram>(&buf[..n]) else {
            continue;
        };
        for (to, bytes) in relay.on_datagram(from, datagram, Instant::now()) {
            if let Err(e) = socket.send_to(&bytes, to).await {
                tracing::debug!(%to, error = %e, "relay send failed");
            }
        }
    }
}

#[derive(Default)]
struct Relay {
    clients: HashMap<SocketAddr, Instant>,
}

impl Relay {
    fn on_datagram(&mut self, from: SocketAddr, datagram: Datagram, now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
        self.clients
            .retain(|_, seen| now.saturating_duration_since(*seen) < RELAY_CLIENT_TTL);
        self.clients.insert(from, now);
        let Datagram::Beacon(beacon) = datagram else {
            return Vec::new();
        };
        let Ok(bytes) = encode(&Datagram::Relayed {
            origin: from,
            beacon,
        }) else {
            return Vec::new();
        };
        self.clients
            .keys()
            .filter(|c| **c != from)
            .map(|c| (*c, bytes.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::PeerId;

    fn beacon() -> Beacon {
        Beacon {
            version: PROTOCOL_VERSION,
            topic: mesh_core::PRESENCE_TOPIC.into(),
            listen_port: 47800,
            packet: Packet::HubPulse {
                peer_id: PeerId::from("a"),
                origin: PeerId::from("a"),
                slot: None,
                clock: 3,
            },
        }
    }

    #[test]
    fn relay_forwards_to_other_live_clients() {
        let mut relay = Relay::default();
        let t0 = Instant::now();
        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:5000".parse().unwrap();
        assert!(relay.on_datagram(b, Datagram::Join, t0).is_empty());
        assert!(relay.on_datagram(c, Datagram::Join, t0).is_empty());

        let later = t0 + Duration::from_secs(20);
        relay.on_datagram(c, Datagram::Join, later);
        let out = relay.on_datagram(a, Datagram::Beacon(beacon()), t0 + RELAY_CLIENT_TTL);
        let targets: Vec<SocketAddr> = out.iter().map(|(to, _)| *to).collect();
        assert_eq!(targets, vec![c], "b expired, a is the sender");

        let decoded: Datagram = bincode::deserialize(&out[0].1).unwrap();
        assert_eq!(
            decoded,
            Datagram::Relayed {
                origin: a,
                beacon: beacon()
            }
        );
    }

    #[tokio::test]
    async fn fallback_without_relay_reports_down() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cfg = PresenceConfig {
            port: 0,
            group: Ipv4Addr::new(239, 255, 60, 61),
            relay: None,
            listen_port: 47800,
        };
        let _session = connect(cfg, Endpoint::Fallback, Duration::from_secs(1), 7, tx);
        match rx.recv().await.unwrap() {
            Event::PresenceDown { session, reason } => {
                assert_eq!(session, 7);
                assert!(reason.contains("relay"));
            }
            _ => panic!("expected PresenceDown"),
        }
    }
}

//! Peer mesh: one connection entry per remote transport identity, ceilings,
//! handshake timeouts, keepalive and reaping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::config::MeshConfig;
use crate::core::{Action, Timer};
use crate::protocol::{Packet, PeerId};
use crate::wire::Payload;

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closed,
}

/// One connection, keyed by the remote transport identity.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub peer_id: PeerId,
    /// Display name from the remote HELLO.
    pub label: Option<String>,
    /// Stable identity from the remote HELLO (differs from `peer_id` for rendezvous holders).
    pub identity: Option<PeerId>,
    pub state: ConnState,
    pub created_at: Instant,
    pub last_pong_at: Instant,
    /// Distinguishes this connection object from earlier ones to the same peer.
    pub epoch: u64,
    pub inbound: bool,
}

/// Snapshot of a connection for hosts (console listing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub identity: Option<PeerId>,
    pub label: Option<String>,
    pub state: ConnState,
    pub inbound: bool,
}

/// Owns the connection map.
pub struct PeerMesh {
    self_id: PeerId,
    conns: HashMap<PeerId, PeerConnection>,
    next_epoch: u64,
    hub: bool,
    max_peers: usize,
    max_peers_hub: usize,
    grace: usize,
    fanout: usize,
    handshake_timeout: Duration,
    pong_timeout: Duration,
}

impl PeerMesh {
    pub fn new(self_id: PeerId, config: &MeshConfig) -> Self {
        Self {
            self_id,
            conns: HashMap::new(),
            next_epoch: 1,
            hub: false,
            max_peers: config.max_peers,
            max_peers_hub: config.max_peers_hub,
            grace: config.peer_grace,
            fanout: config.gossip_fanout.max(1),
            handshake_timeout: config.handshake_timeout(),
            pong_timeout: config.pong_timeout(),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Change the local transport identity (rendezvous claim or resignation).
    pub fn set_self_id(&mut self, id: PeerId) {
        self.self_id = id;
    }

    pub fn set_hub(&mut self, hub: bool) {
        self.hub = hub;
    }

    /// Soft ceiling: outbound dials and peer-exchange stop here.
    pub fn ceiling(&self) -> usize {
        if self.hub {
            self.max_peers_hub
        } else {
            self.max_peers
        }
    }

    /// Hard bound for inbound accepts.
    pub fn hard_limit(&self) -> usize {
        self.ceiling() + self.grace
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.conns.contains_key(peer)
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.conns
            .get(peer)
            .is_some_and(|c| c.state == ConnState::Open)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerConnection> {
        self.conns.get(peer)
    }

    /// Epoch of the current connection object for `peer`.
    pub fn epoch_of(&self, peer: &PeerId) -> Option<u64> {
        self.conns.get(peer).map(|c| c.epoch)
    }

    /// Dials that have not reached open yet.
    pub fn pending_count(&self) -> usize {
        self.conns
            .values()
            .filter(|c| c.state == ConnState::Connecting)
            .count()
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .conns
            .values()
            .filter(|c| c.state == ConnState::Open)
            .map(|c| c.peer_id.clone())
            .collect();
        out.sort();
        out
    }

    /// Open connection reaching `id`, matched by transport identity first, then by HELLO identity.
    pub fn resolve(&self, id: &PeerId) -> Option<PeerId> {
        if self.is_open(id) {
            return Some(id.clone());
        }
        self.conns
            .values()
            .find(|c| c.state == ConnState::Open && c.identity.as_ref() == Some(id))
            .map(|c| c.peer_id.clone())
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self
            .conns
            .values()
            .map(|c| PeerSummary {
                peer_id: c.peer_id.clone(),
                identity: c.identity.clone(),
                label: c.label.clone(),
                state: c.state,
                inbound: c.inbound,
            })
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    fn bump_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    /// Dial `peer`. No-op if it is self or a connection is open or mid-handshake.
    /// A stale entry (closed) is wiped before dialing. Returns true if a dial was issued.
    pub fn connect(&mut self, peer: &PeerId, now: Instant, out: &mut Vec<Action>) -> bool {
        if *peer == self.self_id {
            return false;
        }
        match self.conns.get(peer).map(|c| c.state) {
            Some(ConnState::Open) | Some(ConnState::Connecting) => return false,
            Some(ConnState::Closed) => self.teardown(peer, out),
            None => {}
        }
        let epoch = self.bump_epoch();
        self.conns.insert(
            peer.clone(),
            PeerConnection {
                peer_id: peer.clone(),
                label: None,
                identity: None,
                state: ConnState::Connecting,
                created_at: now,
                last_pong_at: now,
                epoch,
                inbound: false,
            },
        );
        tracing::debug!(%peer, epoch, "dialing");
        out.push(Action::Dial {
            peer: peer.clone(),
            epoch,
        });
        out.push(Action::Schedule {
            after: self.handshake_timeout,
            timer: Timer::Handshake {
                peer: peer.clone(),
                epoch,
            },
        });
        true
    }

    /// Register an already-open inbound connection. Returns its epoch, or `None` if refused
    /// because the hard limit is reached (the host closes the new handle).
    /// Any previous connection object to the same peer is replaced.
    pub fn accept_inbound(&mut self, peer: &PeerId, now: Instant, out: &mut Vec<Action>) -> Option<u64> {
        if *peer == self.self_id {
            return None;
        }
        let replacing = self.conns.contains_key(peer);
        if !replacing && self.conns.len() >= self.hard_limit() {
            tracing::debug!(%peer, count = self.conns.len(), "inbound refused: peer ceiling");
            return None;
        }
        if replacing {
            self.teardown(peer, out);
        }
        let epoch = self.bump_epoch();
        self.conns.insert(
            peer.clone(),
            PeerConnection {
                peer_id: peer.clone(),
                label: None,
                identity: None,
                state: ConnState::Open,
                created_at: now,
                last_pong_at: now,
                epoch,
                inbound: true,
            },
        );
        Some(epoch)
    }

    /// Handshake finished for an outbound dial. Returns false for unknown or stale epochs.
    pub fn mark_open(&mut self, peer: &PeerId, epoch: u64, now: Instant) -> bool {
        match self.conns.get_mut(peer) {
            Some(c) if c.epoch == epoch && c.state == ConnState::Connecting => {
                c.state = ConnState::Open;
                c.last_pong_at = now;
                true
            }
            _ => false,
        }
    }

    /// True if `epoch` names the live connection object for `peer`.
    pub fn is_current(&self, peer: &PeerId, epoch: u64) -> bool {
        self.conns.get(peer).is_some_and(|c| c.epoch == epoch)
    }

    pub fn on_pong(&mut self, peer: &PeerId, now: Instant) {
        if let Some(c) = self.conns.get_mut(peer) {
            c.last_pong_at = now;
        }
    }

    pub fn set_hello(&mut self, peer: &PeerId, identity: PeerId, label: String) {
        if let Some(c) = self.conns.get_mut(peer) {
            c.identity = Some(identity);
            c.label = Some(label);
        }
    }

    /// Single teardown path: remove the entry and ask the host to close the handle.
    /// Timers armed for it become stale through the epoch check.
    pub fn teardown(&mut self, peer: &PeerId, out: &mut Vec<Action>) {
        if let Some(mut c) = self.conns.remove(peer) {
            c.state = ConnState::Closed;
            tracing::debug!(%peer, epoch = c.epoch, "connection torn down");
            out.push(Action::Close {
                peer: c.peer_id,
                epoch: c.epoch,
            });
        }
    }

    pub fn close_all(&mut self, out: &mut Vec<Action>) {
        let peers: Vec<PeerId> = self.conns.keys().cloned().collect();
        for p in peers {
            self.teardown(&p, out);
        }
    }

    /// Up to `fanout` known transport identities, self included.
    pub fn sample(&self) -> Vec<PeerId> {
        let mut open = self.open_peers();
        open.shuffle(&mut rand::thread_rng());
        std::iter::once(self.self_id.clone())
            .chain(open)
            .take(self.fanout)
            .collect()
    }

    /// Dial peers learned through peer exchange while below the soft ceiling.
    pub fn absorb_peer_ex(&mut self, peers: &[PeerId], now: Instant, out: &mut Vec<Action>) {
        for p in peers {
            if self.conns.len() >= self.ceiling() {
                break;
            }
            if *p == self.self_id || self.conns.contains_key(p) {
                continue;
            }
            self.connect(p, now, out);
        }
    }

    /// Once-per-second maintenance: reap stuck dials and silent peers, then ping and re-gossip.
    pub fn maintain(&mut self, now: Instant, out: &mut Vec<Action>) -> Vec<PeerId> {
        let reaped: Vec<PeerId> = self
            .conns
            .values()
            .filter(|c| match c.state {
                ConnState::Connecting => now.saturating_duration_since(c.created_at) > self.handshake_timeout,
                ConnState::Open => {
                    !c.peer_id.is_hub()
                        && now.saturating_duration_since(c.last_pong_at) > self.pong_timeout
                }
                ConnState::Closed => true,
            })
            .map(|c| c.peer_id.clone())
            .collect();
        for p in &reaped {
            tracing::debug!(peer = %p, "reaping connection");
            self.teardown(p, out);
        }

        let open = self.open_peers();
        if !open.is_empty() {
            let sample = self.sample();
            for p in open {
                out.push(Action::Send {
                    peer: p.clone(),
                    payload: Payload::Packet(Packet::Ping),
                });
                out.push(Action::Send {
                    peer: p,
                    payload: Payload::Packet(Packet::PeerEx {
                        peers: sample.clone(),
                    }),
                });
            }
        }
        reaped
    }
}

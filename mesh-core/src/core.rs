//! Host-driven API: MeshCore receives events from the host and returns actions.
//!
//! Every piece of shared state (connections, seen set, pending queue, transfer tasks) lives behind
//! `&mut self`, so the host serialises all work simply by owning the core.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::chunk::ChunkSpan;
use crate::config::MeshConfig;
use crate::gossip::{GossipRouter, Interceptor, Receipt, Route};
use crate::hub::HubCoordinator;
use crate::mesh::{ConnState, PeerMesh, PeerSummary};
use crate::presence::{PresenceAction, PresenceChannel, PresenceState, PRESENCE_TOPIC};
use crate::protocol::{ChatMessage, Contact, FileMeta, MessageBody, Packet, PeerId, Target};
use crate::queue::{self, RetryStats};
use crate::seen::SeenSet;
use crate::store::{ObjectStore, Store};
use crate::transfer::{self, StreamEvent, TransferEngine, TransferError};
use crate::wire::Payload;

/// Delay bounds before asking a freshly opened peer for missed history.
const CATCH_UP_DELAY_MS: (u64, u64) = (100, 500);

/// Deferred work. Each timer names the object it belongs to; a timer whose epoch or session
/// no longer matches is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Timer {
    Handshake { peer: PeerId, epoch: u64 },
    CatchUp { peer: PeerId, epoch: u64 },
    PresenceTimeout { session: u64 },
    PresenceRetry { session: u64 },
}

/// Work the host must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a transport connection to `peer`; report back with `on_dialed` or `on_error`.
    Dial { peer: PeerId, epoch: u64 },
    Send { peer: PeerId, payload: Payload },
    Close { peer: PeerId, epoch: u64 },
    /// Call `on_timer(timer)` after the delay.
    Schedule { after: Duration, timer: Timer },
    Presence(PresenceAction),
    /// Listen under a new transport identity; answer with `on_identity_bound` or `on_identity_conflict`.
    BindIdentity(PeerId),
    /// Present a message to the user.
    Deliver(ChatMessage),
    Stream(StreamEvent),
}

/// Outcome of an inbound connection attempt.
#[derive(Debug)]
pub enum Inbound {
    Accepted { epoch: u64, actions: Vec<Action> },
    /// Peer ceiling reached; the host closes the new handle.
    Refused,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct MeshCore {
    config: MeshConfig,
    identity: PeerId,
    mesh: PeerMesh,
    hub: HubCoordinator,
    presence: PresenceChannel,
    gossip: GossipRouter,
    transfers: TransferEngine,
    store: Box<dyn Store>,
    objects: Box<dyn ObjectStore>,
}

impl MeshCore {
    pub fn new(
        identity: PeerId,
        name: impl Into<String>,
        config: MeshConfig,
        store: Box<dyn Store>,
        objects: Box<dyn ObjectStore>,
        now: Instant,
    ) -> Self {
        let seen = SeenSet::new(config.seen_capacity, config.seen_evict);
        let mut gossip = GossipRouter::new(identity.clone(), name.into(), seen, config.default_ttl);
        if let Some(last) = store.get_recent(1, None, None).last() {
            gossip.observe(last.logical_time());
        }
        let transfers = TransferEngine::new(config.chunk_size, config.window, config.chunk_timeout());
        gossip.register(Box::new(transfers.capture()));
        Self {
            mesh: PeerMesh::new(identity.clone(), &config),
            hub: HubCoordinator::new(now, config.hub_stale()),
            presence: PresenceChannel::new(&config),
            transfers,
            gossip,
            identity,
            config,
            store,
            objects,
        }
    }

    /// Stable identity: sender id on messages and contact key.
    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// Current transport identity (a rendezvous id while holding a slot).
    pub fn network_id(&self) -> &PeerId {
        self.mesh.self_id()
    }

    pub fn name(&self) -> &str {
        self.gossip.name()
    }

    pub fn clock(&self) -> u64 {
        self.gossip.clock()
    }

    pub fn is_hub(&self) -> bool {
        self.hub.is_hub()
    }

    pub fn presence_state(&self) -> PresenceState {
        self.presence.state()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.mesh.summaries()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.store.contacts()
    }

    /// Newest `limit` messages before `before`, ascending.
    pub fn history(&self, limit: usize, target: Option<&Target>, before: Option<u64>) -> Vec<ChatMessage> {
        self.store.get_recent(limit, target, before)
    }

    pub fn pending(&self) -> usize {
        self.store.list().len()
    }

    pub fn known_file(&self, file_id: &str) -> Option<FileMeta> {
        self.objects
            .meta(file_id)
            .or_else(|| self.transfers.meta(file_id).cloned())
    }

    /// Append to the gossip interceptor chain. The file-share capture is always first.
    pub fn register_interceptor(&mut self, interceptor: Box<dyn Interceptor>) {
        self.gossip.register(interceptor);
    }

    /// Bring up presence and start patrolling the rendezvous identities.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.presence.start(&mut out);
        self.hub.patrol(&mut self.mesh, now, &mut out);
        out
    }

    // ---- connections ----

    /// Outbound dial reached open.
    pub fn on_dialed(&mut self, peer: &PeerId, epoch: u64, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.mesh.mark_open(peer, epoch, now) {
            tracing::debug!(%peer, epoch, "connection open");
            self.greet(peer, epoch, &mut out);
        } else {
            tracing::debug!(%peer, epoch, "dial completed for a stale connection");
            out.push(Action::Close {
                peer: peer.clone(),
                epoch,
            });
        }
        out
    }

    /// A remote opened a connection to us.
    pub fn on_inbound(&mut self, peer: &PeerId, now: Instant) -> Inbound {
        let mut out = Vec::new();
        match self.mesh.accept_inbound(peer, now, &mut out) {
            Some(epoch) => {
                tracing::debug!(%peer, epoch, "inbound connection");
                self.greet(peer, epoch, &mut out);
                Inbound::Accepted {
                    epoch,
                    actions: out,
                }
            }
            None => Inbound::Refused,
        }
    }

    /// HELLO, PEER_EX, a delayed catch-up request and pending WHO_HAS queries on every newly
    /// opened connection.
    fn greet(&mut self, peer: &PeerId, epoch: u64, out: &mut Vec<Action>) {
        out.push(Action::Send {
            peer: peer.clone(),
            payload: Payload::Packet(Packet::Hello {
                peer_id: self.identity.clone(),
                name: self.gossip.name().to_owned(),
                network_id: self.mesh.self_id().clone(),
            }),
        });
        out.push(Action::Send {
            peer: peer.clone(),
            payload: Payload::Packet(Packet::PeerEx {
                peers: self.mesh.sample(),
            }),
        });
        let delay = rand::thread_rng().gen_range(CATCH_UP_DELAY_MS.0..=CATCH_UP_DELAY_MS.1);
        out.push(Action::Schedule {
            after: Duration::from_millis(delay),
            timer: Timer::CatchUp {
                peer: peer.clone(),
                epoch,
            },
        });
        self.transfers.on_peer_open(peer, out);
    }

    pub fn on_closed(&mut self, peer: &PeerId, epoch: u64) -> Vec<Action> {
        let mut out = Vec::new();
        if self.mesh.is_current(peer, epoch) {
            self.mesh.teardown(peer, &mut out);
        }
        out
    }

    /// Transport error: same teardown path as a close.
    pub fn on_error(&mut self, peer: &PeerId, epoch: u64, reason: &str) -> Vec<Action> {
        tracing::debug!(%peer, epoch, reason, "transport error");
        self.on_closed(peer, epoch)
    }

    /// One decoded payload from `peer`.
    pub fn on_data(&mut self, peer: &PeerId, epoch: u64, payload: Payload, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if !self.mesh.is_current(peer, epoch) || !self.mesh.is_open(peer) {
            tracing::trace!(%peer, epoch, "data on stale connection");
            return out;
        }
        match payload {
            Payload::Packet(packet) => self.on_packet(peer, packet, now, &mut out),
            Payload::Binary(frame) => {
                self.transfers
                    .on_chunk_frame(&frame, &mut self.mesh, now, &mut out)
            }
        }
        out
    }

    fn on_packet(&mut self, peer: &PeerId, packet: Packet, now: Instant, out: &mut Vec<Action>) {
        tracing::trace!(%peer, kind = packet.kind(), "packet");
        match packet {
            Packet::Ping => out.push(Action::Send {
                peer: peer.clone(),
                payload: Payload::Packet(Packet::Pong),
            }),
            Packet::Pong => self.mesh.on_pong(peer, now),
            Packet::Hello {
                peer_id,
                name,
                network_id,
            } => {
                if peer_id == self.identity {
                    tracing::warn!(%peer, %network_id, "remote claims our identity");
                    self.regenerate_identity(out);
                    return;
                }
                self.store.put_contact(&Contact {
                    peer_id: peer_id.clone(),
                    display_name: name.clone(),
                    last_seen_at: self.gossip.clock(),
                });
                self.mesh.set_hello(peer, peer_id, name);
            }
            Packet::PeerEx { peers } => self.mesh.absorb_peer_ex(&peers, now, out),
            Packet::AskPub { since } => {
                let messages = self.store.get_after(since, self.config.catch_up_limit);
                if !messages.is_empty() {
                    out.push(Action::Send {
                        peer: peer.clone(),
                        payload: Payload::Packet(Packet::RepPub { messages }),
                    });
                }
            }
            Packet::RepPub { messages } => {
                for message in messages {
                    self.route_message(message, Some(peer), false, out);
                }
            }
            Packet::Msg(message) => self.route_message(message, Some(peer), true, out),
            Packet::HubPulse { .. } => {
                tracing::debug!(%peer, "heartbeat on a peer connection, ignoring");
            }
            Packet::WhoHas { file_id } => {
                out.extend(transfer::answer_who_has(&*self.objects, peer, &file_id));
            }
            Packet::Have { file_id, meta } => {
                if meta.file_id != file_id {
                    tracing::debug!(%peer, file_id, "HAVE with mismatched metadata");
                    return;
                }
                self.transfers.on_have(peer, meta, &mut self.mesh, now, out);
            }
            Packet::Get {
                request_id,
                file_id,
                offset,
                size,
            } => {
                if size == 0 || size > self.config.chunk_size {
                    tracing::debug!(%peer, size, "GET with invalid size");
                    return;
                }
                let span = ChunkSpan { offset, len: size };
                out.extend(transfer::serve_get(&*self.objects, peer, request_id, &file_id, span));
            }
        }
    }

    fn route_message(&mut self, message: ChatMessage, from: Option<&PeerId>, relay: bool, out: &mut Vec<Action>) {
        let open = self.mesh.open_peers();
        let direct = match &message.target {
            Target::Peer(t) => self.mesh.resolve(t),
            Target::Broadcast => None,
        };
        let network_id = self.mesh.self_id().clone();
        let route = Route {
            from,
            network_id: &network_id,
            open_peers: &open,
            direct: direct.as_ref(),
            relay,
        };
        let Receipt {
            delivered,
            forwards,
            ..
        } = self.gossip.receive(message, route, &mut *self.store);
        self.transfers.absorb_shares();
        for (peer, hop) in forwards {
            out.push(Action::Send {
                peer,
                payload: Payload::Packet(Packet::Msg(hop)),
            });
        }
        if let Some(message) = delivered {
            out.push(Action::Deliver(message));
        }
    }

    // ---- timers ----

    pub fn on_timer(&mut self, timer: Timer, _now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        match timer {
            Timer::Handshake { peer, epoch } => {
                let stuck = self
                    .mesh
                    .get(&peer)
                    .is_some_and(|c| c.epoch == epoch && c.state == ConnState::Connecting);
                if stuck {
                    tracing::debug!(%peer, epoch, "handshake timed out");
                    self.mesh.teardown(&peer, &mut out);
                }
            }
            Timer::CatchUp { peer, epoch } => {
                if self.mesh.is_current(&peer, epoch) && self.mesh.is_open(&peer) {
                    let since = self.store.latest_broadcast_timestamp().unwrap_or(0);
                    out.push(Action::Send {
                        peer,
                        payload: Payload::Packet(Packet::AskPub { since }),
                    });
                }
            }
            Timer::PresenceTimeout { session } => self.presence.on_timeout(session, &mut out),
            Timer::PresenceRetry { session } => self.presence.on_retry(session, &mut out),
        }
        out
    }

    /// Once-per-second maintenance: reaping, keepalive, rendezvous patrol and claim, heartbeat,
    /// delivery retry and the chunk watchdog.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.mesh.maintain(now, &mut out);
        self.hub.patrol(&mut self.mesh, now, &mut out);

        if self.presence.is_connected() {
            if let Some(slot) = self.hub.vacant_slot(now) {
                tracing::info!(slot, "claiming vacant rendezvous identity");
                self.hub.begin_claim(slot);
                out.push(Action::BindIdentity(PeerId::hub(slot)));
            }
        }

        if self.presence.take_pulse(now) {
            out.push(Action::Presence(PresenceAction::Publish {
                topic: PRESENCE_TOPIC.to_owned(),
                packet: Packet::HubPulse {
                    peer_id: self.mesh.self_id().clone(),
                    origin: self.identity.clone(),
                    slot: self.hub.own_slot(),
                    clock: self.gossip.clock(),
                },
            }));
        }

        self.flush_pending(now, &mut out);
        self.transfers.watchdog(&mut self.mesh, now, &mut out);
        self.store.flush();
        out
    }

    fn flush_pending(&mut self, now: Instant, out: &mut Vec<Action>) -> RetryStats {
        let stats = queue::retry_pending(&mut *self.store, &mut self.mesh, now, out);
        if stats != RetryStats::default() {
            tracing::trace!(?stats, "delivery retry pass");
        }
        stats
    }

    // ---- user commands ----

    pub fn send_text(&mut self, text: impl Into<String>, target: Target, now: Instant) -> Vec<Action> {
        self.send(MessageBody::Text(text.into()), target, now)
    }

    /// Keep `bytes` available for download and announce them. The announcement is delivered
    /// locally first, so hosts learn the new file id from the `Deliver` action.
    pub fn send_file_share(
        &mut self,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        bytes: Vec<u8>,
        target: Target,
        now: Instant,
    ) -> Vec<Action> {
        let meta = FileMeta {
            file_id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            file_size: bytes.len() as u64,
            file_type: file_type.into(),
        };
        tracing::info!(file_id = %meta.file_id, size = meta.file_size, "sharing file");
        self.objects.insert(meta.clone(), bytes);
        self.transfers.learn(meta.clone(), None);
        self.send(MessageBody::FileShare(meta), target, now)
    }

    fn send(&mut self, body: MessageBody, target: Target, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        let Some(message) = self.gossip.compose(body, target) else {
            return out;
        };
        self.gossip.deliver_local(&message, &mut *self.store);
        out.push(Action::Deliver(message.clone()));
        queue::enqueue(&mut *self.store, message, self.gossip.clock());
        self.flush_pending(now, &mut out);
        out
    }

    /// Start streaming a file (or an inclusive byte range of it). Returns the request id.
    pub fn open_stream(&mut self, file_id: &str, range: Option<(u64, u64)>, now: Instant) -> (u64, Vec<Action>) {
        let mut out = Vec::new();
        let id = self
            .transfers
            .open(file_id, range, &mut self.mesh, now, &mut out);
        (id, out)
    }

    pub fn cancel_stream(&mut self, request_id: u64) -> Result<(), TransferError> {
        self.transfers.cancel(request_id)
    }

    // ---- presence ----

    pub fn on_presence_connected(&mut self, session: u64, _now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if !self.presence.on_connected(session, &mut out) {
            return out;
        }
        if self.hub.should_resign(self.presence.via_fallback()) {
            self.hub.resign();
            out.push(Action::BindIdentity(self.identity.clone()));
        }
        out
    }

    pub fn on_presence_lost(&mut self, session: u64, reason: &str) -> Vec<Action> {
        let mut out = Vec::new();
        self.presence.on_lost(session, reason, &mut out);
        out
    }

    /// Heartbeat from the presence topic.
    pub fn on_presence_message(&mut self, packet: Packet, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        let (peer_id, origin, slot, clock) = match packet {
            Packet::HubPulse {
                peer_id,
                origin,
                slot,
                clock,
            } => (peer_id, origin, slot, clock),
            other => {
                tracing::debug!(kind = other.kind(), "unexpected packet on presence topic");
                return out;
            }
        };
        if origin == self.identity {
            return out;
        }
        self.gossip.observe(clock);

        if let Some(slot) = slot {
            if self.hub.own_slot() == Some(slot) {
                // Two holders of one slot: the higher identity yields.
                if self.identity > origin {
                    tracing::info!(slot, %origin, "rendezvous slot contested, yielding");
                    self.hub.resign();
                    self.hub.record_pulse(slot, now);
                    out.push(Action::BindIdentity(self.identity.clone()));
                }
                return out;
            }
            self.hub.record_pulse(slot, now);
        }

        if peer_id != *self.mesh.self_id()
            && !self.mesh.contains(&peer_id)
            && self.mesh.pending_count() < self.config.max_pending_dials
            && self.mesh.len() < self.mesh.ceiling()
        {
            self.mesh.connect(&peer_id, now, &mut out);
        }
        out
    }

    // ---- identity ----

    /// The host now listens under `id`. Rebinding closes every connection made under the old one.
    pub fn on_identity_bound(&mut self, id: PeerId, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if id == *self.mesh.self_id() {
            return out;
        }
        match id.hub_slot() {
            Some(slot) if self.hub.pending_claim() == Some(slot) => {
                self.hub
                    .on_bound(slot, self.presence.via_fallback(), now);
                self.mesh.set_hub(true);
            }
            Some(slot) => {
                tracing::debug!(slot, "bound a rendezvous identity we did not claim");
                out.push(Action::BindIdentity(self.identity.clone()));
                return out;
            }
            None if id == self.identity => self.mesh.set_hub(false),
            None => {
                tracing::debug!(%id, "bound an unknown identity");
                return out;
            }
        }
        tracing::info!(%id, "transport identity changed");
        self.mesh.close_all(&mut out);
        self.mesh.set_self_id(id);
        self.presence.reset_pulse();
        self.hub.patrol(&mut self.mesh, now, &mut out);
        out
    }

    /// `id` is already bound elsewhere.
    pub fn on_identity_conflict(&mut self, id: PeerId, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if let Some(slot) = id.hub_slot() {
            tracing::debug!(slot, "rendezvous identity taken");
            self.hub.on_claim_failed(slot, now);
        } else if id == self.identity {
            self.regenerate_identity(&mut out);
        }
        out
    }

    fn regenerate_identity(&mut self, out: &mut Vec<Action>) {
        let fresh = PeerId::generate();
        tracing::warn!(old = %self.identity, new = %fresh, "identity conflict, regenerating");
        self.identity = fresh.clone();
        self.gossip.set_identity(fresh.clone());
        if !self.hub.is_hub() {
            out.push(Action::BindIdentity(fresh));
        }
    }
}

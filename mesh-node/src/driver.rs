//! Event loop around `MeshCore`: turns socket, timer, presence and console events into core
//! calls and carries out the actions it returns. The core is owned here and never shared.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use mesh_core::{Action, Inbound, MeshCore, Packet, Payload, PeerId, PresenceAction, StreamEvent, Target, Timer};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::console::{self, Command};
use crate::presence::{self, PresenceConfig, Session};
use crate::store::DownloadSink;
use crate::transport::{self, Conn};

const TICK: Duration = Duration::from_secs(1);

/// Everything that can wake the driver.
pub enum Event {
    Accepted { conn: Conn, peer: PeerId, addr: SocketAddr },
    Dialed { conn: Conn, peer: PeerId, epoch: u64 },
    DialFailed { peer: PeerId, epoch: u64, reason: String },
    Data { conn_id: u64, payload: Payload },
    /// `reason` is `None` for an orderly close.
    Closed { conn_id: u64, reason: Option<String> },
    Timer(Timer),
    PresenceUp { session: u64 },
    PresenceDown { session: u64, reason: String },
    PresenceMessage { session: u64, packet: Packet, addr: SocketAddr },
    Command(Command),
}

struct Link {
    peer: PeerId,
    epoch: u64,
    conn: Conn,
}

/// Where a transport identity was last heard announcing itself.
struct Sighting {
    addr: SocketAddr,
    origin: PeerId,
    at: Instant,
}

pub struct Driver {
    core: MeshCore,
    events: mpsc::UnboundedSender<Event>,
    links: HashMap<u64, Link>,
    current: HashMap<PeerId, u64>,
    directory: HashMap<PeerId, Sighting>,
    local_id: watch::Sender<PeerId>,
    presence_cfg: PresenceConfig,
    presence: Option<Session>,
    downloads: DownloadSink,
    data_dir: PathBuf,
    listen_port: u16,
    stored_identity: PeerId,
    sighting_ttl: Duration,
}

impl Driver {
    pub fn new(
        core: MeshCore,
        config: &Config,
        events: mpsc::UnboundedSender<Event>,
        local_id: watch::Sender<PeerId>,
    ) -> Self {
        let stored_identity = core.identity().clone();
        Self {
            core,
            events,
            links: HashMap::new(),
            current: HashMap::new(),
            directory: HashMap::new(),
            local_id,
            presence_cfg: PresenceConfig {
                port: config.presence_port,
                group: config.presence_group,
                relay: config.fallback_relay,
                listen_port: config.listen_port,
            },
            presence: None,
            downloads: DownloadSink::new(),
            data_dir: config.data_dir.clone(),
            listen_port: config.listen_port,
            stored_identity,
            sighting_ttl: config.mesh.hub_stale(),
        }
    }

    /// Run until the console quits or the event channel closes.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        let start = self.core.start(Instant::now());
        self.apply(start);
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                ev = rx.recv() => {
                    let Some(ev) = ev else { break };
                    if !self.handle(ev) {
                        break;
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let ttl = self.sighting_ttl;
                    self.directory
                        .retain(|_, s| now.saturating_duration_since(s.at) < ttl * 3);
                    let actions = self.core.tick(now);
                    self.apply(actions);
                }
            }
        }
        if let Some(session) = self.presence.take() {
            session.stop();
        }
        for link in self.links.values() {
            link.conn.close();
        }
    }

    /// Returns false when the node should stop.
    fn handle(&mut self, ev: Event) -> bool {
        let now = Instant::now();
        let actions = match ev {
            Event::Accepted { conn, peer, addr } => {
                self.sighted(&peer, addr, None, now);
                match self.core.on_inbound(&peer, now) {
                    Inbound::Accepted { epoch, actions } => {
                        self.adopt(conn, peer, epoch);
                        actions
                    }
                    Inbound::Refused => {
                        tracing::debug!(%peer, "refusing inbound connection");
                        conn.close();
                        Vec::new()
                    }
                }
            }
            Event::Dialed { conn, peer, epoch } => {
                self.adopt(conn, peer.clone(), epoch);
                self.core.on_dialed(&peer, epoch, now)
            }
            Event::DialFailed { peer, epoch, reason } => self.core.on_error(&peer, epoch, &reason),
            Event::Data { conn_id, payload } => match self.links.get(&conn_id) {
                Some(link) => {
                    let (peer, epoch) = (link.peer.clone(), link.epoch);
                    self.core.on_data(&peer, epoch, payload, now)
                }
                None => Vec::new(),
            },
            Event::Closed { conn_id, reason } => match self.links.remove(&conn_id) {
                Some(link) => {
                    if self.current.get(&link.peer) == Some(&conn_id) {
                        self.current.remove(&link.peer);
                    }
                    match reason {
                        Some(r) => self.core.on_error(&link.peer, link.epoch, &r),
                        None => self.core.on_closed(&link.peer, link.epoch),
                    }
                }
                None => Vec::new(),
            },
            Event::Timer(timer) => self.core.on_timer(timer, now),
            Event::PresenceUp { session } => self.core.on_presence_connected(session, now),
            Event::PresenceDown { session, reason } => {
                if self.presence.as_ref().is_some_and(|s| s.id == session) {
                    self.presence = None;
                }
                self.core.on_presence_lost(session, &reason)
            }
            Event::PresenceMessage {
                session,
                packet,
                addr,
            } => {
                if !self.presence.as_ref().is_some_and(|s| s.id == session) {
                    return true;
                }
                if let Packet::HubPulse { peer_id, origin, .. } = &packet {
                    if origin != self.core.identity() {
                        self.sighted(peer_id, addr, Some(origin.clone()), now);
                    }
                }
                self.core.on_presence_message(packet, now)
            }
            Event::Command(Command::Quit) => return false,
            Event::Command(cmd) => self.command(cmd, now),
        };
        self.apply(actions);
        true
    }

    fn sighted(&mut self, peer: &PeerId, addr: SocketAddr, origin: Option<PeerId>, now: Instant) {
        let origin = origin
            .or_else(|| self.directory.get(peer).map(|s| s.origin.clone()))
            .unwrap_or_else(|| peer.clone());
        self.directory.insert(peer.clone(), Sighting { addr, origin, at: now });
    }

    fn adopt(&mut self, conn: Conn, peer: PeerId, epoch: u64) {
        self.current.insert(peer.clone(), conn.id);
        self.links.insert(conn.id, Link { peer, epoch, conn });
    }

    /// Carry out actions; synchronous follow-ups from the core join the same queue.
    fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            let now = Instant::now();
            let more = match action {
                Action::Dial { peer, epoch } => match self.directory.get(&peer) {
                    Some(s) => {
                        tracing::debug!(%peer, addr = %s.addr, epoch, "dialing");
                        transport::dial(
                            s.addr,
                            self.core.network_id().clone(),
                            self.listen_port,
                            peer,
                            epoch,
                            self.events.clone(),
                        );
                        Vec::new()
                    }
                    None => self.core.on_error(&peer, epoch, "no known address"),
                },
                Action::Send { peer, payload } => {
                    let link = self.current.get(&peer).and_then(|id| self.links.get(id));
                    match link {
                        Some(l) if l.conn.send(payload) => {}
                        _ => tracing::trace!(%peer, "send to unconnected peer dropped"),
                    }
                    Vec::new()
                }
                Action::Close { peer, epoch } => {
                    let found = self
                        .links
                        .iter()
                        .find(|(_, l)| l.peer == peer && l.epoch == epoch)
                        .map(|(id, _)| *id);
                    if let Some(link) = found.and_then(|id| self.links.remove(&id)) {
                        if self.current.get(&peer) == Some(&link.conn.id) {
                            self.current.remove(&peer);
                        }
                        link.conn.close();
                    }
                    Vec::new()
                }
                Action::Schedule { after, timer } => {
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = events.send(Event::Timer(timer));
                    });
                    Vec::new()
                }
                Action::Presence(p) => {
                    self.presence_action(p);
                    Vec::new()
                }
                Action::BindIdentity(id) => self.bind(id, now),
                Action::Deliver(message) => {
                    println!("{}", console::render(&message));
                    Vec::new()
                }
                Action::Stream(event) => {
                    self.stream(event);
                    Vec::new()
                }
            };
            queue.extend(more);
        }
    }

    fn presence_action(&mut self, action: PresenceAction) {
        match action {
            PresenceAction::Connect {
                endpoint,
                timeout,
                session,
            } => {
                if let Some(old) = self.presence.take() {
                    old.stop();
                }
                tracing::debug!(?endpoint, session, "presence connecting");
                self.presence = Some(presence::connect(
                    self.presence_cfg.clone(),
                    endpoint,
                    timeout,
                    session,
                    self.events.clone(),
                ));
            }
            PresenceAction::Subscribe { topic } => {
                if let Some(s) = &self.presence {
                    s.subscribe(topic);
                }
            }
            PresenceAction::Publish { topic, packet } => {
                if let Some(s) = &self.presence {
                    s.publish(topic, packet);
                }
            }
            PresenceAction::Disconnect { session } => {
                if self.presence.as_ref().is_some_and(|s| s.id == session) {
                    if let Some(s) = self.presence.take() {
                        s.stop();
                    }
                }
            }
        }
    }

    /// Switch the listener to `id` unless another node is already announcing it.
    fn bind(&mut self, id: PeerId, now: Instant) -> Vec<Action> {
        if id.is_hub() {
            let taken = self.directory.get(&id).is_some_and(|s| {
                s.origin != *self.core.identity() && now.saturating_duration_since(s.at) < self.sighting_ttl
            });
            if taken {
                return self.core.on_identity_conflict(id, now);
            }
        } else if id != self.stored_identity {
            if let Err(e) = crate::identity::persist(&self.data_dir, &id) {
                tracing::warn!(error = %e, "failed to persist new identity");
            }
            self.stored_identity = id.clone();
        }
        self.local_id.send_replace(id.clone());
        self.core.on_identity_bound(id, now)
    }

    fn stream(&mut self, event: StreamEvent) {
        if let Some(line) = self.downloads.handle(event) {
            println!("{line}");
        }
    }

    fn command(&mut self, cmd: Command, now: Instant) -> Vec<Action> {
        match cmd {
            Command::Say(text) => self.core.send_text(text, Target::Broadcast, now),
            Command::Dm { peer, text } => self.core.send_text(text, Target::Peer(PeerId::new(peer)), now),
            Command::Share(path) => {
                let bytes = match std::fs::read(&path) {
                    Ok(b) => b,
                    Err(e) => {
                        println!("cannot read {}: {e}", path.display());
                        return Vec::new();
                    }
                };
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_owned());
                let mime = console::mime_for(&path);
                self.core.send_file_share(name, mime, bytes, Target::Broadcast, now)
            }
            Command::Get { file_id, out } => {
                let out = out.unwrap_or_else(|| {
                    let name = self
                        .core
                        .known_file(&file_id)
                        .map(|m| m.file_name)
                        .filter(|n| !n.contains(['/', '\\']) && !n.starts_with('.'))
                        .unwrap_or_else(|| file_id.clone());
                    self.data_dir.join("downloads").join(name)
                });
                if let Some(dir) = out.parent() {
                    if let Err(e) = std::fs::create_dir_all(dir) {
                        println!("cannot create {}: {e}", dir.display());
                        return Vec::new();
                    }
                }
                let (request_id, actions) = self.core.open_stream(&file_id, None, now);
                println!("download {request_id} -> {}", out.display());
                self.downloads.register(request_id, out);
                actions
            }
            Command::Cancel(request_id) => {
                match self.core.cancel_stream(request_id) {
                    Ok(()) => self.stream(StreamEvent::Error {
                        request_id,
                        reason: "cancelled".into(),
                    }),
                    Err(e) => println!("{e}"),
                }
                Vec::new()
            }
            Command::Peers => {
                let peers = self.core.peers();
                if peers.is_empty() {
                    println!("no peers");
                }
                for p in &peers {
                    println!("{}", console::render_peer(p));
                }
                Vec::new()
            }
            Command::Contacts => {
                for c in self.core.contacts() {
                    println!("{} {} (last seen {})", c.peer_id, c.display_name, c.last_seen_at);
                }
                Vec::new()
            }
            Command::Status => {
                println!(
                    "identity {} network {} hub {} presence {:?} clock {} pending {} downloads {}",
                    self.core.identity(),
                    self.core.network_id(),
                    self.core.is_hub(),
                    self.core.presence_state(),
                    self.core.clock(),
                    self.core.pending(),
                    self.downloads.active(),
                );
                Vec::new()
            }
            Command::History(n) => {
                for m in self.core.history(n, None, None) {
                    println!("{}", console::render(&m));
                }
                Vec::new()
            }
            Command::Help => {
                println!("{}", console::help());
                Vec::new()
            }
            Command::Quit => Vec::new(),
        }
    }
}

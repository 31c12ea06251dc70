//! Multi-node scenarios: several cores wired through an in-process router.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use mesh_core::{
    decode_payload, encode_payload, Action, ChatMessage, Inbound, MemoryObjects, MemoryStore, MeshConfig,
    MeshCore, MessageBody, ObjectStore, Packet, Payload, PeerId, StreamEvent, Target, Timer,
};

/// Every payload that crossed the router: (from, to, packet or binary length).
#[derive(Debug, Clone)]
enum Wire {
    Packet(Packet),
    Binary(usize),
}

struct Net {
    now: Instant,
    nodes: BTreeMap<PeerId, MeshCore>,
    /// Epoch of the connection object `a` holds for `b`.
    links: HashMap<(PeerId, PeerId), u64>,
    queue: VecDeque<(PeerId, Action)>,
    timers: Vec<(Instant, PeerId, Timer)>,
    delivered: HashMap<PeerId, Vec<ChatMessage>>,
    streams: HashMap<PeerId, Vec<StreamEvent>>,
    log: Vec<(PeerId, PeerId, Wire)>,
}

impl Net {
    fn new() -> Self {
        Self {
            now: Instant::now(),
            nodes: BTreeMap::new(),
            links: HashMap::new(),
            queue: VecDeque::new(),
            timers: Vec::new(),
            delivered: HashMap::new(),
            streams: HashMap::new(),
            log: Vec::new(),
        }
    }

    fn add(&mut self, id: &str) -> PeerId {
        self.add_with(id, MeshConfig::default(), MemoryObjects::new())
    }

    fn add_with(&mut self, id: &str, config: MeshConfig, objects: MemoryObjects) -> PeerId {
        let pid = PeerId::from(id);
        let core = MeshCore::new(
            pid.clone(),
            id.to_uppercase(),
            config,
            Box::new(MemoryStore::new()),
            Box::new(objects),
            self.now,
        );
        self.nodes.insert(pid.clone(), core);
        pid
    }

    fn node(&mut self, id: &PeerId) -> &mut MeshCore {
        self.nodes.get_mut(id).expect("unknown node")
    }

    fn push(&mut self, from: &PeerId, actions: Vec<Action>) {
        for a in actions {
            self.queue.push_back((from.clone(), a));
        }
    }

    fn dial(&mut self, from: &PeerId, peer: &PeerId, epoch: u64) {
        let now = self.now;
        let Some(target) = self.nodes.get_mut(peer) else {
            let out = self.node(from).on_error(peer, epoch, "unreachable");
            self.push(from, out);
            return;
        };
        match target.on_inbound(from, now) {
            Inbound::Accepted {
                epoch: remote,
                actions,
            } => {
                self.links.insert((peer.clone(), from.clone()), remote);
                self.links.insert((from.clone(), peer.clone()), epoch);
                let out = self.node(from).on_dialed(peer, epoch, now);
                self.push(from, out);
                self.push(peer, actions);
            }
            Inbound::Refused => {
                let out = self.node(from).on_error(peer, epoch, "refused");
                self.push(from, out);
            }
        }
    }

    fn run(&mut self) {
        let mut steps = 0;
        while let Some((from, action)) = self.queue.pop_front() {
            steps += 1;
            assert!(steps < 100_000, "router did not settle");
            let now = self.now;
            match action {
                Action::Dial { peer, epoch } => self.dial(&from, &peer, epoch),
                Action::Send { peer, payload } => {
                    let Some(&epoch) = self.links.get(&(peer.clone(), from.clone())) else {
                        continue;
                    };
                    let bytes = encode_payload(&payload).expect("encode");
                    let (decoded, used) = decode_payload(&bytes).expect("decode");
                    assert_eq!(used, bytes.len());
                    let entry = match &decoded {
                        Payload::Packet(p) => Wire::Packet(p.clone()),
                        Payload::Binary(b) => Wire::Binary(b.len()),
                    };
                    self.log.push((from.clone(), peer.clone(), entry));
                    if let Some(node) = self.nodes.get_mut(&peer) {
                        let out = node.on_data(&from, epoch, decoded, now);
                        self.push(&peer, out);
                    }
                }
                Action::Close { peer, epoch } => {
                    if self.links.get(&(from.clone(), peer.clone())) != Some(&epoch) {
                        continue;
                    }
                    self.links.remove(&(from.clone(), peer.clone()));
                    if let Some(remote) = self.links.remove(&(peer.clone(), from.clone())) {
                        if let Some(node) = self.nodes.get_mut(&peer) {
                            let out = node.on_closed(&from, remote);
                            self.push(&peer, out);
                        }
                    }
                }
                Action::Schedule { after, timer } => self.timers.push((now + after, from, timer)),
                Action::Deliver(m) => self.delivered.entry(from).or_default().push(m),
                Action::Stream(e) => self.streams.entry(from).or_default().push(e),
                Action::Presence(_) | Action::BindIdentity(_) => {}
            }
        }
    }

    /// Move time forward, firing due timers and one maintenance tick per node.
    fn advance(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        let (due, later): (Vec<_>, Vec<_>) = self.timers.drain(..).partition(|(at, _, _)| *at <= now);
        self.timers = later;
        for (_, owner, timer) in due {
            if let Some(node) = self.nodes.get_mut(&owner) {
                let out = node.on_timer(timer, now);
                self.push(&owner, out);
            }
        }
        let ids: Vec<PeerId> = self.nodes.keys().cloned().collect();
        for id in ids {
            let out = self.node(&id).tick(now);
            self.push(&id, out);
        }
        self.run();
    }

    fn delivered(&self, id: &PeerId) -> &[ChatMessage] {
        self.delivered.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Bytes of binary chunk frames delivered to `to`.
    fn binary_to(&self, to: &PeerId) -> usize {
        self.log
            .iter()
            .filter_map(|(_, t, w)| match w {
                Wire::Binary(len) if t == to => Some(*len),
                _ => None,
            })
            .sum()
    }

    fn packets(&self) -> impl Iterator<Item = (&PeerId, &PeerId, &Packet)> {
        self.log.iter().filter_map(|(f, t, w)| match w {
            Wire::Packet(p) => Some((f, t, p)),
            Wire::Binary(_) => None,
        })
    }
}

fn broadcast(net: &mut Net, from: &PeerId, text: &str) -> ChatMessage {
    let now = net.now;
    let out = net.node(from).send_text(text, Target::Broadcast, now);
    let msg = out
        .iter()
        .find_map(|a| match a {
            Action::Deliver(m) => Some(m.clone()),
            _ => None,
        })
        .expect("local delivery");
    net.push(from, out);
    net.run();
    msg
}

/// Bootstrap `a` -> `b`: a presence heartbeat from `b` makes `a` dial it.
fn bootstrap(net: &mut Net, a: &PeerId, b: &PeerId) {
    let now = net.now;
    let out = net.node(a).on_presence_message(
        Packet::HubPulse {
            peer_id: b.clone(),
            origin: b.clone(),
            slot: None,
            clock: 0,
        },
        now,
    );
    net.push(a, out);
    net.run();
}

#[test]
fn broadcast_reaches_everyone_once_with_decaying_ttl() {
    let mut net = Net::new();
    let a = net.add("a");
    let b = net.add("b");
    let c = net.add("c");
    bootstrap(&mut net, &a, &b);
    bootstrap(&mut net, &b, &c);
    bootstrap(&mut net, &a, &c);
    net.log.clear();

    let msg = broadcast(&mut net, &a, "hello mesh");
    assert_eq!(msg.ttl, 20);

    for id in [&a, &b, &c] {
        let got: Vec<&ChatMessage> = net.delivered(id).iter().filter(|m| m.id == msg.id).collect();
        assert_eq!(got.len(), 1, "{id} must deliver exactly once");
    }

    let hops: Vec<(&PeerId, u32)> = net
        .packets()
        .filter_map(|(f, _, p)| match p {
            Packet::Msg(m) if m.id == msg.id => Some((f, m.ttl)),
            _ => None,
        })
        .collect();
    assert!(hops.iter().filter(|(f, _)| **f == a).all(|(_, ttl)| *ttl == 20));
    assert!(hops.iter().filter(|(f, _)| **f != a).all(|(_, ttl)| *ttl == 19));
    assert!(hops.iter().any(|(f, _)| **f != a), "relays happened");

    // A third copy arriving late is ignored entirely.
    let epoch = net.links[&(b.clone(), a.clone())];
    let now = net.now;
    let out = net.node(&b).on_data(&a, epoch, Payload::Packet(Packet::Msg(msg.clone())), now);
    assert!(out.is_empty());
}

#[test]
fn ttl_zero_is_delivered_but_not_relayed() {
    let mut net = Net::new();
    let a = net.add("a");
    let b = net.add("b");
    let c = net.add("c");
    bootstrap(&mut net, &a, &b);
    bootstrap(&mut net, &b, &c);
    net.log.clear();

    let msg = ChatMessage {
        id: "last-hop".into(),
        sender_id: a.clone(),
        sender_name: Some("A".into()),
        target: Target::Broadcast,
        timestamp: Some(5),
        ttl: 0,
        body: MessageBody::Text("end of the line".into()),
    };
    let epoch = net.links[&(b.clone(), a.clone())];
    let now = net.now;
    let out = net.node(&b).on_data(&a, epoch, Payload::Packet(Packet::Msg(msg)), now);
    net.push(&b, out);
    net.run();
    assert_eq!(net.delivered(&b).len(), 1);
    assert!(!net.packets().any(|(_, _, p)| matches!(p, Packet::Msg(_))));
}

#[test]
fn stream_fetches_two_mib_in_four_chunks() {
    const SIZE: usize = 2 * 1024 * 1024;
    let data: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    let mut net = Net::new();
    let c = net.add("c");
    let d = net.add("d");

    let now = net.now;
    let out = net
        .node(&d)
        .send_file_share("movie.mp4", "video/mp4", data.clone(), Target::Broadcast, now);
    let meta = out
        .iter()
        .find_map(|a| match a {
            Action::Deliver(m) => match &m.body {
                MessageBody::FileShare(meta) => Some(meta.clone()),
                _ => None,
            },
            _ => None,
        })
        .expect("share announced");
    let mut copy = MemoryObjects::new();
    copy.insert(meta.clone(), data.clone());
    let e = net.add_with("e", MeshConfig::default(), copy);

    bootstrap(&mut net, &c, &d);
    bootstrap(&mut net, &c, &e);
    net.log.clear();

    let now = net.now;
    let (request_id, out) = net.node(&c).open_stream(&meta.file_id, None, now);
    net.push(&c, out);
    net.run();

    let gets = net
        .packets()
        .filter(|(f, _, p)| **f == c && matches!(p, Packet::Get { .. }))
        .count();
    assert_eq!(gets, 4);
    // Four frames of payload plus their small headers.
    let framed = net.binary_to(&c);
    assert!(framed > SIZE && framed < SIZE + 4 * 64, "{framed}");

    let events = &net.streams[&c];
    assert!(matches!(
        events.first(),
        Some(StreamEvent::Open { total_size, mime_type, range: (0, end), .. })
            if *total_size == SIZE as u64 && mime_type == "video/mp4" && *end == SIZE as u64 - 1
    ));
    let mut streamed = Vec::new();
    for e in &events[1..events.len() - 1] {
        let StreamEvent::Data { request_id: r, bytes } = e else {
            panic!("unexpected event {e:?}");
        };
        assert_eq!(*r, request_id);
        streamed.extend_from_slice(bytes);
    }
    assert_eq!(events.len(), 6, "open, four data, end");
    assert_eq!(events.last(), Some(&StreamEvent::End { request_id }));
    assert_eq!(streamed, data);
}

#[test]
fn stream_survives_a_silent_holder() {
    let data: Vec<u8> = (0..100u8).collect();
    let config = MeshConfig {
        chunk_size: 10,
        chunk_timeout_ms: 1_000,
        ..MeshConfig::default()
    };
    let mut net = Net::new();
    let c = net.add_with("c", config.clone(), MemoryObjects::new());
    let meta = mesh_core::FileMeta {
        file_id: "f".into(),
        file_name: "f.bin".into(),
        file_size: 100,
        file_type: "application/octet-stream".into(),
    };
    // "d" announces but holds nothing.
    let mut fake = MemoryObjects::new();
    fake.insert(meta.clone(), Vec::new());
    let d = net.add_with("d", config.clone(), fake);
    bootstrap(&mut net, &c, &d);

    let now = net.now;
    let (request_id, out) = net.node(&c).open_stream("f", None, now);
    net.push(&c, out);
    net.run();
    assert!(!net.streams[&c].iter().any(|e| matches!(e, StreamEvent::Data { .. })));

    let mut real = MemoryObjects::new();
    real.insert(meta, data.clone());
    let e = net.add_with("e", config, real);
    bootstrap(&mut net, &c, &e);
    // "e" answers a late WHO_HAS through a fresh HAVE.
    let epoch = net.links[&(c.clone(), e.clone())];
    let now = net.now;
    let have = Packet::Have {
        file_id: "f".into(),
        meta: net.nodes[&e].known_file("f").expect("meta"),
    };
    let out = net.node(&c).on_data(&e, epoch, Payload::Packet(have), now);
    net.push(&c, out);
    net.run();

    // Requests to the silent holder time out and get reissued until everything arrives.
    for _ in 0..120 {
        if net.streams[&c].contains(&StreamEvent::End { request_id }) {
            break;
        }
        net.advance(Duration::from_secs(1));
    }
    let streamed: Vec<u8> = net.streams[&c]
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Data { bytes, .. } => Some(bytes.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(streamed, data);
}

#[test]
fn stream_opened_before_any_holder_is_known_completes() {
    let data: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    let config = MeshConfig {
        chunk_size: 1000,
        ..MeshConfig::default()
    };
    let mut net = Net::new();
    let c = net.add_with("c", config.clone(), MemoryObjects::new());
    let meta = mesh_core::FileMeta {
        file_id: "f".into(),
        file_name: "f.bin".into(),
        file_size: data.len() as u64,
        file_type: "application/octet-stream".into(),
    };

    let now = net.now;
    let (request_id, out) = net.node(&c).open_stream("f", None, now);
    net.push(&c, out);
    net.run();
    assert!(!net.packets().any(|(_, _, p)| matches!(p, Packet::WhoHas { .. })));

    // Nobody around for a while: the request stays open.
    for _ in 0..10 {
        net.advance(Duration::from_secs(1));
    }
    assert!(net.streams.get(&c).is_none());

    let mut objects = MemoryObjects::new();
    objects.insert(meta, data.clone());
    let e = net.add_with("e", config, objects);
    bootstrap(&mut net, &c, &e);
    for _ in 0..60 {
        if net.streams.get(&c).is_some_and(|s| s.contains(&StreamEvent::End { request_id })) {
            break;
        }
        net.advance(Duration::from_secs(1));
    }
    assert!(net
        .packets()
        .any(|(f, t, p)| *f == c && *t == e && matches!(p, Packet::WhoHas { .. })));
    let streamed: Vec<u8> = net.streams[&c]
        .iter()
        .filter_map(|ev| match ev {
            StreamEvent::Data { bytes, .. } => Some(bytes.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(streamed, data);
    assert_eq!(net.streams[&c].last(), Some(&StreamEvent::End { request_id }));
}

#[test]
fn node_accepts_up_to_ceiling_plus_grace() {
    let mut net = Net::new();
    let config = MeshConfig {
        max_peers: 2,
        peer_grace: 1,
        ..MeshConfig::default()
    };
    let hub = net.add_with("h", config, MemoryObjects::new());
    let others: Vec<PeerId> = (0..4).map(|i| net.add(&format!("n{i}"))).collect();
    for o in &others {
        bootstrap(&mut net, o, &hub);
    }
    assert_eq!(net.nodes[&hub].peers().len(), 3);
    let open_to_hub = others
        .iter()
        .filter(|o| net.links.contains_key(&((*o).clone(), hub.clone())))
        .count();
    assert_eq!(open_to_hub, 3);
}

#[test]
fn direct_message_waits_for_target_then_arrives_once() {
    let mut net = Net::new();
    let a = net.add("a");
    let b = PeerId::from("b");

    let now = net.now;
    let out = net.node(&a).send_text("are you there?", Target::Peer(b.clone()), now);
    net.push(&a, out);
    net.run();
    assert_eq!(net.nodes[&a].pending(), 1);

    net.add("b");
    net.advance(Duration::from_secs(1));
    net.advance(Duration::from_secs(1));

    assert_eq!(net.nodes[&a].pending(), 0);
    let got = net.delivered(&b);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].target, Target::Peer(b.clone()));
    assert_eq!(net.delivered(&a).len(), 1, "sender keeps its own copy");
}

#[test]
fn late_joiner_catches_up_on_history() {
    let mut net = Net::new();
    let a = net.add("a");
    for text in ["first", "second", "third"] {
        broadcast(&mut net, &a, text);
    }
    let b = net.add("b");
    bootstrap(&mut net, &b, &a);
    net.advance(Duration::from_millis(600));

    let texts: Vec<&MessageBody> = net.delivered(&b).iter().map(|m| &m.body).collect();
    assert_eq!(
        texts,
        vec![
            &MessageBody::Text("first".into()),
            &MessageBody::Text("second".into()),
            &MessageBody::Text("third".into()),
        ]
    );
    assert_eq!(net.nodes[&b].contacts()[0].display_name, "A");
}

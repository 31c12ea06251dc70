//! Gossip router: flood-based message protocol with deduplication, TTL decay and a logical clock.

use crate::protocol::{ChatMessage, Contact, MessageBody, PeerId, Target};
use crate::seen::SeenSet;
use crate::store::MessageStore;

/// Interceptor decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Outbound: do not send. Inbound: do not persist or present (relaying is unaffected).
    Drop,
}

/// Middleware on the send/receive pipeline, run in registration order.
pub trait Interceptor: Send {
    fn outbound(&mut self, _message: &mut ChatMessage) -> Verdict {
        Verdict::Pass
    }

    fn inbound(&mut self, _message: &ChatMessage, _from: Option<&PeerId>) -> Verdict {
        Verdict::Pass
    }
}

/// Where an inbound message came from and where it may go next.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    /// Connection it arrived on; `None` for catch-up replays.
    pub from: Option<&'a PeerId>,
    /// Our current transport identity.
    pub network_id: &'a PeerId,
    pub open_peers: &'a [PeerId],
    /// Open connection to a unicast target, if any.
    pub direct: Option<&'a PeerId>,
    /// False disables forwarding (history replays).
    pub relay: bool,
}

/// Result of processing one inbound message.
#[derive(Debug, Default)]
pub struct Receipt {
    /// Persisted and to be presented locally.
    pub delivered: Option<ChatMessage>,
    /// Relays: (next hop, message with decremented ttl).
    pub forwards: Vec<(PeerId, ChatMessage)>,
    pub duplicate: bool,
}

pub struct GossipRouter {
    identity: PeerId,
    name: String,
    clock: u64,
    seen: SeenSet,
    default_ttl: u32,
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl GossipRouter {
    pub fn new(identity: PeerId, name: String, seen: SeenSet, default_ttl: u32) -> Self {
        Self {
            identity,
            name,
            clock: 0,
            seen,
            default_ttl,
            interceptors: Vec::new(),
        }
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn set_identity(&mut self, identity: PeerId) {
        self.identity = identity;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Advance the clock to at least `t`.
    pub fn observe(&mut self, t: u64) {
        self.clock = self.clock.max(t);
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn register(&mut self, interceptor: Box<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Build a fresh message stamped with the next logical time. `None` if an interceptor dropped it.
    pub fn compose(&mut self, body: MessageBody, target: Target) -> Option<ChatMessage> {
        self.clock += 1;
        let mut message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: self.identity.clone(),
            sender_name: Some(self.name.clone()),
            target,
            timestamp: Some(self.clock),
            ttl: self.default_ttl,
            body,
        };
        for i in &mut self.interceptors {
            if i.outbound(&mut message) == Verdict::Drop {
                tracing::debug!(id = %message.id, "outbound message dropped by interceptor");
                return None;
            }
        }
        Some(message)
    }

    /// Local delivery of our own message: mark seen and persist, no relaying.
    pub fn deliver_local<S: MessageStore + ?Sized>(&mut self, message: &ChatMessage, store: &mut S) {
        self.seen.insert(&message.id);
        store.put(message);
    }

    fn addressed_to_us(&self, message: &ChatMessage, network_id: &PeerId) -> bool {
        match &message.target {
            Target::Broadcast => true,
            Target::Peer(p) => {
                p == &self.identity || p == network_id || message.sender_id == self.identity
            }
        }
    }

    /// Process one inbound message: dedup, clock, contacts, local delivery, relays.
    pub fn receive<S: MessageStore + ?Sized>(
        &mut self,
        mut message: ChatMessage,
        route: Route<'_>,
        store: &mut S,
    ) -> Receipt {
        if !self.seen.insert(&message.id) {
            tracing::trace!(id = %message.id, "duplicate message");
            return Receipt {
                duplicate: true,
                ..Receipt::default()
            };
        }

        let ts = message.timestamp.unwrap_or(self.clock + 1);
        message.timestamp = Some(ts);
        self.observe(ts);

        if let Some(name) = &message.sender_name {
            if message.sender_id != self.identity {
                store.put_contact(&Contact {
                    peer_id: message.sender_id.clone(),
                    display_name: name.clone(),
                    last_seen_at: self.clock,
                });
            }
        }

        let mut receipt = Receipt::default();
        if self.addressed_to_us(&message, route.network_id) {
            let pass = self
                .interceptors
                .iter_mut()
                .all(|i| i.inbound(&message, route.from) == Verdict::Pass);
            if pass {
                store.put(&message);
                receipt.delivered = Some(message.clone());
            }
        }

        if route.relay {
            receipt.forwards = self.relays(&message, route);
        }
        receipt
    }

    /// Next hops for `message`. Broadcasts flood; unicasts for someone else go straight to the
    /// target when it is connected, else flood. Unicasts for us stop here.
    fn relays(&self, message: &ChatMessage, route: Route<'_>) -> Vec<(PeerId, ChatMessage)> {
        let for_us = match &message.target {
            Target::Broadcast => false,
            Target::Peer(p) => p == &self.identity || p == route.network_id,
        };
        if for_us {
            return vec![];
        }
        let Some(ttl) = message.ttl.checked_sub(1) else {
            tracing::trace!(id = %message.id, "ttl exhausted, not forwarding");
            return vec![];
        };
        let mut hop = message.clone();
        hop.ttl = ttl;
        let next: &[PeerId] = match (&message.target, route.direct) {
            (Target::Peer(_), Some(direct)) => std::slice::from_ref(direct),
            _ => route.open_peers,
        };
        next.iter()
            .filter(|p| Some(*p) != route.from)
            .map(|p| (p.clone(), hop.clone()))
            .collect()
    }
}

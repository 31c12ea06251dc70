//! Delivery queue: outbound messages persisted until handed to a transport.

use std::time::Instant;

use crate::core::Action;
use crate::mesh::PeerMesh;
use crate::protocol::{ChatMessage, Packet, Target};
use crate::store::{PendingEnvelope, PendingStore};
use crate::wire::Payload;

/// Outcome counters of one retry pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    pub flooded: usize,
    pub sent_direct: usize,
    pub waiting: usize,
}

/// Persist `message` for delivery.
pub fn enqueue<S: PendingStore + ?Sized>(store: &mut S, message: ChatMessage, now_clock: u64) {
    store.add(&PendingEnvelope {
        message,
        enqueued_at: now_clock,
        attempts: 0,
    });
}

/// Drain the queue. Broadcasts are flooded once to every open connection and removed, even with
/// zero peers. Unicasts leave only when a connection to the target is open; otherwise a dial is
/// requested and the entry stays for the next pass.
pub fn retry_pending<S: PendingStore + ?Sized>(
    store: &mut S,
    mesh: &mut PeerMesh,
    now: Instant,
    out: &mut Vec<Action>,
) -> RetryStats {
    let mut stats = RetryStats::default();
    for mut envelope in store.list() {
        let id = envelope.message.id.clone();
        match &envelope.message.target {
            Target::Broadcast => {
                for peer in mesh.open_peers() {
                    out.push(Action::Send {
                        peer,
                        payload: Payload::Packet(Packet::Msg(envelope.message.clone())),
                    });
                }
                store.remove(&id);
                stats.flooded += 1;
            }
            Target::Peer(target) => match mesh.resolve(target) {
                Some(peer) => {
                    out.push(Action::Send {
                        peer,
                        payload: Payload::Packet(Packet::Msg(envelope.message.clone())),
                    });
                    store.remove(&id);
                    stats.sent_direct += 1;
                }
                None => {
                    // Rewritten only when a fresh dial starts.
                    let target = target.clone();
                    if mesh.connect(&target, now, out) {
                        envelope.attempts = envelope.attempts.saturating_add(1);
                        store.add(&envelope);
                    }
                    stats.waiting += 1;
                }
            },
        }
    }
    stats
}

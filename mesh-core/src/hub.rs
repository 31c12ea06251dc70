//! Rendezvous coordination: the fixed set of well-known hub identities, patrol, lazy claim and resignation.

use std::time::{Duration, Instant};

use crate::core::Action;
use crate::mesh::PeerMesh;
use crate::protocol::{PeerId, HUB_SLOTS};

/// One well-known rendezvous identity as seen from this node.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubSlot {
    pub last_heartbeat_at: Option<Instant>,
}

/// Tracks rendezvous slots and whether this node holds one.
pub struct HubCoordinator {
    slots: [HubSlot; HUB_SLOTS as usize],
    own: Option<u8>,
    claimed_via_fallback: bool,
    pending_claim: Option<u8>,
    started_at: Instant,
    stale: Duration,
}

impl HubCoordinator {
    pub fn new(now: Instant, stale: Duration) -> Self {
        Self {
            slots: [HubSlot::default(); HUB_SLOTS as usize],
            own: None,
            claimed_via_fallback: false,
            pending_claim: None,
            started_at: now,
            stale,
        }
    }

    pub fn is_hub(&self) -> bool {
        self.own.is_some()
    }

    pub fn own_slot(&self) -> Option<u8> {
        self.own
    }

    pub fn slot(&self, slot: u8) -> Option<&HubSlot> {
        self.slots.get(slot as usize)
    }

    /// Dial every rendezvous identity that is not us and not already connected. Safe to repeat.
    pub fn patrol(&self, mesh: &mut PeerMesh, now: Instant, out: &mut Vec<Action>) {
        for slot in 0..HUB_SLOTS {
            let id = PeerId::hub(slot);
            if id == *mesh.self_id() || mesh.contains(&id) {
                continue;
            }
            mesh.connect(&id, now, out);
        }
    }

    pub fn record_pulse(&mut self, slot: u8, now: Instant) {
        if let Some(s) = self.slots.get_mut(slot as usize) {
            s.last_heartbeat_at = Some(now);
        }
    }

    /// A slot that has been silent for the stale window, once we have been up that long.
    /// `None` while we hold or are claiming a slot.
    pub fn vacant_slot(&self, now: Instant) -> Option<u8> {
        if self.own.is_some() || self.pending_claim.is_some() {
            return None;
        }
        if now.saturating_duration_since(self.started_at) < self.stale {
            return None;
        }
        (0..HUB_SLOTS).find(|&i| match self.slots[i as usize].last_heartbeat_at {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.stale,
        })
    }

    pub fn begin_claim(&mut self, slot: u8) {
        self.pending_claim = Some(slot);
    }

    pub fn pending_claim(&self) -> Option<u8> {
        self.pending_claim
    }

    /// The host bound the slot identity. `via_fallback` records which presence path was live.
    pub fn on_bound(&mut self, slot: u8, via_fallback: bool, now: Instant) {
        self.pending_claim = None;
        self.own = Some(slot);
        self.claimed_via_fallback = via_fallback;
        self.record_pulse(slot, now);
        tracing::info!(slot, via_fallback, "holding rendezvous identity");
    }

    /// The slot identity is taken elsewhere; treat it as occupied.
    pub fn on_claim_failed(&mut self, slot: u8, now: Instant) {
        if self.pending_claim == Some(slot) {
            self.pending_claim = None;
        }
        self.record_pulse(slot, now);
    }

    /// Resign only when the direct presence path recovered while our slot came from the fallback path.
    pub fn should_resign(&self, presence_via_fallback: bool) -> bool {
        self.own.is_some() && self.claimed_via_fallback && !presence_via_fallback
    }

    /// Give up the held slot.
    pub fn resign(&mut self) -> Option<u8> {
        let slot = self.own.take();
        if let Some(slot) = slot {
            tracing::info!(slot, "resigning rendezvous identity");
        }
        self.claimed_via_fallback = false;
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;

    const STALE: Duration = Duration::from_secs(30);

    #[test]
    fn patrol_skips_self_and_connected() {
        let now = Instant::now();
        let hub = HubCoordinator::new(now, STALE);
        let mut mesh = PeerMesh::new(PeerId::hub(0), &MeshConfig::default());
        let mut out = Vec::new();
        mesh.connect(&PeerId::hub(3), now, &mut out);
        out.clear();
        hub.patrol(&mut mesh, now, &mut out);
        let dialed: Vec<PeerId> = out
            .iter()
            .filter_map(|a| match a {
                Action::Dial { peer, .. } => Some(peer.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(dialed, vec![PeerId::hub(1), PeerId::hub(2), PeerId::hub(4)]);

        out.clear();
        hub.patrol(&mut mesh, now, &mut out);
        assert!(out.is_empty(), "second patrol is a no-op while dials are pending");
    }

    #[test]
    fn vacant_slot_waits_for_warmup() {
        let t0 = Instant::now();
        let mut hub = HubCoordinator::new(t0, STALE);
        assert_eq!(hub.vacant_slot(t0), None);
        let later = t0 + STALE;
        hub.record_pulse(0, later);
        assert_eq!(hub.vacant_slot(later), Some(1));
        hub.begin_claim(1);
        assert_eq!(hub.vacant_slot(later), None);
        hub.on_claim_failed(1, later);
        assert_eq!(hub.vacant_slot(later), Some(2));
    }

    #[test]
    fn resign_only_for_fallback_claims() {
        let now = Instant::now();
        let mut hub = HubCoordinator::new(now, STALE);
        hub.on_bound(2, false, now);
        assert!(!hub.should_resign(false), "claimed over primary path: keep the slot");
        hub.resign();

        hub.on_bound(2, true, now);
        assert!(!hub.should_resign(true), "still on fallback: nothing recovered");
        assert!(hub.should_resign(false));
        assert_eq!(hub.resign(), Some(2));
        assert!(!hub.is_hub());
    }
}

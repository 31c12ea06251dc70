//! Inbound filter hiding messages from muted senders. Relaying is unaffected.

use std::collections::HashSet;

use mesh_core::{ChatMessage, Interceptor, PeerId, Verdict};

pub struct Muted {
    senders: HashSet<PeerId>,
}

impl Muted {
    pub fn new(senders: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            senders: senders.into_iter().collect(),
        }
    }
}

impl Interceptor for Muted {
    fn inbound(&mut self, message: &ChatMessage, _from: Option<&PeerId>) -> Verdict {
        if self.senders.contains(&message.sender_id) {
            tracing::trace!(id = %message.id, sender = %message.sender_id, "muted");
            Verdict::Drop
        } else {
            Verdict::Pass
        }
    }
}

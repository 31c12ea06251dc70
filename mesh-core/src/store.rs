//! Local store boundary: message history, pending queue, contacts and locally held file objects.
//! The core only talks to these traits; hosts plug in their own persistence.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::protocol::{ChatMessage, Contact, FileMeta, PeerId, Target};

/// Outbound message waiting to be handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEnvelope {
    pub message: ChatMessage,
    /// Logical time at which it was queued.
    pub enqueued_at: u64,
    pub attempts: u32,
}

/// Message history and contact directory. Best effort: implementations log and swallow I/O errors.
pub trait MessageStore {
    /// Insert or overwrite by message id.
    fn put(&mut self, message: &ChatMessage);
    /// Newest `limit` messages strictly before `before` (all if `None`), optionally filtered by target;
    /// returned in ascending timestamp order.
    fn get_recent(&self, limit: usize, target: Option<&Target>, before: Option<u64>) -> Vec<ChatMessage>;
    /// Broadcast messages with timestamp strictly after `since`, ascending, at most `limit`.
    fn get_after(&self, since: u64, limit: usize) -> Vec<ChatMessage>;
    fn latest_broadcast_timestamp(&self) -> Option<u64>;
    fn put_contact(&mut self, contact: &Contact);
    fn contacts(&self) -> Vec<Contact>;
    /// Write buffered changes through. Called by the core once per tick.
    fn flush(&mut self) {}
}

/// Durable outbound queue.
pub trait PendingStore {
    fn add(&mut self, envelope: &PendingEnvelope);
    fn list(&self) -> Vec<PendingEnvelope>;
    fn remove(&mut self, id: &str);
}

/// Combined store handed to the core.
pub trait Store: MessageStore + PendingStore + Send {}

impl<T: MessageStore + PendingStore + Send> Store for T {}

/// Locally held file objects that can be served to other peers.
pub trait ObjectStore: Send {
    fn meta(&self, file_id: &str) -> Option<FileMeta>;
    /// Take ownership of a locally shared object.
    fn insert(&mut self, meta: FileMeta, bytes: Vec<u8>);
    /// Exactly `len` bytes at `offset`, or `None` if the object or range is not available.
    fn read(&self, file_id: &str, offset: u64, len: u64) -> Option<Vec<u8>>;
}

/// In-memory store keyed by (timestamp, id).
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: BTreeMap<(u64, String), ChatMessage>,
    by_id: HashMap<String, u64>,
    pending: BTreeMap<String, PendingEnvelope>,
    contacts: HashMap<PeerId, Contact>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Rebuild from a snapshot (used by file-backed hosts on startup).
    pub fn from_parts(
        messages: Vec<ChatMessage>,
        pending: Vec<PendingEnvelope>,
        contacts: Vec<Contact>,
    ) -> Self {
        let mut store = Self::new();
        for m in &messages {
            store.put(m);
        }
        for p in &pending {
            store.add(p);
        }
        for c in &contacts {
            store.put_contact(c);
        }
        store
    }

    pub fn all_messages(&self) -> Vec<ChatMessage> {
        self.messages.values().cloned().collect()
    }

    /// Forget the oldest messages until at most `keep` remain. Returns how many went.
    pub fn retain_newest(&mut self, keep: usize) -> usize {
        let excess = self.messages.len().saturating_sub(keep);
        for _ in 0..excess {
            if let Some(((_, id), _)) = self.messages.pop_first() {
                self.by_id.remove(&id);
            }
        }
        excess
    }
}

impl MessageStore for MemoryStore {
    fn put(&mut self, message: &ChatMessage) {
        let ts = message.logical_time();
        if let Some(old) = self.by_id.insert(message.id.clone(), ts) {
            self.messages.remove(&(old, message.id.clone()));
        }
        self.messages.insert((ts, message.id.clone()), message.clone());
    }

    fn get_recent(&self, limit: usize, target: Option<&Target>, before: Option<u64>) -> Vec<ChatMessage> {
        let mut out: Vec<ChatMessage> = self
            .messages
            .iter()
            .rev()
            .filter(|((ts, _), _)| before.map_or(true, |b| *ts < b))
            .filter(|(_, m)| target.map_or(true, |t| &m.target == t))
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect();
        out.reverse();
        out
    }

    fn get_after(&self, since: u64, limit: usize) -> Vec<ChatMessage> {
        self.messages
            .range((since.saturating_add(1), String::new())..)
            .map(|(_, m)| m)
            .filter(|m| m.is_broadcast())
            .take(limit)
            .cloned()
            .collect()
    }

    fn latest_broadcast_timestamp(&self) -> Option<u64> {
        self.messages
            .iter()
            .rev()
            .find(|(_, m)| m.is_broadcast())
            .map(|((ts, _), _)| *ts)
    }

    fn put_contact(&mut self, contact: &Contact) {
        self.contacts.insert(contact.peer_id.clone(), contact.clone());
    }

    fn contacts(&self) -> Vec<Contact> {
        let mut out: Vec<Contact> = self.contacts.values().cloned().collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }
}

impl PendingStore for MemoryStore {
    fn add(&mut self, envelope: &PendingEnvelope) {
        self.pending
            .insert(envelope.message.id.clone(), envelope.clone());
    }

    fn list(&self) -> Vec<PendingEnvelope> {
        let mut out: Vec<PendingEnvelope> = self.pending.values().cloned().collect();
        out.sort_by_key(|e| e.enqueued_at);
        out
    }

    fn remove(&mut self, id: &str) {
        self.pending.remove(id);
    }
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjects {
    objects: HashMap<String, (FileMeta, Vec<u8>)>,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjects {
    fn meta(&self, file_id: &str) -> Option<FileMeta> {
        self.objects.get(file_id).map(|(m, _)| m.clone())
    }

    fn insert(&mut self, meta: FileMeta, bytes: Vec<u8>) {
        self.objects.insert(meta.file_id.clone(), (meta, bytes));
    }

    fn read(&self, file_id: &str, offset: u64, len: u64) -> Option<Vec<u8>> {
        let (_, bytes) = self.objects.get(file_id)?;
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        bytes.get(start..end).map(|s| s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageBody;

    fn msg(id: &str, ts: u64, target: Target) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            sender_id: PeerId::from("s"),
            sender_name: None,
            target,
            timestamp: Some(ts),
            ttl: 20,
            body: MessageBody::Text(id.into()),
        }
    }

    #[test]
    fn get_after_is_broadcast_only_and_ascending() {
        let mut store = MemoryStore::new();
        store.put(&msg("c", 30, Target::Broadcast));
        store.put(&msg("a", 10, Target::Broadcast));
        store.put(&msg("dm", 20, Target::Peer(PeerId::from("x"))));
        store.put(&msg("b", 20, Target::Broadcast));
        let after: Vec<String> = store.get_after(10, 10).into_iter().map(|m| m.id).collect();
        assert_eq!(after, vec!["b", "c"]);
        assert_eq!(store.latest_broadcast_timestamp(), Some(30));
    }

    #[test]
    fn get_recent_paginates_backwards() {
        let mut store = MemoryStore::new();
        for i in 1..=10u64 {
            store.put(&msg(&format!("m{i}"), i, Target::Broadcast));
        }
        let page: Vec<u64> = store
            .get_recent(3, None, None)
            .iter()
            .map(|m| m.logical_time())
            .collect();
        assert_eq!(page, vec![8, 9, 10]);
        let older: Vec<u64> = store
            .get_recent(3, Some(&Target::Broadcast), Some(8))
            .iter()
            .map(|m| m.logical_time())
            .collect();
        assert_eq!(older, vec![5, 6, 7]);
    }

    #[test]
    fn put_same_id_overwrites() {
        let mut store = MemoryStore::new();
        store.put(&msg("a", 1, Target::Broadcast));
        store.put(&msg("a", 5, Target::Broadcast));
        assert_eq!(store.message_count(), 1);
        assert_eq!(store.latest_broadcast_timestamp(), Some(5));
    }

    #[test]
    fn retain_newest_drops_oldest_first() {
        let mut store = MemoryStore::new();
        for i in 1..=6u64 {
            store.put(&msg(&format!("m{i}"), i, Target::Broadcast));
        }
        assert_eq!(store.retain_newest(4), 2);
        assert_eq!(store.retain_newest(4), 0);
        let left: Vec<String> = store.all_messages().into_iter().map(|m| m.id).collect();
        assert_eq!(left, vec!["m3", "m4", "m5", "m6"]);
        // A dropped id is a fresh insert, not an overwrite.
        store.put(&msg("m1", 7, Target::Broadcast));
        assert_eq!(store.message_count(), 5);
    }

    #[test]
    fn pending_add_list_remove() {
        let mut store = MemoryStore::new();
        for (i, id) in ["x", "y"].iter().enumerate() {
            store.add(&PendingEnvelope {
                message: msg(id, i as u64, Target::Broadcast),
                enqueued_at: i as u64,
                attempts: 0,
            });
        }
        assert_eq!(store.list().len(), 2);
        store.remove("x");
        let left = store.list();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].message.id, "y");
    }

    #[test]
    fn object_reads_are_exact() {
        let mut objects = MemoryObjects::new();
        let meta = FileMeta {
            file_id: "f".into(),
            file_name: "f.bin".into(),
            file_size: 10,
            file_type: "application/octet-stream".into(),
        };
        objects.insert(meta, (0u8..10).collect());
        assert_eq!(objects.read("f", 2, 3), Some(vec![2, 3, 4]));
        assert_eq!(objects.read("f", 8, 5), None);
        assert_eq!(objects.read("missing", 0, 1), None);
    }
}

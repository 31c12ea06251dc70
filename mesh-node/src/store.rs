//! Disk-backed stores: JSON snapshot of history/queue/contacts, shared file objects, and the
//! download sink for stream events. Best effort: I/O failures are logged, never fatal.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use mesh_core::{
    ChatMessage, Contact, FileMeta, MemoryStore, MessageStore, ObjectStore, PendingEnvelope, PendingStore,
    StreamEvent, Target,
};
use serde::{Deserialize, Serialize};

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    messages: Vec<ChatMessage>,
    pending: Vec<PendingEnvelope>,
    contacts: Vec<Contact>,
}

/// Message history, pending queue and contacts in one JSON file. Changes are buffered and
/// written on `flush` (each core tick) and on drop. History keeps the newest `history_limit`.
pub struct JsonStore {
    path: PathBuf,
    inner: MemoryStore,
    history_limit: usize,
    dirty: bool,
}

impl JsonStore {
    pub fn open(path: PathBuf, history_limit: usize) -> Self {
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "corrupt store, starting empty");
                Snapshot::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable store, starting empty");
                Snapshot::default()
            }
        };
        let mut inner = MemoryStore::from_parts(snapshot.messages, snapshot.pending, snapshot.contacts);
        let dropped = inner.retain_newest(history_limit);
        tracing::debug!(path = %path.display(), messages = inner.message_count(), dropped, "store loaded");
        Self {
            path,
            inner,
            history_limit,
            dirty: dropped > 0,
        }
    }

    fn save(&self) -> std::io::Result<()> {
        let snapshot = Snapshot {
            messages: self.inner.all_messages(),
            pending: self.inner.list(),
            contacts: self.inner.contacts(),
        };
        write_atomic(&self.path, &snapshot)
    }
}

impl Drop for JsonStore {
    fn drop(&mut self) {
        self.flush();
    }
}

fn write_atomic(path: &Path, snapshot: &Snapshot) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec(snapshot).map_err(std::io::Error::other)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)
}

impl MessageStore for JsonStore {
    fn put(&mut self, message: &ChatMessage) {
        self.inner.put(message);
        let dropped = self.inner.retain_newest(self.history_limit);
        if dropped > 0 {
            tracing::trace!(dropped, "history trimmed");
        }
        self.dirty = true;
    }

    fn get_recent(&self, limit: usize, target: Option<&Target>, before: Option<u64>) -> Vec<ChatMessage> {
        self.inner.get_recent(limit, target, before)
    }

    fn get_after(&self, since: u64, limit: usize) -> Vec<ChatMessage> {
        self.inner.get_after(since, limit)
    }

    fn latest_broadcast_timestamp(&self) -> Option<u64> {
        self.inner.latest_broadcast_timestamp()
    }

    fn put_contact(&mut self, contact: &Contact) {
        self.inner.put_contact(contact);
        self.dirty = true;
    }

    fn contacts(&self) -> Vec<Contact> {
        self.inner.contacts()
    }

    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        match self.save() {
            Ok(()) => self.dirty = false,
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to save store"),
        }
    }
}

impl PendingStore for JsonStore {
    fn add(&mut self, envelope: &PendingEnvelope) {
        self.inner.add(envelope);
        self.dirty = true;
    }

    fn list(&self) -> Vec<PendingEnvelope> {
        self.inner.list()
    }

    fn remove(&mut self, id: &str) {
        self.inner.remove(id);
        self.dirty = true;
    }
}

/// Shared files: one blob per file id plus a JSON index of their metadata.
pub struct FileObjects {
    dir: PathBuf,
    index: HashMap<String, FileMeta>,
}

impl FileObjects {
    pub fn open(dir: PathBuf) -> Self {
        let index = std::fs::read(dir.join("index.json"))
            .ok()
            .and_then(|b| serde_json::from_slice::<Vec<FileMeta>>(&b).ok())
            .unwrap_or_default()
            .into_iter()
            .filter(|m| dir.join(&m.file_id).exists())
            .map(|m| (m.file_id.clone(), m))
            .collect();
        Self { dir, index }
    }

    fn blob(&self, file_id: &str) -> Option<PathBuf> {
        // File ids come off the wire; refuse anything that is not a plain name.
        if file_id.is_empty() || file_id.contains(['/', '\\']) || file_id.starts_with('.') {
            return None;
        }
        Some(self.dir.join(file_id))
    }

    fn save_index(&self) -> std::io::Result<()> {
        let metas: Vec<&FileMeta> = self.index.values().collect();
        let bytes = serde_json::to_vec(&metas).map_err(std::io::Error::other)?;
        std::fs::write(self.dir.join("index.json"), bytes)
    }
}

impl ObjectStore for FileObjects {
    fn meta(&self, file_id: &str) -> Option<FileMeta> {
        self.index.get(file_id).cloned()
    }

    fn insert(&mut self, meta: FileMeta, bytes: Vec<u8>) {
        let Some(path) = self.blob(&meta.file_id) else {
            tracing::warn!(file_id = %meta.file_id, "refusing to store object with unsafe id");
            return;
        };
        let stored = std::fs::create_dir_all(&self.dir).and_then(|_| std::fs::write(&path, &bytes));
        if let Err(e) = stored {
            tracing::warn!(path = %path.display(), error = %e, "failed to store shared file");
            return;
        }
        self.index.insert(meta.file_id.clone(), meta);
        if let Err(e) = self.save_index() {
            tracing::warn!(error = %e, "failed to save object index");
        }
    }

    fn read(&self, file_id: &str, offset: u64, len: u64) -> Option<Vec<u8>> {
        let meta = self.index.get(file_id)?;
        if offset.checked_add(len)? > meta.file_size {
            return None;
        }
        let mut f = File::open(self.blob(file_id)?).ok()?;
        f.seek(SeekFrom::Start(offset)).ok()?;
        let mut buf = vec![0u8; usize::try_from(len).ok()?];
        f.read_exact(&mut buf).ok()?;
        Some(buf)
    }
}

/// Writes stream events for downloads started from the console to their output files.
#[derive(Default)]
pub struct DownloadSink {
    open: HashMap<u64, Download>,
}

struct Download {
    path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl DownloadSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request_id: u64, path: PathBuf) {
        self.open.insert(
            request_id,
            Download {
                path,
                file: None,
                written: 0,
            },
        );
    }

    pub fn active(&self) -> usize {
        self.open.len()
    }

    /// Returns a line for the console when a download finishes or fails.
    pub fn handle(&mut self, event: StreamEvent) -> Option<String> {
        match event {
            StreamEvent::Open {
                request_id,
                total_size,
                mime_type,
                ..
            } => {
                let d = self.open.get_mut(&request_id)?;
                match File::create(&d.path) {
                    Ok(f) => d.file = Some(f),
                    Err(e) => {
                        let d = self.open.remove(&request_id)?;
                        return Some(format!("cannot write {}: {e}", d.path.display()));
                    }
                }
                tracing::debug!(request_id, total_size, mime_type, "download started");
                None
            }
            StreamEvent::Data { request_id, bytes } => {
                let d = self.open.get_mut(&request_id)?;
                let result = match d.file.as_mut() {
                    Some(f) => f.write_all(&bytes),
                    None => Ok(()),
                };
                if let Err(e) = result {
                    let d = self.open.remove(&request_id)?;
                    let _ = std::fs::remove_file(&d.path);
                    return Some(format!("download {request_id} failed: {e}"));
                }
                d.written += bytes.len() as u64;
                None
            }
            StreamEvent::End { request_id } => {
                let mut d = self.open.remove(&request_id)?;
                if let Some(f) = d.file.as_mut() {
                    let _ = f.flush();
                } else if let Err(e) = File::create(&d.path) {
                    return Some(format!("cannot write {}: {e}", d.path.display()));
                }
                Some(format!("saved {} ({} bytes)", d.path.display(), d.written))
            }
            StreamEvent::Error { request_id, reason } => {
                let d = self.open.remove(&request_id)?;
                if d.file.is_some() {
                    let _ = std::fs::remove_file(&d.path);
                }
                Some(format!("download {request_id} failed: {reason}"))
            }
        }
    }
}

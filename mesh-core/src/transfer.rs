//! Chunk transfer engine: multi-source windowed download of file objects, in-order hand-off to a
//! stream sink, and the serving side of chunk requests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::chunk::{self, ByteRange, ChunkSpan};
use crate::core::Action;
use crate::gossip::{Interceptor, Verdict};
use crate::mesh::{ConnState, PeerMesh};
use crate::protocol::{ChatMessage, FileMeta, MessageBody, Packet, PeerId};
use crate::scheduler;
use crate::store::ObjectStore;
use crate::wire::{self, ChunkHeader, Payload};

/// Hand-off to the external stream consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Open {
        request_id: u64,
        total_size: u64,
        mime_type: String,
        range: (u64, u64),
    },
    Data { request_id: u64, bytes: Vec<u8> },
    End { request_id: u64 },
    Error { request_id: u64, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Requested,
    /// Waiting for metadata or a holder.
    Discovering,
    /// Window active.
    Pumping,
    Finished,
}

/// One outstanding stream request.
#[derive(Debug)]
pub struct TransferTask {
    pub file_id: String,
    pub request_id: u64,
    requested: Option<(u64, u64)>,
    range: Option<ByteRange>,
    cursor: u64,
    buffer: BTreeMap<u64, Vec<u8>>,
    inflight: HashMap<u64, Instant>,
    received: HashSet<u64>,
    holders: HashSet<PeerId>,
    /// Last WHO_HAS round while discovering.
    queried_at: Option<Instant>,
    state: TaskState,
}

impl TransferTask {
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn holders(&self) -> usize {
        self.holders.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown request {0}")]
    UnknownRequest(u64),
}

/// Inbound interceptor that hands file-share metadata, with the sender as first holder, to the
/// engine it was made by. Never drops.
pub struct ShareCapture {
    tx: mpsc::Sender<(FileMeta, PeerId)>,
}

impl Interceptor for ShareCapture {
    fn inbound(&mut self, message: &ChatMessage, _from: Option<&PeerId>) -> Verdict {
        if let MessageBody::FileShare(meta) = &message.body {
            // The engine owns the receiver; a send only fails once it is gone.
            let _ = self.tx.send((meta.clone(), message.sender_id.clone()));
        }
        Verdict::Pass
    }
}

pub struct TransferEngine {
    tasks: HashMap<u64, TransferTask>,
    /// File metadata learned from shares and HAVE replies.
    catalog: HashMap<String, FileMeta>,
    /// Known holders per file id.
    holders: HashMap<String, HashSet<PeerId>>,
    next_request_id: u64,
    chunk_size: u64,
    window: usize,
    timeout: Duration,
    shares_tx: mpsc::Sender<(FileMeta, PeerId)>,
    shares: mpsc::Receiver<(FileMeta, PeerId)>,
}

impl TransferEngine {
    pub fn new(chunk_size: u64, window: usize, timeout: Duration) -> Self {
        let (shares_tx, shares) = mpsc::channel();
        Self {
            shares_tx,
            shares,
            tasks: HashMap::new(),
            catalog: HashMap::new(),
            holders: HashMap::new(),
            next_request_id: 1,
            chunk_size,
            window: window.max(1),
            timeout,
        }
    }

    pub fn task(&self, request_id: u64) -> Option<&TransferTask> {
        self.tasks.get(&request_id)
    }

    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    pub fn meta(&self, file_id: &str) -> Option<&FileMeta> {
        self.catalog.get(file_id)
    }

    /// Interceptor feeding this engine; register it in the gossip chain.
    pub fn capture(&self) -> ShareCapture {
        ShareCapture {
            tx: self.shares_tx.clone(),
        }
    }

    /// Learn everything captured since the last call.
    pub fn absorb_shares(&mut self) {
        while let Ok((meta, holder)) = self.shares.try_recv() {
            tracing::trace!(file_id = %meta.file_id, %holder, "file share captured");
            self.learn(meta, Some(holder));
        }
    }

    /// Cache metadata and, when known, a holder of the object.
    pub fn learn(&mut self, meta: FileMeta, holder: Option<PeerId>) {
        if let Some(h) = holder {
            self.holders
                .entry(meta.file_id.clone())
                .or_default()
                .insert(h);
        }
        self.catalog.insert(meta.file_id.clone(), meta);
    }

    /// Start streaming `file_id` (whole object when `range` is `None`). Returns the request id.
    pub fn open(
        &mut self,
        file_id: &str,
        range: Option<(u64, u64)>,
        mesh: &mut PeerMesh,
        now: Instant,
        out: &mut Vec<Action>,
    ) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let holders = self.holders.get(file_id).cloned().unwrap_or_default();
        let mut task = TransferTask {
            file_id: file_id.to_owned(),
            request_id,
            requested: range,
            range: None,
            cursor: 0,
            buffer: BTreeMap::new(),
            inflight: HashMap::new(),
            received: HashSet::new(),
            holders,
            queried_at: None,
            state: TaskState::Requested,
        };
        let meta = self.catalog.get(file_id).cloned();
        match meta {
            Some(meta) if !task.holders.is_empty() => {
                if self.begin(&mut task, &meta, out) {
                    self.tasks.insert(request_id, task);
                    self.pump(request_id, mesh, now, out);
                }
            }
            _ => {
                task.state = TaskState::Discovering;
                task.queried_at = Some(now);
                tracing::debug!(file_id, request_id, "discovering holders");
                who_has(file_id, mesh.open_peers(), out);
                self.tasks.insert(request_id, task);
            }
        }
        request_id
    }

    /// Resolve the range and announce the stream. False if the task ended here (error or empty object).
    fn begin(&self, task: &mut TransferTask, meta: &FileMeta, out: &mut Vec<Action>) -> bool {
        let request_id = task.request_id;
        match ByteRange::resolve(task.requested, meta.file_size) {
            Err(e) => {
                out.push(Action::Stream(StreamEvent::Error {
                    request_id,
                    reason: e.to_string(),
                }));
                false
            }
            Ok(None) => {
                out.push(Action::Stream(StreamEvent::Open {
                    request_id,
                    total_size: 0,
                    mime_type: meta.file_type.clone(),
                    range: (0, 0),
                }));
                out.push(Action::Stream(StreamEvent::End { request_id }));
                false
            }
            Ok(Some(range)) => {
                task.range = Some(range);
                task.cursor = range.start;
                task.state = TaskState::Pumping;
                out.push(Action::Stream(StreamEvent::Open {
                    request_id,
                    total_size: meta.file_size,
                    mime_type: meta.file_type.clone(),
                    range: (range.start, range.end),
                }));
                true
            }
        }
    }

    /// A connection just opened: ask it about every file still being discovered.
    pub fn on_peer_open(&self, peer: &PeerId, out: &mut Vec<Action>) {
        let mut asked = HashSet::new();
        for task in self.tasks.values() {
            if task.state == TaskState::Discovering && asked.insert(task.file_id.as_str()) {
                who_has(&task.file_id, [peer.clone()], out);
            }
        }
    }

    /// HAVE from `from`: record the holder on every matching task and start discovering ones.
    pub fn on_have(
        &mut self,
        from: &PeerId,
        meta: FileMeta,
        mesh: &mut PeerMesh,
        now: Instant,
        out: &mut Vec<Action>,
    ) {
        let file_id = meta.file_id.clone();
        self.learn(meta.clone(), Some(from.clone()));
        let matching: Vec<u64> = self
            .tasks
            .values()
            .filter(|t| t.file_id == file_id)
            .map(|t| t.request_id)
            .collect();
        for request_id in matching {
            let Some(mut task) = self.tasks.remove(&request_id) else {
                continue;
            };
            task.holders.insert(from.clone());
            if task.state == TaskState::Discovering && !self.begin(&mut task, &meta, out) {
                continue;
            }
            self.tasks.insert(request_id, task);
            self.pump(request_id, mesh, now, out);
        }
    }

    /// Flush contiguous bytes to the sink, finish past the end, then refill the request window.
    pub fn pump(&mut self, request_id: u64, mesh: &mut PeerMesh, now: Instant, out: &mut Vec<Action>) {
        let Some(task) = self.tasks.get_mut(&request_id) else {
            return;
        };
        let Some(range) = task.range else {
            return;
        };
        if task.state != TaskState::Pumping {
            return;
        }

        while let Some(bytes) = task.buffer.remove(&task.cursor) {
            task.cursor += bytes.len() as u64;
            out.push(Action::Stream(StreamEvent::Data { request_id, bytes }));
        }
        if task.cursor > range.end {
            task.state = TaskState::Finished;
            out.push(Action::Stream(StreamEvent::End { request_id }));
            tracing::debug!(request_id, file_id = %task.file_id, "transfer finished");
            self.tasks.remove(&request_id);
            return;
        }

        let free = self.window.saturating_sub(task.inflight.len());
        if free == 0 {
            return;
        }
        let reachable: Vec<PeerId> = {
            let mut v: Vec<PeerId> = task.holders.iter().filter_map(|h| mesh.resolve(h)).collect();
            v.sort();
            v.dedup();
            v
        };
        if reachable.is_empty() {
            // Dial a random holder not already being dialed, so a dead one is not retried forever.
            let idle: Vec<PeerId> = task
                .holders
                .iter()
                .filter(|h| mesh.get(h).map_or(true, |c| c.state == ConnState::Closed))
                .cloned()
                .collect();
            if let Some(h) = scheduler::pick_holder(&idle, &mut rand::thread_rng()) {
                mesh.connect(h, now, out);
            }
            return;
        }

        // The cursor only advances by whole chunks, so it stays on a chunk boundary.
        let rest = ByteRange {
            start: task.cursor,
            end: range.end,
        };
        let offsets: Vec<ChunkSpan> = chunk::split_range(rest, self.chunk_size)
            .filter(|span| !task.received.contains(&span.offset) && !task.inflight.contains_key(&span.offset))
            .take(free)
            .collect();
        let picks: Vec<u64> = offsets.iter().map(|s| s.offset).collect();
        let assigned = scheduler::assign_offsets(&picks, &reachable, &mut rand::thread_rng());
        for ((holder_offset, holder), span) in assigned.into_iter().zip(offsets) {
            debug_assert_eq!(holder_offset, span.offset);
            task.inflight.insert(span.offset, now);
            out.push(Action::Send {
                peer: holder,
                payload: Payload::Packet(Packet::Get {
                    request_id,
                    file_id: task.file_id.clone(),
                    offset: span.offset,
                    size: span.len,
                }),
            });
        }
    }

    /// Evict in-flight requests older than the timeout and re-pump their tasks. Tasks still
    /// discovering repeat their WHO_HAS once per timeout period.
    pub fn watchdog(&mut self, mesh: &mut PeerMesh, now: Instant, out: &mut Vec<Action>) {
        let mut expired = Vec::new();
        for task in self.tasks.values_mut() {
            if task.state == TaskState::Discovering {
                let due = task
                    .queried_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.timeout);
                if due {
                    tracing::debug!(request_id = task.request_id, file_id = %task.file_id, "repeating WHO_HAS");
                    task.queried_at = Some(now);
                    who_has(&task.file_id, mesh.open_peers(), out);
                }
                continue;
            }
            let before = task.inflight.len();
            task.inflight
                .retain(|_, at| now.saturating_duration_since(*at) <= self.timeout);
            if task.inflight.len() != before {
                tracing::debug!(
                    request_id = task.request_id,
                    evicted = before - task.inflight.len(),
                    "chunk requests timed out"
                );
            }
            if task.state == TaskState::Pumping {
                expired.push(task.request_id);
            }
        }
        for request_id in expired {
            self.pump(request_id, mesh, now, out);
        }
    }

    /// Binary chunk frame from a holder.
    pub fn on_chunk_frame(&mut self, frame: &[u8], mesh: &mut PeerMesh, now: Instant, out: &mut Vec<Action>) {
        let (header, body) = match wire::decode_chunk_frame(frame) {
            Ok(x) => x,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed chunk frame");
                return;
            }
        };
        let Some(task) = self.tasks.get_mut(&header.request_id) else {
            tracing::trace!(request_id = header.request_id, "chunk for unknown request");
            return;
        };
        let Some(span) = task
            .range
            .and_then(|r| r.span_at(header.offset, self.chunk_size))
        else {
            tracing::debug!(request_id = header.request_id, offset = header.offset, "chunk outside range");
            return;
        };
        if task.received.contains(&span.offset) || span.offset < task.cursor {
            tracing::trace!(request_id = header.request_id, offset = span.offset, "duplicate chunk");
            return;
        }
        if body.len() as u64 != span.len {
            tracing::debug!(
                request_id = header.request_id,
                offset = span.offset,
                got = body.len(),
                want = span.len,
                "chunk length mismatch"
            );
            task.inflight.remove(&span.offset);
            return;
        }
        task.received.insert(span.offset);
        task.inflight.remove(&span.offset);
        task.buffer.insert(span.offset, body.to_vec());
        self.pump(header.request_id, mesh, now, out);
    }

    /// Drop a task and all of its bookkeeping.
    pub fn cancel(&mut self, request_id: u64) -> Result<(), TransferError> {
        self.tasks
            .remove(&request_id)
            .map(|_| ())
            .ok_or(TransferError::UnknownRequest(request_id))
    }
}

fn who_has(file_id: &str, peers: impl IntoIterator<Item = PeerId>, out: &mut Vec<Action>) {
    for peer in peers {
        out.push(Action::Send {
            peer,
            payload: Payload::Packet(Packet::WhoHas {
                file_id: file_id.to_owned(),
            }),
        });
    }
}

/// Answer a WHO_HAS if we hold the object.
pub fn answer_who_has(objects: &dyn ObjectStore, from: &PeerId, file_id: &str) -> Option<Action> {
    let meta = objects.meta(file_id)?;
    Some(Action::Send {
        peer: from.clone(),
        payload: Payload::Packet(Packet::Have {
            file_id: file_id.to_owned(),
            meta,
        }),
    })
}

/// Serve a GET: read exactly the requested range and reply with a binary chunk frame.
pub fn serve_get(
    objects: &dyn ObjectStore,
    from: &PeerId,
    request_id: u64,
    file_id: &str,
    span: ChunkSpan,
) -> Option<Action> {
    let Some(bytes) = objects.read(file_id, span.offset, span.len) else {
        tracing::debug!(file_id, offset = span.offset, len = span.len, "GET for unavailable range");
        return None;
    };
    let header = ChunkHeader {
        request_id,
        offset: span.offset,
    };
    match wire::encode_chunk_frame(header, &bytes) {
        Ok(frame) => Some(Action::Send {
            peer: from.clone(),
            payload: Payload::Binary(frame),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode chunk frame");
            None
        }
    }
}

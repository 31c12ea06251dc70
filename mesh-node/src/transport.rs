//! Peer transport: TCP server (incoming), TCP client (outbound dials), identity handshake and
//! tagged payload frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mesh_core::wire::{decode_payload, encode_payload};
use mesh_core::{Payload, PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::driver::Event;

const MAX_ID_LEN: usize = 255;
/// tag + length prefix
const HEADER_SIZE: usize = 1 + 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

enum Outgoing {
    Payload(Payload),
    Close,
}

/// Write side of one open connection, owned by the driver.
pub struct Conn {
    pub id: u64,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Conn {
    pub fn send(&self, payload: Payload) -> bool {
        self.tx.send(Outgoing::Payload(payload)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// What each side announces right after the TCP connect.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Handshake {
    id: PeerId,
    listen_port: u16,
}

/// Accept incoming connections forever. `local` is the transport identity we currently answer to.
pub async fn run_listener(
    port: u16,
    local: watch::Receiver<PeerId>,
    events: mpsc::UnboundedSender<Event>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening for peers");
    loop {
        let (stream, addr) = listener.accept().await?;
        let local = local.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let me = Handshake {
                id: local.borrow().clone(),
                listen_port: port,
            };
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange(stream, &me)).await {
                Ok(Ok((stream, remote))) => {
                    let (conn, run) = open(stream, events.clone());
                    let _ = events.send(Event::Accepted {
                        conn,
                        peer: remote.id,
                        addr: SocketAddr::new(addr.ip(), remote.listen_port),
                    });
                    run.await;
                }
                Ok(Err(e)) => tracing::debug!(%addr, error = %e, "inbound handshake failed"),
                Err(_) => tracing::debug!(%addr, "inbound handshake timed out"),
            }
        });
    }
}

/// Dial `addr`, expecting it to answer as `peer`. Reports `Dialed` or `DialFailed` for `epoch`.
pub fn dial(
    addr: SocketAddr,
    me: PeerId,
    listen_port: u16,
    peer: PeerId,
    epoch: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        let me = Handshake { id: me, listen_port };
        let attempt = async {
            let stream = TcpStream::connect(addr).await?;
            exchange(stream, &me).await
        };
        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, attempt).await;
        let reason = match result {
            Ok(Ok((stream, remote))) if remote.id == peer => {
                let (conn, run) = open(stream, events.clone());
                let _ = events.send(Event::Dialed { conn, peer, epoch });
                run.await;
                return;
            }
            Ok(Ok((_, remote))) => format!("answered as {}", remote.id),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handshake timed out".to_owned(),
        };
        let _ = events.send(Event::DialFailed { peer, epoch, reason });
    });
}

/// Both sides write their handshake, then read the other's.
async fn exchange(mut stream: TcpStream, me: &Handshake) -> std::io::Result<(TcpStream, Handshake)> {
    stream.write_all(&handshake_bytes(me)?).await?;
    stream.flush().await?;
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut id = vec![0u8; head[1] as usize];
    stream.read_exact(&mut id).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let id = String::from_utf8(id).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if id.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty peer id"));
    }
    Ok((
        stream,
        Handshake {
            id: PeerId::new(id),
            listen_port: u16::from_le_bytes(port),
        },
    ))
}

/// `[version][id_len][id bytes][listen_port LE]`
fn handshake_bytes(me: &Handshake) -> std::io::Result<Vec<u8>> {
    let id = me.id.as_str().as_bytes();
    if id.len() > MAX_ID_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "peer id too long"));
    }
    let mut out = Vec::with_capacity(4 + id.len());
    out.push(PROTOCOL_VERSION);
    out.push(id.len() as u8);
    out.extend_from_slice(id);
    out.extend_from_slice(&me.listen_port.to_le_bytes());
    Ok(out)
}

/// Split an established stream into a driver-owned `Conn` and the read loop future. The caller
/// must publish the `Conn` before awaiting the loop so `Data` never precedes the open event.
fn open(
    stream: TcpStream,
    events: mpsc::UnboundedSender<Event>,
) -> (Conn, impl std::future::Future<Output = ()>) {
    let id = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(writer, rx, stop_tx));
    let run = async move {
        let reason = tokio::select! {
            r = read_loop(reader, id, &events) => r,
            _ = stop_rx => None,
        };
        let _ = events.send(Event::Closed { conn_id: id, reason });
    };
    (Conn { id, tx }, run)
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    stop: oneshot::Sender<()>,
) {
    while let Some(out) = rx.recv().await {
        let payload = match out {
            Outgoing::Payload(p) => p,
            Outgoing::Close => break,
        };
        let bytes = match encode_payload(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unencodable payload");
                continue;
            }
        };
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    let _ = stop.send(());
}

/// Read frames until EOF or a protocol violation. Returns the close reason, if abnormal.
async fn read_loop(
    mut reader: OwnedReadHalf,
    id: u64,
    events: &mpsc::UnboundedSender<Event>,
) -> Option<String> {
    let mut frame = Vec::new();
    loop {
        let mut head = [0u8; HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut head).await {
            return (e.kind() != std::io::ErrorKind::UnexpectedEof).then(|| e.to_string());
        }
        let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Some(format!("frame of {len} bytes exceeds limit"));
        }
        frame.clear();
        frame.extend_from_slice(&head);
        frame.resize(HEADER_SIZE + len, 0);
        if let Err(e) = reader.read_exact(&mut frame[HEADER_SIZE..]).await {
            return Some(e.to_string());
        }
        match decode_payload(&frame) {
            Ok((payload, _)) => {
                if events.send(Event::Data { conn_id: id, payload }).is_err() {
                    return None;
                }
            }
            // Malformed packets are dropped; the stream stays framed.
            Err(e) => tracing::debug!(conn = id, error = %e, "dropping malformed frame"),
        }
    }
}

//! Line-oriented chat console on stdin/stdout.

use std::path::{Path, PathBuf};

use mesh_core::{ChatMessage, MessageBody, PeerSummary, Target};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::driver::Event;

const HELP: &str = "\
commands:
  <text>                    broadcast a message
  /dm <peer> <text>         direct message
  /share <path>             share a file with everyone
  /get <file_id> [out]      download a shared file
  /cancel <request>         stop a download
  /peers  /contacts  /status
  /history [n]
  /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Dm { peer: String, text: String },
    Share(PathBuf),
    Get { file_id: String, out: Option<PathBuf> },
    Cancel(u64),
    Peers,
    Contacts,
    Status,
    History(usize),
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_owned())));
    };
    let (cmd, args) = match rest.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (rest, ""),
    };
    let command = match cmd {
        "dm" => {
            let (peer, text) = args
                .split_once(char::is_whitespace)
                .ok_or("usage: /dm <peer> <text>")?;
            Command::Dm {
                peer: peer.to_owned(),
                text: text.trim().to_owned(),
            }
        }
        "share" if !args.is_empty() => Command::Share(PathBuf::from(args)),
        "share" => return Err("usage: /share <path>".into()),
        "get" => {
            let mut parts = args.split_whitespace();
            let file_id = parts.next().ok_or("usage: /get <file_id> [out]")?.to_owned();
            Command::Get {
                file_id,
                out: parts.next().map(PathBuf::from),
            }
        }
        "cancel" => Command::Cancel(args.parse().map_err(|_| "usage: /cancel <request>")?),
        "peers" => Command::Peers,
        "contacts" => Command::Contacts,
        "status" => Command::Status,
        "history" if args.is_empty() => Command::History(20),
        "history" => Command::History(args.parse().map_err(|_| "usage: /history [n]")?),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(command))
}

pub fn help() -> &'static str {
    HELP
}

/// Read stdin until EOF, forwarding parsed commands to the driver.
pub async fn run(events: mpsc::UnboundedSender<Event>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        match parse(&line) {
            Ok(Some(cmd)) => {
                if events.send(Event::Command(cmd)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => println!("{e}"),
        }
    }
    let _ = events.send(Event::Command(Command::Quit));
}

/// Best-effort MIME type from the file extension.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt" | "md" | "log") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

pub fn render(m: &ChatMessage) -> String {
    let who = m.sender_name.as_deref().unwrap_or(m.sender_id.as_str());
    let dm = match &m.target {
        Target::Broadcast => "",
        Target::Peer(_) => " (dm)",
    };
    match &m.body {
        MessageBody::Text(t) => format!("[{}] {who}{dm}: {t}", m.logical_time()),
        MessageBody::FileShare(f) => format!(
            "[{}] {who}{dm} shared {} ({} bytes, {}) id {}",
            m.logical_time(),
            f.file_name,
            f.file_size,
            f.file_type,
            f.file_id
        ),
    }
}

pub fn render_peer(p: &PeerSummary) -> String {
    let mut line = format!("{} {:?}", p.peer_id, p.state);
    if let Some(id) = &p.identity {
        if *id != p.peer_id {
            line.push_str(&format!(" identity {id}"));
        }
    }
    if let Some(label) = &p.label {
        line.push_str(&format!(" \"{label}\""));
    }
    if p.inbound {
        line.push_str(" inbound");
    }
    line
}

//! Load config from file and environment.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use mesh_core::{MeshConfig, PeerId};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/meshchat/config.toml or /etc/meshchat/config.toml.
/// Env overrides: MESHCHAT_LISTEN_PORT, MESHCHAT_PRESENCE, MESHCHAT_FALLBACK, MESHCHAT_NAME,
/// MESHCHAT_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer transport TCP port (default 47800).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Presence UDP port, shared by the multicast group (default 47801).
    #[serde(default = "default_presence_port")]
    pub presence_port: u16,
    #[serde(default = "default_presence_group")]
    pub presence_group: Ipv4Addr,
    /// Unicast presence relay used after the multicast group fails.
    #[serde(default)]
    pub fallback_relay: Option<SocketAddr>,
    /// Display name attached to outgoing messages.
    #[serde(default = "default_name")]
    pub name: String,
    /// Identity, history and shared files live here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Messages kept on disk; the oldest go first (default 10000).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Senders whose messages are relayed but never shown or stored.
    #[serde(default)]
    pub muted: Vec<PeerId>,
    #[serde(default)]
    pub mesh: MeshConfig,
}

fn default_listen_port() -> u16 {
    47800
}
fn default_presence_port() -> u16 {
    47801
}
fn default_presence_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anon".to_owned())
}
fn default_history_limit() -> usize {
    10_000
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/meshchat"),
        None => PathBuf::from("meshchat-data"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            presence_port: default_presence_port(),
            presence_group: default_presence_group(),
            fallback_relay: None,
            name: default_name(),
            data_dir: default_data_dir(),
            history_limit: default_history_limit(),
            muted: Vec::new(),
            mesh: MeshConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

/// Env overrides; unparsable values are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("MESHCHAT_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(p) = var("MESHCHAT_PRESENCE").and_then(|s| s.parse().ok()) {
        c.presence_port = p;
    }
    if let Some(a) = var("MESHCHAT_FALLBACK").and_then(|s| s.parse().ok()) {
        c.fallback_relay = Some(a);
    }
    if let Some(n) = var("MESHCHAT_NAME").filter(|s| !s.trim().is_empty()) {
        c.name = n;
    }
    if let Some(d) = var("MESHCHAT_DATA_DIR") {
        c.data_dir = PathBuf::from(d);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config file, using defaults"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file, using defaults"),
            }
            break;
        }
    }
    None
}

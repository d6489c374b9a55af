//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use tracing::warn;

/// Daemon configuration. File: ~/.config/mesh/config.toml or /etc/mesh/config.toml.
/// Env overrides: MESH_LISTEN_PORT, MESH_PRESENCE_PORT, MESH_HTTP_PORT, MESH_DISPLAY_NAME, MESH_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer transport TCP port (default 47000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Presence multicast UDP port (default 47001).
    #[serde(default = "default_presence_port")]
    pub presence_port: u16,
    /// Loopback byte-range server port (default 47080).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Host other peers should dial us on. Advertised in HELLO, gossip and presence.
    #[serde(default)]
    pub advertise_host: Option<String>,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Holds the persisted peer id and finished downloads.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Well-known hub addresses; index is the hub slot.
    #[serde(default = "default_hub_addrs")]
    pub hub_addrs: Vec<String>,
    #[serde(default)]
    pub mesh: mesh_core::Config,
}

fn default_listen_port() -> u16 {
    47000
}
fn default_presence_port() -> u16 {
    47001
}
fn default_http_port() -> u16 {
    47080
}
fn default_display_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "mesh-peer".to_string())
}
fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|h| h.join(".local/share/mesh"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/mesh"))
}
fn default_hub_addrs() -> Vec<String> {
    (0..3).map(|i| format!("127.0.0.1:{}", 47100 + i)).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            presence_port: default_presence_port(),
            http_port: default_http_port(),
            advertise_host: None,
            display_name: default_display_name(),
            data_dir: default_data_dir(),
            hub_addrs: default_hub_addrs(),
            mesh: mesh_core::Config::default(),
        }
    }
}

impl Config {
    /// `host:port` peers dial us on.
    pub fn locator(&self) -> String {
        let host = self.advertise_host.as_deref().unwrap_or("127.0.0.1");
        format!("{}:{}", host, self.listen_port)
    }

    pub fn hub_addr(&self, slot: usize) -> Option<&str> {
        self.hub_addrs.get(slot).map(String::as_str)
    }

    /// Slots without an address cannot be bound or dialled.
    fn clamp_hubs(&mut self) {
        self.mesh.hub_count = self.mesh.hub_count.min(self.hub_addrs.len());
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("MESH_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("MESH_PRESENCE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.presence_port = p;
        }
    }
    if let Ok(s) = std::env::var("MESH_HTTP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.http_port = p;
        }
    }
    if let Ok(s) = std::env::var("MESH_DISPLAY_NAME") {
        c.display_name = s;
    }
    if let Some(dir) = std::env::var_os("MESH_DATA_DIR") {
        c.data_dir = PathBuf::from(dir);
    }
    c.clamp_hubs();
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/mesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/mesh/config.toml"));
    out
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| parse(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

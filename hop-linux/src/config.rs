//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use hop_core::protocol::MAX_BODY_LEN;
use hop_core::MeshConfig;
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/hopcast/config.toml or /etc/hopcast/config.toml.
/// Env overrides: HOPCAST_RADIO_PORT, HOPCAST_BODY_LEN, HOPCAST_MAX_BROADCAST_CYCLES, HOPCAST_GATEWAY_URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Multicast UDP port standing in for the radio (default 45690).
    #[serde(default = "default_radio_port")]
    pub radio_port: u16,
    /// Protocol parameters shared with every other device.
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub pacing: Pacing,
    /// Gateway endpoint. When unset this device only relays.
    #[serde(default)]
    pub gateway_url: Option<String>,
    /// Seconds between gateway reachability probes (default 10).
    #[serde(default = "default_gateway_probe_interval_secs")]
    pub gateway_probe_interval_secs: u64,
    /// Request timeout for gateway calls (default 30).
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
}

/// Broadcast loop delays, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pacing {
    /// Pause after each advertisement so it is actually seen (default 180).
    #[serde(default = "default_post_broadcast_delay_ms")]
    pub post_broadcast_delay_ms: u64,
    /// Gap between frames (default 50).
    #[serde(default = "default_inter_chunk_delay_ms")]
    pub inter_chunk_delay_ms: u64,
    /// Wait when the queue is empty (default 150).
    #[serde(default = "default_empty_queue_backoff_ms")]
    pub empty_queue_backoff_ms: u64,
    /// How often the radio repeats the active advertisement (default 100).
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
}

fn default_radio_port() -> u16 {
    45690
}
fn default_gateway_probe_interval_secs() -> u64 {
    10
}
fn default_gateway_timeout_secs() -> u64 {
    30
}
fn default_post_broadcast_delay_ms() -> u64 {
    180
}
fn default_inter_chunk_delay_ms() -> u64 {
    50
}
fn default_empty_queue_backoff_ms() -> u64 {
    150
}
fn default_advertise_interval_ms() -> u64 {
    100
}

impl Pacing {
    pub fn post_broadcast_delay(&self) -> Duration {
        Duration::from_millis(self.post_broadcast_delay_ms)
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }

    pub fn empty_queue_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_queue_backoff_ms)
    }

    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            post_broadcast_delay_ms: default_post_broadcast_delay_ms(),
            inter_chunk_delay_ms: default_inter_chunk_delay_ms(),
            empty_queue_backoff_ms: default_empty_queue_backoff_ms(),
            advertise_interval_ms: default_advertise_interval_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            radio_port: default_radio_port(),
            mesh: MeshConfig::default(),
            pacing: Pacing::default(),
            gateway_url: None,
            gateway_probe_interval_secs: default_gateway_probe_interval_secs(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Error reading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = match load_file() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            warn!(error = %e, "ignoring config file");
            Config::default()
        }
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    validate(&mut c);
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("HOPCAST_RADIO_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.radio_port = p;
    }
    if let Some(n) = var("HOPCAST_BODY_LEN").and_then(|s| s.parse::<usize>().ok()) {
        c.mesh.body_len = n;
    }
    if let Some(n) = var("HOPCAST_MAX_BROADCAST_CYCLES").and_then(|s| s.parse::<u32>().ok()) {
        c.mesh.max_broadcast_cycles = n;
    }
    if let Some(url) = var("HOPCAST_GATEWAY_URL") {
        c.gateway_url = if url.is_empty() { None } else { Some(url) };
    }
}

fn validate(c: &mut Config) {
    if c.mesh.body_len == 0 || c.mesh.body_len > MAX_BODY_LEN {
        warn!(body_len = c.mesh.body_len, "body_len out of range, using default");
        c.mesh.body_len = MeshConfig::default().body_len;
    }
    if c.mesh.max_broadcast_cycles == 0 {
        warn!("max_broadcast_cycles must be at least 1, using default");
        c.mesh.max_broadcast_cycles = MeshConfig::default().max_broadcast_cycles;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/hopcast/config.toml"));
    }
    out.push(PathBuf::from("/etc/hopcast/config.toml"));
    out
}

fn load_file() -> Result<Option<Config>, ConfigError> {
    for p in config_paths() {
        if p.exists() {
            let s = std::fs::read_to_string(&p).map_err(|source| ConfigError::Read {
                path: p.clone(),
                source,
            })?;
            let c = toml::from_str::<Config>(&s)
                .map_err(|source| ConfigError::Parse { path: p, source })?;
            return Ok(Some(c));
        }
    }
    Ok(None)
}

//! Load config from file and environment.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use courier_core::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use courier_core::Rank;
use serde::Deserialize;

/// Node configuration. File: ~/.config/courier/config.toml or /etc/courier/config.toml.
/// Env overrides: COURIER_ROUTER_RANK, COURIER_DOWNLOAD_DIR, COURIER_CHUNK_SIZE,
/// COURIER_CHUNK_DELAY_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Rank that runs the directory/relay (default 0).
    #[serde(default)]
    pub router_rank: Rank,
    /// Rank → listen address for every process in the group. Keys are decimal ranks.
    #[serde(default = "default_members")]
    pub members: BTreeMap<String, SocketAddr>,
    /// Where received files are written (default ./downloads).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Chunk size in bytes (default 1 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Pause between chunks (default 1 ms).
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    /// Bound on each receive wait (default 10 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Drop a partial download after this long without data (default 60 s).
    #[serde(default = "default_download_idle_secs")]
    pub download_idle_secs: u64,
    /// Shown to other users; `User_<rank>` when unset.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Four ranks on loopback, enough for a router and three peers on one machine.
fn default_members() -> BTreeMap<String, SocketAddr> {
    (0u16..4)
        .map(|rank| {
            (
                rank.to_string(),
                SocketAddr::from(([127, 0, 0, 1], 47100 + rank)),
            )
        })
        .collect()
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_delay_ms() -> u64 {
    1
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_download_idle_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router_rank: 0,
            members: default_members(),
            download_dir: default_download_dir(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            download_idle_secs: default_download_idle_secs(),
            display_name: None,
        }
    }
}

impl Config {
    /// Parsed member table. Fails on a key that is not a rank.
    pub fn members(&self) -> anyhow::Result<BTreeMap<Rank, SocketAddr>> {
        self.members
            .iter()
            .map(|(rank, addr)| {
                rank.parse::<Rank>()
                    .map(|r| (r, *addr))
                    .map_err(|_| anyhow!("member key {:?} is not a rank", rank))
            })
            .collect()
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn download_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.download_idle_secs.max(1))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(anyhow!(
                "chunk_size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE,
                self.chunk_size
            ));
        }
        let members = self.members()?;
        if !members.contains_key(&self.router_rank) {
            return Err(anyhow!(
                "router rank {} has no entry in members",
                self.router_rank
            ));
        }
        Ok(())
    }
}

/// Load config: default, then config file (explicit path or the first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => load_from(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_from(&path)?,
            None => Config::default(),
        },
    };
    apply_overrides(&mut c, |key| std::env::var(key).ok());
    c.validate()?;
    Ok(c)
}

pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing config {}", path.display()))
}

/// Apply `COURIER_*` overrides. Unparseable values are ignored, as with a missing variable.
fn apply_overrides(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(rank) = var("COURIER_ROUTER_RANK").and_then(|s| s.parse::<Rank>().ok()) {
        c.router_rank = rank;
    }
    if let Some(dir) = var("COURIER_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
        c.download_dir = PathBuf::from(dir);
    }
    if let Some(size) = var("COURIER_CHUNK_SIZE").and_then(|s| s.parse::<u64>().ok()) {
        c.chunk_size = size;
    }
    if let Some(ms) = var("COURIER_CHUNK_DELAY_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.chunk_delay_ms = ms;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/courier/config.toml"));
    }
    out.push(PathBuf::from("/etc/courier/config.toml"));
    out
}

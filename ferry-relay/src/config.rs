//! Load relay config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Relay configuration. File: ~/.config/ferry/relay.toml or /etc/ferry/relay.toml.
/// Env overrides: FERRY_LISTEN_ADDR, FERRY_PROPOSAL_TIMEOUT_SECS, FERRY_SESSION_IDLE_TIMEOUT_SECS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// TCP listen address (default 0.0.0.0:47800).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Seconds an unanswered proposal stays pending (default 60).
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_secs: u64,
    /// Seconds a session may go without traffic (default 30).
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 47800))
}
fn default_proposal_timeout() -> u64 {
    ferry_core::config::DEFAULT_PROPOSAL_TIMEOUT_TICKS
}
fn default_session_idle_timeout() -> u64 {
    ferry_core::config::DEFAULT_SESSION_IDLE_TIMEOUT_TICKS
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            proposal_timeout_secs: default_proposal_timeout(),
            session_idle_timeout_secs: default_session_idle_timeout(),
        }
    }
}

impl RelayConfig {
    /// Protocol tunables for the relay core. One tick is one second.
    pub fn core_config(&self) -> anyhow::Result<ferry_core::Config> {
        let config = ferry_core::Config {
            proposal_timeout_ticks: self.proposal_timeout_secs,
            session_idle_timeout_ticks: self.session_idle_timeout_secs,
            ..ferry_core::Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("FERRY_LISTEN_ADDR").and_then(|s| s.parse().ok()) {
            self.listen_addr = addr;
        }
        if let Some(secs) = var("FERRY_PROPOSAL_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.proposal_timeout_secs = secs;
        }
        if let Some(secs) = var("FERRY_SESSION_IDLE_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.session_idle_timeout_secs = secs;
        }
    }
}

/// Load config: default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<RelayConfig> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => RelayConfig::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/ferry/relay.toml"));
    }
    out.push(PathBuf::from("/etc/ferry/relay.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<RelayConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

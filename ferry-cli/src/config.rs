//! Load client config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ferry_core::DEFAULT_CHUNK_SIZE;
use serde::Deserialize;

/// Client configuration. File: ~/.config/ferry/client.toml.
/// Env overrides: FERRY_RELAY_ADDR, FERRY_DEVICE_NAME, FERRY_CHUNK_SIZE.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Relay to connect to, `host:port` (default 127.0.0.1:47800).
    #[serde(default = "default_relay_addr")]
    pub relay_addr: String,
    /// Name other devices see (default: host name).
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Bytes per chunk when sending (default 256 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

fn default_relay_addr() -> String {
    "127.0.0.1:47800".to_string()
}
fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "ferry-device".to_string())
}
fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_addr: default_relay_addr(),
            device_name: default_device_name(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ClientConfig {
    pub fn core_config(&self) -> anyhow::Result<ferry_core::Config> {
        let config = ferry_core::Config {
            chunk_size: self.chunk_size,
            ..ferry_core::Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("FERRY_RELAY_ADDR").filter(|s| !s.is_empty()) {
            self.relay_addr = addr;
        }
        if let Some(name) = var("FERRY_DEVICE_NAME").filter(|s| !s.trim().is_empty()) {
            self.device_name = name;
        }
        if let Some(size) = var("FERRY_CHUNK_SIZE").and_then(|s| s.parse().ok()) {
            self.chunk_size = size;
        }
    }
}

/// Load config: default, then ~/.config/ferry/client.toml (if present), then env vars.
pub fn load() -> anyhow::Result<ClientConfig> {
    let mut c = match config_path().filter(|p| p.exists()) {
        Some(path) => read_file(&path)?,
        None => ClientConfig::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/ferry/client.toml"))
}

fn read_file(path: &Path) -> anyhow::Result<ClientConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: ClientConfig = toml::from_str("device_name = \"desk\"").unwrap();
        assert_eq!(c.device_name, "desk");
        assert_eq!(c.relay_addr, "127.0.0.1:47800");
        assert_eq!(c.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn env_overrides() {
        let mut c = ClientConfig::default();
        c.apply_env(|k| match k {
            "FERRY_RELAY_ADDR" => Some("relay.lan:9000".into()),
            "FERRY_DEVICE_NAME" => Some("   ".into()),
            "FERRY_CHUNK_SIZE" => Some("4096".into()),
            _ => None,
        });
        assert_eq!(c.relay_addr, "relay.lan:9000");
        assert_ne!(c.device_name.trim(), "");
        assert_eq!(c.chunk_size, 4096);
    }

    #[test]
    fn oversized_chunk_rejected() {
        let c = ClientConfig {
            chunk_size: 64 * 1024 * 1024,
            ..ClientConfig::default()
        };
        assert!(c.core_config().is_err());
    }
}

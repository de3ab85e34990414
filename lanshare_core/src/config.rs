use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::DISCOVERY_PORT;
use crate::transfer::TRANSFER_PORT;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "lanshare";
const APP_NAME: &str = "lanshare";
const CONFIG_FILE: &str = "config.json";

/// Environment variable that redirects the config directory (tests, portable installs)
pub const CONFIG_DIR_ENV: &str = "LANSHARE_CONFIG_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discovery_port: u16,
    pub transfer_port: u16,
    /// Where discovery probes go; a broadcast address on a real LAN
    pub broadcast_addr: SocketAddr,
    /// Extra unicast or directed-broadcast probe targets
    pub extra_probe_targets: Vec<SocketAddr>,
    pub discovery_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub server_root: PathBuf,
    pub download_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        // ~/lanshare_received on every platform
        let download_dir = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanshare_received");

        Self {
            discovery_port: DISCOVERY_PORT,
            transfer_port: TRANSFER_PORT,
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], DISCOVERY_PORT)),
            extra_probe_targets: Vec::new(),
            discovery_timeout_ms: 2_000,
            handshake_timeout_ms: 5_000,
            server_root: PathBuf::from("."),
            download_dir,
        }
    }
}

impl AppConfig {
    /// Get the config file path
    fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> std::io::Result<()> {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// All addresses a discovery probe is sent to
    pub fn probe_targets(&self) -> Vec<SocketAddr> {
        let mut targets = vec![self.broadcast_addr];
        for target in &self.extra_probe_targets {
            if !targets.contains(target) {
                targets.push(*target);
            }
        }
        targets
    }
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

//! TOML configuration file loading
//!
//! Supports `~/.config/toy-link/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ToyLinkConfigFile {
    /// Gateway connection settings
    #[serde(default)]
    pub gateway: GatewayFileConfig,

    /// Device identity
    #[serde(default)]
    pub device: DeviceFileConfig,

    /// Session supervision tuning
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Gateway connection settings
#[derive(Debug, Default, Deserialize)]
pub struct GatewayFileConfig {
    /// Base URL of the voice gateway (e.g. `https://voice.example.com`)
    pub url: Option<String>,

    /// STUN/TURN URLs used for ICE
    pub ice_servers: Option<Vec<String>>,
}

/// Device identity
#[derive(Debug, Default, Deserialize)]
pub struct DeviceFileConfig {
    pub device_id: Option<String>,
    pub toy_id: Option<String>,
    pub user_id: Option<String>,
}

/// Heartbeat and reconnection tuning
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Seconds between keepalive pings
    pub heartbeat_secs: Option<u64>,

    /// Automatic reconnection attempts before giving up
    pub max_reconnect_attempts: Option<u32>,

    /// Base reconnection delay in milliseconds (multiplied by the attempt number)
    pub reconnect_base_delay_ms: Option<u64>,

    /// Upper bound on ICE gathering before the answer is submitted, in milliseconds
    pub gather_timeout_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ToyLinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ToyLinkConfigFile {
    config_file_path().map_or_else(ToyLinkConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> ToyLinkConfigFile {
    if !path.exists() {
        return ToyLinkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ToyLinkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ToyLinkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/toy-link/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("toy-link").join("config.toml"))
}

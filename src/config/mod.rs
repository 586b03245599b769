//! Configuration management for the toy link client

pub mod file;

use std::time::Duration;

use crate::{Error, Result};

use file::ToyLinkConfigFile;

/// Public STUN servers used when none are configured
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Interval between keepalive pings while connected
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Automatic reconnection attempts before the client gives up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base reconnection delay, multiplied by the attempt number
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on ICE candidate gathering before the answer is sent
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Toy link client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the voice gateway
    pub gateway_url: String,

    /// Physical or simulated device identifier
    pub device_id: String,

    /// Toy identifier, sent to the gateway as `toyId`
    pub toy_id: String,

    /// Optional owning user
    pub user_id: Option<String>,

    /// STUN/TURN URLs for ICE
    pub ice_servers: Vec<String>,

    /// Keepalive ping interval
    pub heartbeat_interval: Duration,

    /// Automatic reconnection attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Linear backoff unit between reconnection attempts
    pub reconnect_base_delay: Duration,

    /// Upper bound on ICE gathering
    pub gather_timeout: Duration,
}

/// Values supplied explicitly by the caller (e.g. CLI flags)
///
/// These take precedence over the environment and the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub gateway_url: Option<String>,
    pub device_id: Option<String>,
    pub toy_id: Option<String>,
    pub user_id: Option<String>,
    pub ice_servers: Option<Vec<String>>,
}

impl ClientConfig {
    /// Create a configuration with default supervision settings
    pub fn new(
        gateway_url: impl Into<String>,
        device_id: impl Into<String>,
        toy_id: impl Into<String>,
    ) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            device_id: device_id.into(),
            toy_id: toy_id.into(),
            user_id: None,
            ice_servers: default_ice_servers(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
        }
    }

    /// Set the owning user
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Replace the ICE server list (an empty list disables STUN entirely)
    #[must_use]
    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    /// Override the reconnection policy
    #[must_use]
    pub const fn with_reconnect(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_delay = base_delay;
        self
    }

    /// Override the heartbeat interval
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Override the ICE gathering timeout
    #[must_use]
    pub const fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a required field is missing
    pub fn load() -> Result<Self> {
        Self::load_with(ConfigOverrides::default())
    }

    /// Load configuration with explicit overrides (flags > env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a required field is missing
    pub fn load_with(overrides: ConfigOverrides) -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok(), overrides)
    }

    /// Merge all sources into a validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if a required field is missing or empty
    pub fn resolve<F>(fc: ToyLinkConfigFile, env: F, overrides: ConfigOverrides) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |flag: Option<String>, key: &str, file: Option<String>| {
            flag.or_else(|| env(key)).or(file)
        };

        let gateway_url = pick(overrides.gateway_url, "TOY_LINK_GATEWAY_URL", fc.gateway.url)
            .unwrap_or_default();
        let device_id = pick(overrides.device_id, "TOY_LINK_DEVICE_ID", fc.device.device_id)
            .unwrap_or_default();
        let toy_id =
            pick(overrides.toy_id, "TOY_LINK_TOY_ID", fc.device.toy_id).unwrap_or_default();
        let user_id = pick(overrides.user_id, "TOY_LINK_USER_ID", fc.device.user_id)
            .filter(|u| !u.trim().is_empty());

        let ice_servers = overrides
            .ice_servers
            .or_else(|| env("TOY_LINK_ICE_SERVERS").map(|v| split_list(&v)))
            .or(fc.gateway.ice_servers)
            .unwrap_or_else(default_ice_servers);

        let session = fc.session;
        let config = Self {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            device_id,
            toy_id,
            user_id,
            ice_servers,
            heartbeat_interval: session
                .heartbeat_secs
                .map_or(DEFAULT_HEARTBEAT_INTERVAL, Duration::from_secs),
            max_reconnect_attempts: session
                .max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            reconnect_base_delay: session
                .reconnect_base_delay_ms
                .map_or(DEFAULT_RECONNECT_BASE_DELAY, Duration::from_millis),
            gather_timeout: session
                .gather_timeout_ms
                .map_or(DEFAULT_GATHER_TIMEOUT, Duration::from_millis),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that the required identifiers are present
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first empty field
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("gateway url", &self.gateway_url),
            ("device id", &self.device_id),
            ("toy id", &self.toy_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }

        if !self.gateway_url.starts_with("http://") && !self.gateway_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "gateway url must be http(s): {}",
                self.gateway_url
            )));
        }

        Ok(())
    }
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(ToString::to_string).collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use trellis_types::{MAX_CHANNEL_COUNT, MIN_CHANNEL_COUNT};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    defaults: DefaultsConfig,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    allocation: AllocationConfig,
}

#[derive(Deserialize, Default)]
struct DefaultsConfig {
    channel_count: Option<u8>,
    tempo: Option<f64>,
    time_signature: Option<[u32; 2]>,
}

#[derive(Deserialize, Default)]
struct ServerConfig {
    host: Option<String>,
    port: Option<u16>,
    boot_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    reply_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct AllocationConfig {
    first_private_bus: Option<i32>,
    first_node_id: Option<i32>,
}

/// Resolved values an application runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub channel_count: u8,
    pub tempo: f64,
    pub time_signature: (u32, u32),
    pub server_host: String,
    pub server_port: u16,
    /// Connection attempts per context before boot gives up on it.
    pub boot_retries: u32,
    pub retry_backoff: Duration,
    pub reply_timeout: Duration,
    pub first_private_bus: i32,
    pub first_node_id: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel_count: 2,
            tempo: 120.0,
            time_signature: (4, 4),
            server_host: "127.0.0.1".to_string(),
            server_port: 57110,
            boot_retries: 3,
            retry_backoff: Duration::from_millis(250),
            reply_timeout: Duration::from_millis(1000),
            first_private_bus: 16,
            first_node_id: 1000,
        }
    }
}

pub struct Config {
    defaults: DefaultsConfig,
    server: ServerConfig,
    allocation: AllocationConfig,
}

impl Config {
    /// Embedded defaults merged with the user's config file, if any.
    pub fn load() -> Self {
        match user_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::embedded(),
        }
    }

    /// Embedded defaults merged with the file at `path`. A missing or
    /// malformed file leaves the defaults in place.
    pub fn load_from(path: &Path) -> Self {
        let mut config = Self::embedded();
        if !path.exists() {
            return config;
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                Ok(user) => config.merge(user),
                Err(e) => {
                    log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                }
            },
            Err(e) => {
                log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
            }
        }
        config
    }

    /// Embedded defaults merged with a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let user = toml::from_str::<ConfigFile>(contents)?;
        let mut config = Self::embedded();
        config.merge(user);
        Ok(config)
    }

    fn embedded() -> Self {
        let base: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|e| {
            log::error!(target: "config", "embedded config.toml is invalid: {}", e);
            ConfigFile::default()
        });
        Config {
            defaults: base.defaults,
            server: base.server,
            allocation: base.allocation,
        }
    }

    fn merge(&mut self, user: ConfigFile) {
        merge_defaults(&mut self.defaults, user.defaults);
        merge_server(&mut self.server, user.server);
        merge_allocation(&mut self.allocation, user.allocation);
    }

    /// Default channel count for new applications (clamped to 1..=8).
    pub fn channel_count(&self) -> u8 {
        self.defaults
            .channel_count
            .unwrap_or(2)
            .clamp(MIN_CHANNEL_COUNT, MAX_CHANNEL_COUNT)
    }

    pub fn tempo(&self) -> f64 {
        match self.defaults.tempo {
            Some(tempo) if tempo > 0.0 && tempo.is_finite() => tempo,
            _ => 120.0,
        }
    }

    pub fn time_signature(&self) -> (u32, u32) {
        match self.defaults.time_signature {
            Some([numerator, denominator]) if numerator >= 1 && denominator >= 1 => {
                (numerator, denominator)
            }
            _ => (4, 4),
        }
    }

    /// Connection attempts per context (at least one).
    pub fn boot_retries(&self) -> u32 {
        self.server.boot_retries.unwrap_or(3).max(1)
    }

    pub fn settings(&self) -> Settings {
        let fallback = Settings::default();
        Settings {
            channel_count: self.channel_count(),
            tempo: self.tempo(),
            time_signature: self.time_signature(),
            server_host: self.server.host.clone().unwrap_or(fallback.server_host),
            server_port: self.server.port.unwrap_or(fallback.server_port),
            boot_retries: self.boot_retries(),
            retry_backoff: self
                .server
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(fallback.retry_backoff),
            reply_timeout: self
                .server
                .reply_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(fallback.reply_timeout),
            first_private_bus: self
                .allocation
                .first_private_bus
                .filter(|bus| *bus >= 0)
                .unwrap_or(fallback.first_private_bus),
            first_node_id: self
                .allocation
                .first_node_id
                .filter(|id| *id > 0)
                .unwrap_or(fallback.first_node_id),
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("trellis").join("config.toml"))
}

fn merge_defaults(base: &mut DefaultsConfig, user: DefaultsConfig) {
    if user.channel_count.is_some() {
        base.channel_count = user.channel_count;
    }
    if user.tempo.is_some() {
        base.tempo = user.tempo;
    }
    if user.time_signature.is_some() {
        base.time_signature = user.time_signature;
    }
}

fn merge_server(base: &mut ServerConfig, user: ServerConfig) {
    if user.host.is_some() {
        base.host = user.host;
    }
    if user.port.is_some() {
        base.port = user.port;
    }
    if user.boot_retries.is_some() {
        base.boot_retries = user.boot_retries;
    }
    if user.retry_backoff_ms.is_some() {
        base.retry_backoff_ms = user.retry_backoff_ms;
    }
    if user.reply_timeout_ms.is_some() {
        base.reply_timeout_ms = user.reply_timeout_ms;
    }
}

fn merge_allocation(base: &mut AllocationConfig, user: AllocationConfig) {
    if user.first_private_bus.is_some() {
        base.first_private_bus = user.first_private_bus;
    }
    if user.first_node_id.is_some() {
        base.first_node_id = user.first_node_id;
    }
}

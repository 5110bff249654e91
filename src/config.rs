//! Runtime settings.
//!
//! Layered with the `config` crate: serde defaults, then an optional TOML
//! file, then `SIGNAGE__SECTION__KEY` environment variables.

use crate::content::{ContentItem, Resolution};
use crate::profile::DeviceProfile;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub profile: ProfileSettings,
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    /// Played when neither the network nor a stored snapshot has content.
    #[serde(default)]
    pub fallback_playlist: Vec<ContentItem>,
}

/// Identity handed over by the pairing collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub subnetwork_id: String,
}

/// Initial capability facts; the server may refine them at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSettings {
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,
    #[serde(default = "default_formats")]
    pub supported_formats: BTreeSet<String>,
    #[serde(default)]
    pub max_bitrate: Option<u64>,
    #[serde(default = "default_preferred_format")]
    pub preferred_format: Option<String>,
    /// Ask the server for the stored profile at start-up.
    #[serde(default = "default_true")]
    pub fetch_remote: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackSettings {
    /// Wait before skipping an item that failed to render.
    #[serde(default = "default_skip_grace_ms")]
    pub skip_grace_ms: u64,
    /// How long before the swap the preloaded media starts playing.
    #[serde(default)]
    pub preroll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Durable storage directory. Memory only when unset or unusable.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_offline_probe_secs")]
    pub offline_probe_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Where the last-known-good playlist is persisted.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub realtime: bool,
}

fn default_server_url() -> String {
    "http://localhost:3000".into()
}

fn default_resolution() -> Resolution {
    Resolution::new(1920, 1080)
}

fn default_formats() -> BTreeSet<String> {
    [
        "video/mp4",
        "video/webm",
        "image/jpeg",
        "image/png",
        "image/webp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_preferred_format() -> Option<String> {
    Some("video/mp4".into())
}

fn default_true() -> bool {
    true
}

fn default_skip_grace_ms() -> u64 {
    5_000
}

fn default_max_concurrent() -> usize {
    3
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_cooldown_ms() -> u64 {
    1_000
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    3_600
}

fn default_max_entries() -> usize {
    500
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_offline_probe_secs() -> u64 {
    60
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            supported_formats: default_formats(),
            max_bitrate: None,
            preferred_format: default_preferred_format(),
            fetch_remote: true,
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            skip_grace_ms: default_skip_grace_ms(),
            preroll_ms: 0,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            max_concurrent: default_max_concurrent(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            cooldown_ms: default_cooldown_ms(),
            ttl_hours: default_ttl_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            offline_probe_secs: default_offline_probe_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            snapshot_path: None,
            realtime: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            device: DeviceSettings::default(),
            profile: ProfileSettings::default(),
            playback: PlaybackSettings::default(),
            cache: CacheSettings::default(),
            network: NetworkSettings::default(),
            fallback_playlist: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus `SIGNAGE__*` env vars.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("SIGNAGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Initial profile for `device_id` from the configured facts.
    pub fn device_profile(&self, device_id: &str) -> DeviceProfile {
        DeviceProfile {
            device_id: device_id.to_string(),
            supported_formats: self.profile.supported_formats.clone(),
            resolution: self.profile.resolution,
            max_bitrate: self.profile.max_bitrate,
            preferred_format: self.profile.preferred_format.clone(),
        }
    }
}

impl PlaybackSettings {
    pub fn skip_grace(&self) -> Duration {
        Duration::from_millis(self.skip_grace_ms)
    }

    pub fn preroll(&self) -> Duration {
        Duration::from_millis(self.preroll_ms)
    }
}

impl CacheSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3_600)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl NetworkSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn offline_probe(&self) -> Duration {
        Duration::from_secs(self.offline_probe_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

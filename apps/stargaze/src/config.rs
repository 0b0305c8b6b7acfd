use std::path::{Path, PathBuf};
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File, FileFormat};
use scope_session::{DispatchError, ZoomBounds};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "stargaze.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Http,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Webrtc,
    Loopback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Http,
    Loopback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_media_url")]
    pub media_url: String,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default = "default_control")]
    pub control: ControlKind,
    #[serde(default = "default_holder_id")]
    pub holder_id: String,
    #[serde(default = "default_holder_name")]
    pub holder_name: String,
    #[serde(default = "default_zoom_min")]
    pub zoom_min: f64,
    #[serde(default = "default_zoom_max")]
    pub zoom_max: f64,
    #[serde(default = "default_zoom_step")]
    pub zoom_step: f64,
    #[serde(default = "default_zoom_min")]
    pub initial_zoom: f64,
    #[serde(default = "default_move_step")]
    pub move_step: f64,
    #[serde(default = "default_cost_interval_secs")]
    pub cost_interval_secs: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            backend_url: default_backend_url(),
            media_url: default_media_url(),
            backend: default_backend(),
            transport: default_transport(),
            control: default_control(),
            holder_id: default_holder_id(),
            holder_name: default_holder_name(),
            zoom_min: default_zoom_min(),
            zoom_max: default_zoom_max(),
            zoom_step: default_zoom_step(),
            initial_zoom: default_zoom_min(),
            move_step: default_move_step(),
            cost_interval_secs: default_cost_interval_secs(),
            close_grace_ms: default_close_grace_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            ice_servers: default_ice_servers(),
            log_filter: None,
            log_path: None,
        }
    }
}

impl AppConfig {
    /// Reads `path` (or `stargaze.toml` when present) and overlays `STARGAZE_*`
    /// variables. An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (file, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        let builder = config::Config::builder()
            .add_source(File::from(file).format(FileFormat::Toml).required(required))
            .add_source(environment());
        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.backend_url =
            Self::normalize_opt(Some(self.backend_url)).unwrap_or_else(default_backend_url);
        self.media_url =
            Self::normalize_opt(Some(self.media_url)).unwrap_or_else(default_media_url);
        self.holder_id =
            Self::normalize_opt(Some(self.holder_id)).unwrap_or_else(default_holder_id);
        self.holder_name =
            Self::normalize_opt(Some(self.holder_name)).unwrap_or_else(default_holder_name);
        self.ice_servers = self
            .ice_servers
            .into_iter()
            .filter_map(|server| Self::normalize_opt(Some(server)))
            .collect();
        self.log_filter = Self::normalize_opt(self.log_filter.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn zoom_bounds(&self) -> Result<ZoomBounds, DispatchError> {
        ZoomBounds::new(self.zoom_min, self.zoom_max)
    }

    pub fn cost_interval(&self) -> Duration {
        Duration::from_secs(self.cost_interval_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn environment() -> Environment {
    Environment::with_prefix("STARGAZE")
        .list_separator(",")
        .with_list_parse_key("ice_servers")
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_media_url() -> String {
    "http://localhost:7880/whep".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::Http
}

fn default_transport() -> TransportKind {
    TransportKind::Webrtc
}

fn default_control() -> ControlKind {
    ControlKind::Http
}

fn default_holder_id() -> String {
    "1".to_string()
}

fn default_holder_name() -> String {
    "Maciek Zieja".to_string()
}

fn default_zoom_min() -> f64 {
    1.0
}

fn default_zoom_max() -> f64 {
    10.0
}

fn default_zoom_step() -> f64 {
    0.1
}

fn default_move_step() -> f64 {
    0.1
}

fn default_cost_interval_secs() -> u64 {
    60
}

fn default_close_grace_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

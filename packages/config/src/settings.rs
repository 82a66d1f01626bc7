// ABOUTME: Typed settings loaded from environment variables with defaults
// ABOUTME: Parses timeouts, ports and endpoints used by the environment backends and event client

use crate::constants::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Runtime settings shared by every Tether package
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub base_path: PathBuf,
    pub shell: String,
    pub shell_timeout: Duration,
    pub container_image: String,
    pub container_startup_timeout: Duration,
    pub container_workdir: String,
    pub preview_port: u16,
    pub docker_network: Option<String>,
    pub cloud_api_url: String,
    pub cloud_api_key: Option<String>,
    pub cloud_template: String,
    pub cloud_sandbox_timeout: Duration,
    pub agent_api_url: String,
    pub http_connect_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
            shell: DEFAULT_SHELL.to_string(),
            shell_timeout: Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS),
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            container_startup_timeout: Duration::from_secs(DEFAULT_CONTAINER_STARTUP_TIMEOUT_SECS),
            container_workdir: DEFAULT_CONTAINER_WORKDIR.to_string(),
            preview_port: DEFAULT_PREVIEW_PORT,
            docker_network: None,
            cloud_api_url: DEFAULT_CLOUD_API_URL.to_string(),
            cloud_api_key: None,
            cloud_template: DEFAULT_CLOUD_TEMPLATE.to_string(),
            cloud_sandbox_timeout: Duration::from_secs(DEFAULT_CLOUD_SANDBOX_TIMEOUT_SECS),
            agent_api_url: DEFAULT_AGENT_API_URL.to_string(),
            http_connect_timeout: Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl Settings {
    /// Load settings from a `.env` file (if present) and the process environment
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment overrides from {}", path.display());
        }
        Self::from_env()
    }

    /// Load settings from the process environment only
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        Ok(Self {
            base_path: get(TETHER_BASE_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.base_path),
            shell: get(TETHER_SHELL).unwrap_or(defaults.shell),
            shell_timeout: parse_secs(TETHER_SHELL_TIMEOUT_SECS, get(TETHER_SHELL_TIMEOUT_SECS))?
                .unwrap_or(defaults.shell_timeout),
            container_image: get(TETHER_CONTAINER_IMAGE).unwrap_or(defaults.container_image),
            container_startup_timeout: parse_secs(
                TETHER_CONTAINER_STARTUP_TIMEOUT_SECS,
                get(TETHER_CONTAINER_STARTUP_TIMEOUT_SECS),
            )?
            .unwrap_or(defaults.container_startup_timeout),
            container_workdir: get(TETHER_CONTAINER_WORKDIR).unwrap_or(defaults.container_workdir),
            preview_port: parse_value(TETHER_PREVIEW_PORT, get(TETHER_PREVIEW_PORT))?
                .unwrap_or(defaults.preview_port),
            docker_network: get(TETHER_DOCKER_NETWORK),
            cloud_api_url: get(TETHER_CLOUD_API_URL)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.cloud_api_url),
            cloud_api_key: get(TETHER_CLOUD_API_KEY),
            cloud_template: get(TETHER_CLOUD_TEMPLATE).unwrap_or(defaults.cloud_template),
            cloud_sandbox_timeout: parse_secs(
                TETHER_CLOUD_SANDBOX_TIMEOUT_SECS,
                get(TETHER_CLOUD_SANDBOX_TIMEOUT_SECS),
            )?
            .unwrap_or(defaults.cloud_sandbox_timeout),
            agent_api_url: get(TETHER_AGENT_API_URL)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.agent_api_url),
            http_connect_timeout: parse_secs(
                TETHER_HTTP_CONNECT_TIMEOUT_SECS,
                get(TETHER_HTTP_CONNECT_TIMEOUT_SECS),
            )?
            .unwrap_or(defaults.http_connect_timeout),
        })
    }
}

fn parse_value<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

fn parse_secs(key: &str, raw: Option<String>) -> Result<Option<Duration>> {
    let secs: Option<f64> = parse_value(key, raw.clone())?;
    match secs {
        Some(s) if s > 0.0 => Duration::try_from_secs_f64(s)
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.unwrap_or_default(),
            }),
        Some(_) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.unwrap_or_default(),
        }),
        None => Ok(None),
    }
}

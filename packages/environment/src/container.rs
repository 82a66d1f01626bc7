// ABOUTME: Container configuration and lifecycle state machine for the Docker backend
// ABOUTME: Port/volume/env settings plus transition functions that reject invalid lifecycle moves

use crate::error::{EnvironmentError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tether_config::Settings;

/// Label marking containers created by this crate
pub const MANAGED_LABEL: &str = "tether.environment.managed";

/// Container configuration owned by one Docker backend instance
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub image: String,
    pub name: Option<String>,
    /// Host port -> container port
    pub ports: BTreeMap<u16, u16>,
    /// Also publish `preview_port` on the same host port
    pub expose_common_ports: bool,
    pub preview_port: u16,
    pub volumes: Vec<VolumeMount>,
    pub env_vars: HashMap<String, String>,
    pub network: Option<String>,
    pub working_dir: String,
    pub command: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Start the container on first use instead of requiring `start_container`
    pub auto_start: bool,
    /// Remove the container when the environment is cleaned up
    pub auto_remove: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

impl VolumeMount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            readonly: false,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Docker bind string `host:container:mode`
    pub fn bind(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path,
            self.container_path,
            if self.readonly { "ro" } else { "rw" }
        )
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            image: settings.container_image.clone(),
            name: None,
            ports: BTreeMap::new(),
            expose_common_ports: false,
            preview_port: settings.preview_port,
            volumes: Vec::new(),
            env_vars: HashMap::new(),
            network: settings.docker_network.clone(),
            working_dir: settings.container_workdir.clone(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            labels: HashMap::new(),
            auto_start: true,
            auto_remove: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.insert(host_port, container_port);
        self
    }

    pub fn with_common_ports(mut self) -> Self {
        self.expose_common_ports = true;
        self
    }

    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    /// Port mappings actually published, including the preview port when enabled.
    ///
    /// An explicit mapping for the preview host port wins over the default.
    pub fn effective_ports(&self) -> BTreeMap<u16, u16> {
        let mut ports = self.ports.clone();
        if self.expose_common_ports {
            ports.entry(self.preview_port).or_insert(self.preview_port);
        }
        ports
    }

    /// Labels applied on create, always including the managed marker
    pub fn effective_labels(&self) -> HashMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(EnvironmentError::InvalidInput(
                "container image must not be empty".to_string(),
            ));
        }
        if !self.working_dir.starts_with('/') {
            return Err(EnvironmentError::InvalidInput(format!(
                "container working directory must be absolute: {}",
                self.working_dir
            )));
        }
        if let Some((host, _)) = self.effective_ports().iter().find(|(h, c)| **h == 0 || **c == 0) {
            return Err(EnvironmentError::InvalidInput(format!(
                "invalid port mapping for host port {}",
                host
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a managed container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Removed,
    Error,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

impl ContainerState {
    fn reject(self, action: &str) -> EnvironmentError {
        EnvironmentError::InvalidTransition(format!("cannot {} a {} container", action, self))
    }

    /// `start` is legal from every state that has no live container
    pub fn begin_start(self) -> Result<Self> {
        match self {
            Self::Uninitialized | Self::Stopped | Self::Removed | Self::Error => Ok(Self::Starting),
            _ => Err(self.reject("start")),
        }
    }

    pub fn finish_start(self) -> Result<Self> {
        match self {
            Self::Starting => Ok(Self::Running),
            _ => Err(self.reject("finish starting")),
        }
    }

    /// `None` when there is nothing to stop
    pub fn begin_stop(self) -> Result<Option<Self>> {
        match self {
            Self::Running | Self::Error => Ok(Some(Self::Stopping)),
            Self::Uninitialized | Self::Stopped | Self::Removed => Ok(None),
            _ => Err(self.reject("stop")),
        }
    }

    pub fn finish_stop(self, removed: bool) -> Result<Self> {
        match self {
            Self::Stopping => Ok(if removed { Self::Removed } else { Self::Stopped }),
            _ => Err(self.reject("finish stopping")),
        }
    }

    /// Any in-flight or live state may fail
    pub fn fail(self) -> Self {
        Self::Error
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// What happened to a port mapping added through `add_port_mapping`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortMappingChange {
    /// Stored and used by the next start
    Applied,
    /// Stored, but the running container keeps its old mappings until restarted
    PendingRestart,
}

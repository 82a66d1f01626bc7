// ABOUTME: Error types for environment operations
// ABOUTME: Covers path confinement, missing files/sessions, container startup and cloud lease failures

use std::io;
use thiserror::Error;

/// Reasons a container could not be brought to the running state
#[derive(Error, Debug)]
pub enum ContainerStartError {
    /// The requested host port is already bound; retry with a different mapping
    #[error("Host port {host_port} is already in use")]
    PortInUse { host_port: u16 },

    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("Container did not become ready within {seconds} seconds")]
    ReadyTimeout { seconds: u64 },

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

/// Main error type for environment operations
#[derive(Error, Debug)]
pub enum EnvironmentError {
    /// Missing file, directory, session or container
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path escapes the sandbox root
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation timed out after {seconds:.1} seconds")]
    Timeout { seconds: f64 },

    #[error("Container failed to start: {0}")]
    ContainerStart(#[from] ContainerStartError),

    /// Cloud sandbox lease expired or sandbox was torn down
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Remote API returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Results that return EnvironmentError
pub type Result<T> = std::result::Result<T, EnvironmentError>;

impl EnvironmentError {
    /// Stable machine-readable name used in response payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Timeout { .. } => "timeout",
            Self::ContainerStart(ContainerStartError::PortInUse { .. }) => "port_in_use",
            Self::ContainerStart(_) => "container_start",
            Self::SandboxUnavailable(_) => "sandbox_unavailable",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unsupported(_) => "unsupported",
            Self::Remote { .. } => "remote",
            Self::Docker(_) => "docker",
            Self::Http(_) => "http",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Terminal errors must not be retried against the same environment
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SandboxUnavailable(_))
    }

    /// True when a container start failed because a host port was taken
    pub fn is_port_conflict(&self) -> bool {
        matches!(
            self,
            Self::ContainerStart(ContainerStartError::PortInUse { .. })
        )
    }

    /// Map an I/O error on `path` onto the environment taxonomy
    pub(crate) fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_classified() {
        let err = EnvironmentError::from_io("a.txt", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, EnvironmentError::NotFound(ref p) if p == "a.txt"));
        assert_eq!(err.kind(), "not_found");

        let err = EnvironmentError::from_io("a.txt", io::Error::other("disk on fire"));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_port_conflict_is_distinguishable() {
        let err = EnvironmentError::from(ContainerStartError::PortInUse { host_port: 8080 });
        assert!(err.is_port_conflict());
        assert_eq!(err.kind(), "port_in_use");
        assert!(err.to_string().contains("8080"));

        let err = EnvironmentError::from(ContainerStartError::ReadyTimeout { seconds: 5 });
        assert!(!err.is_port_conflict());
    }

    #[test]
    fn test_only_sandbox_expiry_is_terminal() {
        assert!(EnvironmentError::SandboxUnavailable("expired".into()).is_terminal());
        assert!(!EnvironmentError::Timeout { seconds: 1.0 }.is_terminal());
    }
}

// ABOUTME: Environment trait and backend implementations for sandboxed file and shell operations
// ABOUTME: Defines the capability contract shared by the local, Docker and cloud backends

use crate::error::Result;
use crate::process::{ProcessOutput, ProcessRegistry, ProcessStatus};
use crate::types::{
    BackendKind, DeleteFileResult, DirectoryResult, ListFilesResult, ReadFileResult, ReadMode,
    ShellOutcome, ShellRequest, WriteFileResult, WriteMode,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tether_config::Settings;
use tracing::info;

pub mod cloud;
pub mod docker;
pub mod local;

pub use cloud::{CloudConfig, CloudEnvironment};
pub use docker::DockerEnvironment;
pub use local::LocalEnvironment;

/// Capability contract every execution environment supports.
///
/// Paths are resolved against the working directory and must stay inside
/// `base_path`; anything else fails with `PermissionDenied` before the
/// backend is touched.
#[async_trait]
pub trait Environment: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Root every operation is confined to
    fn base_path(&self) -> &Path;

    /// Registry tracking this environment's non-blocking sessions
    fn processes(&self) -> &ProcessRegistry;

    async fn working_directory(&self) -> PathBuf;

    async fn read_file(&self, path: &str, mode: ReadMode) -> Result<ReadFileResult>;

    /// Write (or append) `content`, creating parent directories as needed
    async fn write_file(&self, path: &str, content: &[u8], mode: WriteMode) -> Result<WriteFileResult>;

    async fn delete_file(&self, path: &str) -> Result<DeleteFileResult>;

    async fn list_files(
        &self,
        path: &str,
        recursive: bool,
        include_hidden: bool,
    ) -> Result<ListFilesResult>;

    async fn create_directory(&self, path: &str, parents: bool, exist_ok: bool) -> Result<DirectoryResult>;

    /// Change the working directory; validates confinement only
    async fn change_directory(&self, path: &str) -> Result<DirectoryResult>;

    /// Blocking requests run to completion or timeout; non-blocking requests
    /// register a session and return its id immediately
    async fn exec_shell(&self, request: ShellRequest) -> Result<ShellOutcome>;

    /// Release backend resources (sessions, containers, sandbox leases)
    async fn cleanup(&self) -> Result<()>;

    async fn get_process_status(&self, session_id: &str) -> Result<ProcessStatus> {
        self.processes().status(session_id).await
    }

    async fn get_process_output(&self, session_id: &str) -> Result<ProcessOutput> {
        self.processes().output(session_id).await
    }

    async fn terminate_process(&self, session_id: &str) -> Result<ProcessStatus> {
        self.processes().terminate(session_id).await
    }

    async fn write_to_process(&self, session_id: &str, text: &str, press_enter: bool) -> Result<()> {
        self.processes().write_stdin(session_id, text, press_enter).await
    }

    async fn list_processes(&self) -> Vec<ProcessStatus> {
        self.processes().list().await
    }
}

/// Build the backend selected by `kind` from shared settings.
///
/// Cloud sandboxes are provisioned here and must be released with `cleanup`.
pub async fn create_environment(kind: BackendKind, settings: &Settings) -> Result<Box<dyn Environment>> {
    info!("Creating {} environment", kind.as_str());
    Ok(match kind {
        BackendKind::Local => Box::new(LocalEnvironment::from_settings(settings).await?),
        BackendKind::Container => Box::new(DockerEnvironment::from_settings(settings)?),
        BackendKind::Cloud => {
            Box::new(CloudEnvironment::create(CloudConfig::from_settings(settings)).await?)
        }
    })
}

/// Hidden entries start with a dot
pub(crate) fn is_hidden(relative: &str) -> bool {
    relative
        .split('/')
        .any(|part| part.starts_with('.') && part != "." && part != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_detection_checks_every_component() {
        assert!(is_hidden(".env"));
        assert!(is_hidden("config/.secrets/key"));
        assert!(!is_hidden("src/main.rs"));
        assert!(!is_hidden("../up"));
    }
}

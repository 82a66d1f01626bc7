// ABOUTME: Local environment executing file and shell operations directly on the host
// ABOUTME: Confines every path to base_path and runs commands in killable process groups

use super::Environment;
use crate::error::{EnvironmentError, Result};
use crate::paths::{display, Workspace};
use crate::process::local::{
    exit_code, read_into, shell_command, signal_process_group, spawn_session, PipeBuffer,
};
use crate::process::ProcessRegistry;
use crate::types::{
    BackendKind, DeleteFileResult, DirectoryResult, EntryType, FileContent, FileEntry,
    ListFilesResult, ReadFileResult, ReadMode, ShellOutcome, ShellOutput, ShellRequest,
    WriteFileResult, WriteMode,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tether_config::Settings;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Time allowed for pipes to close after the shell itself has exited
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment backed by the host filesystem and process table
pub struct LocalEnvironment {
    workspace: Workspace,
    processes: ProcessRegistry,
    shell: String,
    default_timeout: Duration,
}

impl LocalEnvironment {
    /// Create an environment rooted at `base_path`, creating it if missing
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let settings = Settings::default();
        Self::with_options(base_path, settings.shell, settings.shell_timeout).await
    }

    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        Self::with_options(
            &settings.base_path,
            settings.shell.clone(),
            settings.shell_timeout,
        )
        .await
    }

    pub async fn with_options(
        base_path: impl AsRef<Path>,
        shell: String,
        default_timeout: Duration,
    ) -> Result<Self> {
        let base_path = base_path.as_ref();
        fs::create_dir_all(base_path)
            .await
            .map_err(|e| EnvironmentError::from_io(&display(base_path), e))?;
        let base = fs::canonicalize(base_path).await?;
        info!("Local environment rooted at {}", base.display());

        Ok(Self {
            workspace: Workspace::new(base),
            processes: ProcessRegistry::new(),
            shell,
            default_timeout,
        })
    }

    /// Resolve a path and make sure symlinks do not lead outside the root
    async fn resolve(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.workspace.resolve(path).await?;
        self.ensure_no_symlink_escape(path, &resolved).await?;
        Ok(resolved)
    }

    async fn ensure_no_symlink_escape(&self, requested: &str, resolved: &Path) -> Result<()> {
        // Canonicalize the deepest existing ancestor
        let mut probe = Some(resolved);
        while let Some(candidate) = probe {
            if let Ok(real) = fs::canonicalize(candidate).await {
                if real.starts_with(self.workspace.base()) {
                    return Ok(());
                }
                warn!(
                    "Symlink escape rejected: {} -> {}",
                    requested,
                    real.display()
                );
                return Err(EnvironmentError::PermissionDenied(format!(
                    "{} resolves outside the sandbox root",
                    requested
                )));
            }
            probe = candidate.parent();
        }
        Ok(())
    }

    async fn exec_blocking(&self, request: &ShellRequest, cwd: &Path) -> Result<ShellOutput> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let mut cmd = shell_command(&self.shell, &request.command, cwd, &request.env_vars);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            EnvironmentError::InvalidInput(format!("failed to spawn '{}': {}", request.command, e))
        })?;
        let pid = child.id();
        let stdout = PipeReader::spawn(child.stdout.take());
        let stderr = PipeReader::spawn(child.stderr.take());

        debug!("Running blocking command (timeout {:?}): {}", timeout, request.command);

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let (stdout, stderr) = collect_pipes(pid, stdout, stderr).await;
                Ok(ShellOutput::completed(
                    exit_code(status).unwrap_or(-1),
                    &stdout,
                    &stderr,
                    started.elapsed(),
                ))
            }
            Ok(Err(e)) => Err(EnvironmentError::Io(e)),
            Err(_) => {
                warn!(
                    "Command timed out after {:?}, killing process group: {}",
                    timeout, request.command
                );
                if let Some(pid) = pid {
                    signal_process_group(pid, true)?;
                }
                if let Err(e) = child.kill().await {
                    debug!("Kill after timeout reported: {}", e);
                }
                let (stdout, stderr) = collect_pipes(pid, stdout, stderr).await;
                Ok(ShellOutput::timed_out(&stdout, &stderr, started.elapsed()))
            }
        }
    }
}

struct PipeReader {
    task: tokio::task::JoinHandle<()>,
    buffer: PipeBuffer,
}

impl PipeReader {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let buffer = PipeBuffer::default();
        let task = tokio::spawn(read_into(reader, buffer.clone()));
        Self { task, buffer }
    }

    async fn take(self) -> Vec<u8> {
        self.task.abort();
        std::mem::take(&mut *self.buffer.lock().await)
    }
}

/// Wait for both pipes to close, keeping whatever was read if they never do
async fn collect_pipes(
    pid: Option<u32>,
    mut stdout: PipeReader,
    mut stderr: PipeReader,
) -> (Vec<u8>, Vec<u8>) {
    let drained = tokio::time::timeout(PIPE_DRAIN_TIMEOUT, async {
        let _ = tokio::join!(&mut stdout.task, &mut stderr.task);
    })
    .await
    .is_ok();

    if !drained {
        // A detached descendant still holds the pipe open
        warn!(
            "Output pipes still open {:?} after the shell exited, stopping leftover processes",
            PIPE_DRAIN_TIMEOUT
        );
        if let Some(pid) = pid {
            if let Err(e) = signal_process_group(pid, true) {
                debug!("Could not signal leftover process group {}: {}", pid, e);
            }
        }
    }
    tokio::join!(stdout.take(), stderr.take())
}

fn entry_type(file_type: std::fs::FileType) -> EntryType {
    if file_type.is_symlink() {
        EntryType::Symlink
    } else if file_type.is_dir() {
        EntryType::Directory
    } else {
        EntryType::File
    }
}

fn list_directory(root: &Path, recursive: bool, include_hidden: bool) -> Result<Vec<FileEntry>> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name();

    let mut entries = Vec::new();
    for entry in walker.into_iter().filter_entry(|e| {
        include_hidden || !e.file_name().to_string_lossy().starts_with('.')
    }) {
        let entry = entry.map_err(|e| EnvironmentError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        let entry_type = entry_type(entry.file_type());
        let size = match entry_type {
            EntryType::File => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        };
        entries.push(FileEntry {
            name: relative,
            entry_type,
            size,
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn base_path(&self) -> &Path {
        self.workspace.base()
    }

    fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    async fn working_directory(&self) -> PathBuf {
        self.workspace.working_directory().await
    }

    async fn read_file(&self, path: &str, mode: ReadMode) -> Result<ReadFileResult> {
        let resolved = self.resolve(path).await?;
        let metadata = fs::metadata(&resolved)
            .await
            .map_err(|e| EnvironmentError::from_io(path, e))?;
        if metadata.is_dir() {
            return Err(EnvironmentError::InvalidInput(format!(
                "{} is a directory",
                path
            )));
        }

        let bytes = fs::read(&resolved)
            .await
            .map_err(|e| EnvironmentError::from_io(path, e))?;
        let content = FileContent::decode(path, bytes, mode)?;
        debug!("Read {} bytes from {}", content.as_bytes().len(), resolved.display());
        Ok(ReadFileResult::new(display(&resolved), content))
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: WriteMode) -> Result<WriteFileResult> {
        let resolved = self.resolve(path).await?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| EnvironmentError::from_io(path, e))?;
        }

        match mode {
            WriteMode::Write | WriteMode::Binary => fs::write(&resolved, content)
                .await
                .map_err(|e| EnvironmentError::from_io(path, e))?,
            WriteMode::Append => {
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&resolved)
                    .await
                    .map_err(|e| EnvironmentError::from_io(path, e))?;
                file.write_all(content).await?;
                file.flush().await?;
            }
        }

        let size = fs::metadata(&resolved).await?.len();
        debug!("Wrote {} bytes to {} ({:?})", content.len(), resolved.display(), mode);
        Ok(WriteFileResult {
            path: display(&resolved),
            size,
        })
    }

    async fn delete_file(&self, path: &str) -> Result<DeleteFileResult> {
        let resolved = self.resolve(path).await?;
        if resolved == self.workspace.base() {
            return Err(EnvironmentError::PermissionDenied(
                "refusing to delete the sandbox root".to_string(),
            ));
        }

        let metadata = fs::symlink_metadata(&resolved)
            .await
            .map_err(|e| EnvironmentError::from_io(path, e))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&resolved).await
        } else {
            fs::remove_file(&resolved).await
        }
        .map_err(|e| EnvironmentError::from_io(path, e))?;

        info!("Deleted {}", resolved.display());
        Ok(DeleteFileResult {
            message: format!("Deleted {}", display(&resolved)),
        })
    }

    async fn list_files(
        &self,
        path: &str,
        recursive: bool,
        include_hidden: bool,
    ) -> Result<ListFilesResult> {
        let resolved = self.resolve(path).await?;
        let metadata = fs::metadata(&resolved)
            .await
            .map_err(|e| EnvironmentError::from_io(path, e))?;
        if !metadata.is_dir() {
            return Err(EnvironmentError::InvalidInput(format!(
                "{} is not a directory",
                path
            )));
        }

        let root = resolved.clone();
        let entries =
            tokio::task::spawn_blocking(move || list_directory(&root, recursive, include_hidden))
                .await
                .map_err(|e| EnvironmentError::Io(std::io::Error::other(e)))??;

        Ok(ListFilesResult {
            path: display(&resolved),
            entries,
        })
    }

    async fn create_directory(&self, path: &str, parents: bool, exist_ok: bool) -> Result<DirectoryResult> {
        let resolved = self.resolve(path).await?;
        if let Ok(metadata) = fs::metadata(&resolved).await {
            if !metadata.is_dir() {
                return Err(EnvironmentError::InvalidInput(format!(
                    "{} exists and is not a directory",
                    path
                )));
            }
            if !exist_ok {
                return Err(EnvironmentError::InvalidInput(format!(
                    "{} already exists",
                    path
                )));
            }
            return Ok(DirectoryResult {
                working_directory: display(&resolved),
            });
        }

        if parents {
            fs::create_dir_all(&resolved).await
        } else {
            fs::create_dir(&resolved).await
        }
        .map_err(|e| EnvironmentError::from_io(path, e))?;

        Ok(DirectoryResult {
            working_directory: display(&resolved),
        })
    }

    async fn change_directory(&self, path: &str) -> Result<DirectoryResult> {
        let resolved = self.workspace.change_directory(path).await?;
        debug!("Working directory is now {}", resolved.display());
        Ok(DirectoryResult {
            working_directory: display(&resolved),
        })
    }

    async fn exec_shell(&self, request: ShellRequest) -> Result<ShellOutcome> {
        let cwd = self.working_directory().await;
        if !fs::metadata(&cwd).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(EnvironmentError::NotFound(format!(
                "working directory {}",
                cwd.display()
            )));
        }

        if request.blocking {
            self.exec_blocking(&request, &cwd)
                .await
                .map(ShellOutcome::Completed)
        } else {
            let id = spawn_session(
                &self.processes,
                &self.shell,
                &request.command,
                &cwd,
                &request.env_vars,
            )
            .await?;
            Ok(ShellOutcome::started(id))
        }
    }

    async fn cleanup(&self) -> Result<()> {
        self.processes.shutdown_all().await;
        Ok(())
    }
}

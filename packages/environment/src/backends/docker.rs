// ABOUTME: Docker environment forwarding file and shell operations into a managed container
// ABOUTME: Uses bollard for container lifecycle, tar transfers and attached exec sessions

use super::{is_hidden, Environment};
use crate::container::{ContainerConfig, ContainerState, PortMappingChange};
use crate::error::{ContainerStartError, EnvironmentError, Result};
use crate::paths::{display, Workspace};
use crate::process::{OutputWriter, ProcessRegistry, SessionControl, StreamType};
use crate::types::{
    BackendKind, DeleteFileResult, DirectoryResult, EntryType, FileContent, FileEntry,
    ListFilesResult, ReadFileResult, ReadMode, ShellOutcome, ShellOutput, ShellRequest,
    WriteFileResult, WriteMode,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, PortBinding},
    Docker,
};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_config::Settings;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grace period handed to `docker stop`
const STOP_TIMEOUT_SECS: i64 = 5;

const PULL_TIMEOUT: Duration = Duration::from_secs(600);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Directory inside the container holding exec pid files
const PID_DIR: &str = "/tmp/.tether";

/// Exit codes used by the helper scripts below
const EXIT_MISSING: i64 = 44;
const EXIT_WRONG_TYPE: i64 = 45;
const EXIT_EXISTS: i64 = 46;
const EXIT_OUTSIDE: i64 = 47;

/// Records the wrapper pid so the whole tree can be signalled later
const EXEC_WRAPPER: &str = r#"mkdir -p "$(dirname "$1")" && echo $$ > "$1"
sh -c "$2"
rc=$?
rm -f "$1"
exit $rc"#;

/// Signals the recorded pid and every descendant, leaves first
const KILL_TREE: &str = r#"root="$(cat "$2" 2>/dev/null)" || exit 0
[ -n "$root" ] || exit 0
children() {
  for stat in /proc/[0-9]*/stat; do
    read -r pid _ _ ppid _ < "$stat" 2>/dev/null || continue
    [ "$ppid" = "$1" ] && echo "$pid"
  done
}
collect() {
  for child in $(children "$1"); do collect "$child"; done
  echo "$1"
}
kill -s "$1" $(collect "$root") 2>/dev/null
exit 0"#;

/// Fails with the canonical target when symlinks lead outside the root
const CONFINE_SCRIPT: &str = r#"base="${2%/}"
real="$(readlink -m -- "$1")" || exit 1
case "$real/" in
  "$base"/*) exit 0 ;;
esac
echo "$real"
exit 47"#;

const DELETE_SCRIPT: &str = r#"[ -e "$1" ] || [ -L "$1" ] || exit 44
rm -rf -- "$1""#;

const LIST_SCRIPT: &str = r#"[ -e "$1" ] || exit 44
[ -d "$1" ] || exit 45
if [ "$2" = 1 ]; then
  find "$1" -mindepth 1 -printf '%y\t%s\t%P\n'
else
  find "$1" -mindepth 1 -maxdepth 1 -printf '%y\t%s\t%P\n'
fi"#;

const MKDIR_SCRIPT: &str = r#"if [ -e "$1" ]; then
  [ -d "$1" ] || exit 45
  [ "$2" = 1 ] && exit 0
  exit 46
fi
if [ "$3" = 1 ]; then
  mkdir -p -- "$1"
else
  [ -d "$(dirname -- "$1")" ] || exit 44
  mkdir -- "$1"
fi"#;

type ExecOutput = Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>;
type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Captured result of a helper command run inside the container
#[derive(Debug)]
struct ExecResult {
    exit_code: i64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ExecResult {
    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    state: ContainerState,
    container_id: Option<String>,
    /// Port mappings changed since the container was created
    ports_dirty: bool,
}

/// Environment whose operations run inside one managed Docker container
pub struct DockerEnvironment {
    client: Docker,
    config: RwLock<ContainerConfig>,
    lifecycle: Mutex<Lifecycle>,
    workspace: Workspace,
    processes: ProcessRegistry,
    startup_timeout: Duration,
    poll_interval: Duration,
    default_timeout: Duration,
}

impl DockerEnvironment {
    /// Connect to the local Docker daemon using the default socket
    pub fn new(config: ContainerConfig) -> Result<Self> {
        let client = Docker::connect_with_defaults()?;
        Ok(Self::with_client(client, config))
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(ContainerConfig::from_settings(settings))?
            .with_startup_timeout(settings.container_startup_timeout)
            .with_default_timeout(settings.shell_timeout))
    }

    pub fn with_client(client: Docker, config: ContainerConfig) -> Self {
        let settings = Settings::default();
        Self {
            client,
            workspace: Workspace::new(PathBuf::from(&config.working_dir)),
            config: RwLock::new(config),
            lifecycle: Mutex::new(Lifecycle::default()),
            processes: ProcessRegistry::new(),
            startup_timeout: settings.container_startup_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_timeout: settings.shell_timeout,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Check whether the Docker daemon responds
    pub async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    pub async fn state(&self) -> ContainerState {
        self.lifecycle.lock().await.state
    }

    pub async fn container_id(&self) -> Option<String> {
        self.lifecycle.lock().await.container_id.clone()
    }

    pub async fn config(&self) -> ContainerConfig {
        self.config.read().await.clone()
    }

    /// Launch the container and wait until it reports running.
    ///
    /// Fails with `InvalidTransition` when the container is already starting
    /// or running.
    pub async fn start_container(&self) -> Result<String> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.start_locked(&mut lifecycle).await
    }

    /// Stop the container, optionally removing it.
    ///
    /// Stopping a container that is not running is a no-op.
    pub async fn stop_container(&self, remove: bool) -> Result<ContainerState> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle, remove).await
    }

    /// Stop and start again, recreating the container if port mappings changed
    pub async fn restart_container(&self) -> Result<String> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle, false).await?;
        self.start_locked(&mut lifecycle).await
    }

    /// Record a new host -> container port mapping.
    ///
    /// A running container keeps its current mappings; the caller must
    /// restart it for the new one to take effect.
    pub async fn add_port_mapping(&self, host_port: u16, container_port: u16) -> Result<PortMappingChange> {
        if host_port == 0 || container_port == 0 {
            return Err(EnvironmentError::InvalidInput(
                "port numbers must be non-zero".to_string(),
            ));
        }

        let mut lifecycle = self.lifecycle.lock().await;
        self.config.write().await.ports.insert(host_port, container_port);

        if lifecycle.container_id.is_some() {
            lifecycle.ports_dirty = true;
        }
        if lifecycle.state.is_running() {
            warn!(
                "Port mapping {}->{} takes effect after the container restarts",
                host_port, container_port
            );
            Ok(PortMappingChange::PendingRestart)
        } else {
            Ok(PortMappingChange::Applied)
        }
    }

    async fn start_locked(&self, lifecycle: &mut Lifecycle) -> Result<String> {
        let previous = lifecycle.state;
        let starting = previous.begin_start()?;
        let config = self.config.read().await.clone();
        config.validate()?;
        lifecycle.state = starting;

        let reuse = match lifecycle.container_id.take() {
            Some(id) if previous == ContainerState::Stopped && !lifecycle.ports_dirty => Some(id),
            Some(stale) => {
                self.remove_quietly(&stale).await;
                None
            }
            None => None,
        };

        match self.launch(&config, reuse).await {
            Ok(id) => {
                lifecycle.container_id = Some(id.clone());
                lifecycle.ports_dirty = false;
                lifecycle.state = lifecycle.state.finish_start()?;
                info!("Container {} is running ({})", short_id(&id), config.image);
                Ok(id)
            }
            Err(e) => {
                warn!("Container failed to start: {}", e);
                lifecycle.state = lifecycle.state.fail();
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle, remove: bool) -> Result<ContainerState> {
        let Some(stopping) = lifecycle.state.begin_stop()? else {
            if remove && lifecycle.state == ContainerState::Stopped {
                if let Some(id) = lifecycle.container_id.take() {
                    self.remove(&id).await?;
                    lifecycle.state = ContainerState::Removed;
                }
            }
            debug!("Container already {}; stop is a no-op", lifecycle.state);
            return Ok(lifecycle.state);
        };

        self.processes.shutdown_all().await;
        lifecycle.state = stopping;

        if let Some(id) = lifecycle.container_id.clone() {
            info!("Stopping container {} (remove: {})", short_id(&id), remove);
            let result = async {
                self.stop(&id).await?;
                if remove {
                    self.remove(&id).await?;
                }
                Ok::<_, EnvironmentError>(())
            }
            .await;

            if let Err(e) = result {
                lifecycle.state = lifecycle.state.fail();
                return Err(e);
            }
            if remove {
                lifecycle.container_id = None;
            }
        }

        lifecycle.state = lifecycle.state.finish_stop(remove)?;
        Ok(lifecycle.state)
    }

    /// Id of the running container, starting it first when `auto_start` is set
    async fn running_container(&self) -> Result<String> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state.is_running() {
            if let Some(id) = &lifecycle.container_id {
                return Ok(id.clone());
            }
        }

        if self.config.read().await.auto_start {
            return self.start_locked(&mut lifecycle).await;
        }
        Err(EnvironmentError::InvalidTransition(format!(
            "container is {}; call start_container first",
            lifecycle.state
        )))
    }

    async fn launch(&self, config: &ContainerConfig, reuse: Option<String>) -> Result<String> {
        let ports = config.effective_ports();
        for host_port in ports.keys() {
            ensure_host_port_free(*host_port).await?;
        }

        let id = match reuse {
            Some(id) => {
                debug!("Restarting existing container {}", short_id(&id));
                id
            }
            None => {
                self.ensure_image(&config.image).await?;
                self.create(config).await?
            }
        };

        if let Err(e) = self
            .client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_quietly(&id).await;
            return Err(start_error(e, &ports).into());
        }

        if let Err(e) = self.prepare(&id, config).await {
            warn!("Removing container {} after failed startup", short_id(&id));
            self.remove_quietly(&id).await;
            return Err(e);
        }
        Ok(id)
    }

    /// Wait for a started container and create its working directory
    async fn prepare(&self, id: &str, config: &ContainerConfig) -> Result<()> {
        self.wait_until_ready(id).await?;

        let mkdir = self
            .exec_collect(
                id,
                vec!["mkdir".into(), "-p".into(), config.working_dir.clone()],
                None,
            )
            .await?;
        if mkdir.exit_code != 0 {
            return Err(ContainerStartError::Runtime(format!(
                "failed to create {}: {}",
                config.working_dir,
                mkdir.stderr_text()
            ))
            .into());
        }
        Ok(())
    }

    fn to_bollard_config(config: &ContainerConfig) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (host_port, container_port) in config.effective_ports() {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                });
        }

        let host_config = HostConfig {
            binds: Some(config.volumes.iter().map(|v| v.bind()).collect()),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: config.network.clone(),
            // Reap orphans left behind by killed exec trees
            init: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            cmd: Some(config.command.clone()),
            env: Some(
                config
                    .env_vars
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            working_dir: Some(config.working_dir.clone()),
            labels: Some(config.effective_labels()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn create(&self, config: &ContainerConfig) -> Result<String> {
        let options = config.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let created = self
            .client
            .create_container(options, Self::to_bollard_config(config))
            .await
            .map_err(|e| ContainerStartError::Runtime(e.to_string()))?;
        for warning in &created.warnings {
            warn!("Docker create warning: {}", warning);
        }
        debug!("Created container {}", short_id(&created.id));
        Ok(created.id)
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(ContainerStartError::ImageUnavailable(e.to_string()).into()),
        }

        info!("Pulling image {} (timeout: {:?})", image, PULL_TIMEOUT);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(PULL_TIMEOUT, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let info = result
                    .map_err(|e| ContainerStartError::ImageUnavailable(format!("{}: {}", image, e)))?;
                if let Some(error) = info.error {
                    return Err(ContainerStartError::ImageUnavailable(format!("{}: {}", image, error)));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(Ok(())) => {
                info!("Pulled image {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ContainerStartError::ImageUnavailable(format!(
                "timed out pulling {} after {:?}",
                image, PULL_TIMEOUT
            ))
            .into()),
        }
    }

    async fn wait_until_ready(&self, id: &str) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            let inspect = self
                .client
                .inspect_container(id, None)
                .await
                .map_err(|e| ContainerStartError::Runtime(e.to_string()))?;

            if let Some(state) = inspect.state {
                if state.running == Some(true) {
                    return Ok(());
                }
                let status = state
                    .status
                    .as_ref()
                    .map(|s| s.as_ref())
                    .unwrap_or("unknown");
                if status == "exited" || status == "dead" {
                    return Err(ContainerStartError::Runtime(format!(
                        "container {} during startup (exit code {})",
                        status,
                        state.exit_code.unwrap_or(-1)
                    ))
                    .into());
                }
            }

            if Instant::now() >= deadline {
                return Err(ContainerStartError::ReadyTimeout {
                    seconds: self.startup_timeout.as_secs(),
                }
                .into());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions { t: STOP_TIMEOUT_SECS };
        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped or gone
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => {
                debug!("Removed container {}", short_id(id));
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_quietly(&self, id: &str) {
        if let Err(e) = self.remove(id).await {
            warn!("Failed to remove container {}: {}", short_id(id), e);
        }
    }

    async fn create_exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        working_dir: Option<String>,
        env: &HashMap<String, String>,
        attach_stdin: bool,
    ) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            env: Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            working_dir,
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        Ok(self.client.create_exec(id, options).await?.id)
    }

    async fn start_attached(&self, exec_id: &str) -> Result<(ExecOutput, ExecInput)> {
        match self.client.start_exec(exec_id, None).await? {
            StartExecResults::Attached { output, input } => Ok((output, input)),
            StartExecResults::Detached => Err(EnvironmentError::Io(std::io::Error::other(
                "exec was detached unexpectedly",
            ))),
        }
    }

    /// Run a helper command to completion and capture its output
    async fn exec_collect(&self, id: &str, cmd: Vec<String>, working_dir: Option<String>) -> Result<ExecResult> {
        let exec_id = self
            .create_exec(id, cmd, working_dir, &HashMap::new(), false)
            .await?;
        let (mut output, _) = self.start_attached(&exec_id).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        drain_into(&mut output, &mut stdout, &mut stderr).await?;

        Ok(ExecResult {
            exit_code: exec_exit_code(&self.client, &exec_id).await.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn run_script(&self, id: &str, script: &str, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "tether".to_string(),
        ];
        cmd.extend(args.iter().map(|a| a.to_string()));
        self.exec_collect(id, cmd, None).await
    }

    /// Reject paths whose symlinks resolve outside the root inside the container
    async fn ensure_no_symlink_escape(&self, id: &str, resolved: &Path, requested: &str) -> Result<String> {
        let target = display(resolved);
        let base = display(self.workspace.base());
        let result = self.run_script(id, CONFINE_SCRIPT, &[&target, &base]).await?;
        match result.exit_code {
            0 => Ok(target),
            EXIT_OUTSIDE => {
                let real = String::from_utf8_lossy(&result.stdout).trim().to_string();
                warn!("Symlink escape rejected: {} -> {}", requested, real);
                Err(EnvironmentError::PermissionDenied(format!(
                    "{} resolves outside the sandbox root",
                    requested
                )))
            }
            _ => Err(script_error(requested, &result)),
        }
    }

    async fn exec_blocking(&self, id: &str, request: &ShellRequest, cwd: String) -> Result<ShellOutput> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let pid_file = pid_file();
        let started = Instant::now();

        let exec_id = self
            .create_exec(
                id,
                wrapper_command(&pid_file, &request.command),
                Some(cwd),
                &request.env_vars,
                false,
            )
            .await?;
        let (mut output, _) = self.start_attached(&exec_id).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let drained =
            tokio::time::timeout(timeout, drain_into(&mut output, &mut stdout, &mut stderr)).await;

        match drained {
            Ok(result) => {
                result?;
                let code = exec_exit_code(&self.client, &exec_id).await.unwrap_or(-1);
                Ok(ShellOutput::completed(code, &stdout, &stderr, started.elapsed()))
            }
            Err(_) => {
                warn!(
                    "Container command timed out after {:?}, killing process tree: {}",
                    timeout, request.command
                );
                let control = DockerExecControl::new(self.client.clone(), id, pid_file, None);
                Ok(timed_out_after_kill(&control, &stdout, &stderr, started).await)
            }
        }
    }

    async fn exec_background(&self, id: &str, request: &ShellRequest, cwd: String) -> Result<ShellOutcome> {
        let pid_file = pid_file();
        let exec_id = self
            .create_exec(
                id,
                wrapper_command(&pid_file, &request.command),
                Some(cwd.clone()),
                &request.env_vars,
                true,
            )
            .await?;
        let (output, input) = self.start_attached(&exec_id).await?;

        let control = Arc::new(DockerExecControl::new(
            self.client.clone(),
            id,
            pid_file,
            Some(input),
        ));
        let client = self.client.clone();
        let session_id = self
            .processes
            .register(request.command.clone(), cwd, control, move |writer| {
                pump_exec(client, exec_id, output, writer)
            })
            .await;
        Ok(ShellOutcome::started(session_id))
    }

    async fn download(&self, id: &str, path: &str, requested: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.client.download_from_container(id, Some(options));
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(EnvironmentError::NotFound(requested.to_string())),
                Err(e) => return Err(e.into()),
            }
        }

        match read_archived_file(&data)? {
            ArchivedEntry::File(bytes) => Ok(bytes),
            ArchivedEntry::Directory => Err(EnvironmentError::InvalidInput(format!(
                "{} is a directory",
                requested
            ))),
            ArchivedEntry::Other => {
                // Symlinks already checked against the root; special files stream through cat
                let result = self
                    .exec_collect(id, vec!["cat".into(), "--".into(), path.to_string()], None)
                    .await?;
                if result.exit_code != 0 {
                    return Err(script_error(requested, &result));
                }
                Ok(result.stdout)
            }
        }
    }

    async fn upload(&self, id: &str, resolved: &Path, content: &[u8]) -> Result<()> {
        let parent = resolved.parent().map(display).unwrap_or_else(|| "/".to_string());
        let name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                EnvironmentError::InvalidInput(format!("{} has no file name", display(resolved)))
            })?;

        let mkdir = self
            .exec_collect(id, vec!["mkdir".into(), "-p".into(), parent.clone()], None)
            .await?;
        if mkdir.exit_code != 0 {
            return Err(script_error(&parent, &mkdir));
        }

        let archive = single_file_archive(&name, content)?;
        let options = UploadToContainerOptions {
            path: parent,
            ..Default::default()
        };
        self.client
            .upload_to_container(id, Some(options), archive.into())
            .await?;
        Ok(())
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn pid_file() -> String {
    format!("{}/{}.pid", PID_DIR, Uuid::new_v4().simple())
}

fn wrapper_command(pid_file: &str, command: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        EXEC_WRAPPER.to_string(),
        "tether-exec".to_string(),
        pid_file.to_string(),
        command.to_string(),
    ]
}

/// Fail fast when a host port is already bound by something else
async fn ensure_host_port_free(port: u16) -> Result<()> {
    match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!("Host port {} is already in use", port);
            Err(ContainerStartError::PortInUse { host_port: port }.into())
        }
        Err(e) => {
            // Privileged ports and similar: let the daemon decide
            debug!("Skipping host port pre-flight for {}: {}", port, e);
            Ok(())
        }
    }
}

/// Translate a failed start into the startup taxonomy, spotting port conflicts
fn start_error(
    err: bollard::errors::Error,
    ports: &std::collections::BTreeMap<u16, u16>,
) -> ContainerStartError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        let host_port = ports
            .keys()
            .copied()
            .find(|port| message.contains(&format!(":{}", port)))
            .or_else(|| ports.keys().next().copied())
            .unwrap_or(0);
        return ContainerStartError::PortInUse { host_port };
    }
    ContainerStartError::Runtime(message)
}

fn script_error(path: &str, result: &ExecResult) -> EnvironmentError {
    let stderr = result.stderr_text();
    match result.exit_code {
        EXIT_MISSING => EnvironmentError::NotFound(path.to_string()),
        EXIT_WRONG_TYPE => EnvironmentError::InvalidInput(format!("{} has the wrong file type", path)),
        EXIT_EXISTS => EnvironmentError::InvalidInput(format!("{} already exists", path)),
        _ if stderr.contains("Permission denied") => {
            EnvironmentError::PermissionDenied(format!("{}: {}", path, stderr))
        }
        code => EnvironmentError::Io(std::io::Error::other(format!(
            "{} failed with exit code {}: {}",
            path, code, stderr
        ))),
    }
}

async fn drain_into(output: &mut ExecOutput, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) -> Result<()> {
    while let Some(message) = output.next().await {
        match message? {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                stdout.extend_from_slice(&message)
            }
            LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
            LogOutput::StdIn { .. } => {}
        }
    }
    Ok(())
}

/// Exit code of a finished exec; the daemon may lag briefly behind the stream closing
async fn exec_exit_code(client: &Docker, exec_id: &str) -> Option<i64> {
    for _ in 0..20 {
        match client.inspect_exec(exec_id).await {
            Ok(inspect) if inspect.running != Some(true) => return inspect.exit_code,
            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(e) => {
                warn!("Failed to inspect exec {}: {}", exec_id, e);
                return None;
            }
        }
    }
    None
}

async fn pump_exec(client: Docker, exec_id: String, mut output: ExecOutput, writer: OutputWriter) {
    while let Some(message) = output.next().await {
        match message {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                writer.append(StreamType::Stdout, &message)
            }
            Ok(LogOutput::StdErr { message }) => writer.append(StreamType::Stderr, &message),
            Ok(LogOutput::StdIn { .. }) => {}
            Err(e) => {
                warn!("Exec stream for {} failed: {}", exec_id, e);
                writer.fail(e.to_string());
                return;
            }
        }
    }
    writer.finish(exec_exit_code(&client, &exec_id).await);
}

/// Session control for a command running inside the container
/// Kill a timed-out exec tree; the timeout result stands even if the kill fails
async fn timed_out_after_kill(
    control: &dyn SessionControl,
    stdout: &[u8],
    stderr: &[u8],
    started: Instant,
) -> ShellOutput {
    if let Err(e) = control.signal(true).await {
        warn!("Failed to kill timed-out command tree: {}", e);
    }
    ShellOutput::timed_out(stdout, stderr, started.elapsed())
}

struct DockerExecControl {
    client: Docker,
    container_id: String,
    pid_file: String,
    stdin: Mutex<Option<ExecInput>>,
}

impl DockerExecControl {
    fn new(client: Docker, container_id: &str, pid_file: String, stdin: Option<ExecInput>) -> Self {
        Self {
            client,
            container_id: container_id.to_string(),
            pid_file,
            stdin: Mutex::new(stdin),
        }
    }
}

#[async_trait]
impl SessionControl for DockerExecControl {
    async fn signal(&self, force: bool) -> Result<()> {
        let signal = if force { "KILL" } else { "TERM" };
        let options = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                KILL_TREE.to_string(),
                "tether-kill".to_string(),
                signal.to_string(),
                self.pid_file.clone(),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.client.create_exec(&self.container_id, options).await?;
        if let StartExecResults::Attached { mut output, .. } =
            self.client.start_exec(&exec.id, None).await?
        {
            while output.next().await.is_some() {}
        }
        debug!("Sent SIG{} to process tree in {}", signal, self.pid_file);
        Ok(())
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| EnvironmentError::InvalidInput("stdin is closed".to_string()))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }
}

enum ArchivedEntry {
    File(Vec<u8>),
    Directory,
    Other,
}

/// First entry of a tar stream returned by `download_from_container`
fn read_archived_file(data: &[u8]) -> Result<ArchivedEntry> {
    let mut archive = tar::Archive::new(data);
    let mut entries = archive.entries()?;
    let Some(entry) = entries.next() else {
        return Err(EnvironmentError::Io(std::io::Error::other(
            "container returned an empty archive",
        )));
    };
    let mut entry = entry?;

    let kind = entry.header().entry_type();
    if kind.is_dir() {
        return Ok(ArchivedEntry::Directory);
    }
    if !kind.is_file() {
        return Ok(ArchivedEntry::Other);
    }
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(ArchivedEntry::File(bytes))
}

fn single_file_archive(name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    builder.append_data(&mut header, name, content)?;
    builder.into_inner()
}

fn parse_listing(stdout: &[u8], include_hidden: bool) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let kind = fields.next()?;
            let size = fields.next()?.parse::<u64>().unwrap_or(0);
            let name = fields.next()?.to_string();
            let entry_type = match kind {
                "d" => EntryType::Directory,
                "l" => EntryType::Symlink,
                _ => EntryType::File,
            };
            Some(FileEntry {
                size: if entry_type == EntryType::File { size } else { 0 },
                name,
                entry_type,
            })
        })
        .filter(|entry| include_hidden || !is_hidden(&entry.name))
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
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
        let resolved = self.workspace.resolve(path).await?;
        let id = self.running_container().await?;
        let target = self.ensure_no_symlink_escape(&id, &resolved, path).await?;
        let bytes = self.download(&id, &target, path).await?;
        let content = FileContent::decode(path, bytes, mode)?;
        Ok(ReadFileResult::new(display(&resolved), content))
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: WriteMode) -> Result<WriteFileResult> {
        let resolved = self.workspace.resolve(path).await?;
        let id = self.running_container().await?;
        let target = self.ensure_no_symlink_escape(&id, &resolved, path).await?;

        let data = match mode {
            WriteMode::Write | WriteMode::Binary => content.to_vec(),
            WriteMode::Append => {
                let mut existing = match self.download(&id, &target, path).await {
                    Ok(bytes) => bytes,
                    Err(EnvironmentError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(e),
                };
                existing.extend_from_slice(content);
                existing
            }
        };

        self.upload(&id, &resolved, &data).await?;
        debug!("Wrote {} bytes to container path {}", data.len(), resolved.display());
        Ok(WriteFileResult {
            path: display(&resolved),
            size: data.len() as u64,
        })
    }

    async fn delete_file(&self, path: &str) -> Result<DeleteFileResult> {
        let resolved = self.workspace.resolve(path).await?;
        if resolved == self.workspace.base() {
            return Err(EnvironmentError::PermissionDenied(
                "refusing to delete the sandbox root".to_string(),
            ));
        }
        let id = self.running_container().await?;
        let target = self.ensure_no_symlink_escape(&id, &resolved, path).await?;
        let result = self.run_script(&id, DELETE_SCRIPT, &[&target]).await?;
        if result.exit_code != 0 {
            return Err(script_error(path, &result));
        }
        Ok(DeleteFileResult {
            message: format!("Deleted {}", target),
        })
    }

    async fn list_files(
        &self,
        path: &str,
        recursive: bool,
        include_hidden: bool,
    ) -> Result<ListFilesResult> {
        let resolved = self.workspace.resolve(path).await?;
        let id = self.running_container().await?;
        let target = self.ensure_no_symlink_escape(&id, &resolved, path).await?;
        let result = self
            .run_script(&id, LIST_SCRIPT, &[&target, if recursive { "1" } else { "0" }])
            .await?;
        if result.exit_code != 0 {
            return Err(script_error(path, &result));
        }
        Ok(ListFilesResult {
            path: target,
            entries: parse_listing(&result.stdout, include_hidden),
        })
    }

    async fn create_directory(&self, path: &str, parents: bool, exist_ok: bool) -> Result<DirectoryResult> {
        let resolved = self.workspace.resolve(path).await?;
        let id = self.running_container().await?;
        let target = self.ensure_no_symlink_escape(&id, &resolved, path).await?;
        let flag = |b: bool| if b { "1" } else { "0" };
        let result = self
            .run_script(&id, MKDIR_SCRIPT, &[&target, flag(exist_ok), flag(parents)])
            .await?;
        if result.exit_code != 0 {
            return Err(script_error(path, &result));
        }
        Ok(DirectoryResult {
            working_directory: target,
        })
    }

    async fn change_directory(&self, path: &str) -> Result<DirectoryResult> {
        let resolved = self.workspace.change_directory(path).await?;
        Ok(DirectoryResult {
            working_directory: display(&resolved),
        })
    }

    async fn exec_shell(&self, request: ShellRequest) -> Result<ShellOutcome> {
        let id = self.running_container().await?;
        let cwd = display(&self.working_directory().await);
        if request.blocking {
            self.exec_blocking(&id, &request, cwd)
                .await
                .map(ShellOutcome::Completed)
        } else {
            self.exec_background(&id, &request, cwd).await
        }
    }

    async fn cleanup(&self) -> Result<()> {
        self.processes.shutdown_all().await;
        let remove = self.config.read().await.auto_remove;
        self.stop_container(remove).await?;
        Ok(())
    }
}

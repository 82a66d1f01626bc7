// ABOUTME: Cloud environment backed by a remote sandbox service reached over HTTP
// ABOUTME: Tracks the sandbox lease locally and treats expiry or teardown as terminal

use super::{is_hidden, Environment};
use crate::error::{EnvironmentError, Result};
use crate::paths::{display, Workspace};
use crate::process::{
    OutputWriter, ProcessOutput, ProcessRegistry, ProcessStatus, SessionControl, StreamType,
};
use crate::types::{
    BackendKind, DeleteFileResult, DirectoryResult, FileContent, FileEntry, ListFilesResult,
    ReadFileResult, ReadMode, ShellOutcome, ShellOutput, ShellRequest, WriteFileResult, WriteMode,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_config::Settings;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Consecutive polling failures tolerated before a session is marked failed
const MAX_POLL_FAILURES: u32 = 5;

/// Connection settings for the sandbox service
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub template: String,
    /// Lease requested when the sandbox is created
    pub timeout: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    /// Root directory inside the sandbox
    pub base_path: String,
    pub shell_timeout: Duration,
    pub env_vars: HashMap<String, String>,
}

impl CloudConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::from_settings(&Settings::default())
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_url: settings.cloud_api_url.clone(),
            api_key: settings.cloud_api_key.clone(),
            template: settings.cloud_template.clone(),
            timeout: settings.cloud_sandbox_timeout,
            request_timeout: Duration::from_secs(30),
            connect_timeout: settings.http_connect_timeout,
            poll_interval: Duration::from_millis(500),
            base_path: "/home/user".to_string(),
            shell_timeout: settings.shell_timeout,
            env_vars: HashMap::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    template: &'a str,
    timeout_secs: u64,
    env_vars: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    sandbox_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct LeaseInfo {
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WrittenFile {
    size: u64,
}

#[derive(Debug, Deserialize)]
struct Listing {
    entries: Vec<FileEntry>,
}

#[derive(Debug, Serialize)]
struct DirectoryRequest<'a> {
    path: &'a str,
    parents: bool,
    exist_ok: bool,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    command: &'a str,
    cwd: &'a str,
    env: &'a HashMap<String, String>,
    timeout_secs: u64,
    background: bool,
}

#[derive(Debug, Deserialize)]
struct CommandResult {
    exit_code: Option<i64>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    timed_out: bool,
}

#[derive(Debug, Deserialize)]
struct CommandStarted {
    pid: u64,
}

#[derive(Debug, Deserialize)]
struct CommandStatus {
    running: bool,
    exit_code: Option<i64>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// HTTP client bound to one sandbox, shared with session readers
struct SandboxApi {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    sandbox_id: String,
    expires_at: RwLock<DateTime<Utc>>,
    closed: AtomicBool,
}

impl SandboxApi {
    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/sandboxes/{}{}",
            self.api_url.trim_end_matches('/'),
            self.sandbox_id,
            suffix
        )
    }

    fn request(&self, method: Method, suffix: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(suffix));
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    async fn ensure_alive(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EnvironmentError::SandboxUnavailable(format!(
                "sandbox {} has been terminated",
                self.sandbox_id
            )));
        }
        let expires_at = *self.expires_at.read().await;
        if Utc::now() >= expires_at {
            self.closed.store(true, Ordering::SeqCst);
            warn!("Sandbox {} lease expired at {}", self.sandbox_id, expires_at);
            return Err(EnvironmentError::SandboxUnavailable(format!(
                "sandbox {} lease expired at {}",
                self.sandbox_id,
                expires_at.to_rfc3339()
            )));
        }
        Ok(())
    }

    /// Send a request, mapping service failures onto the environment taxonomy
    async fn send(&self, builder: RequestBuilder, subject: &str) -> Result<Response> {
        self.ensure_alive().await?;
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let api_error: ApiError = serde_json::from_str(&body).unwrap_or_default();
        let message = if api_error.error.is_empty() {
            body
        } else {
            api_error.error
        };

        match status {
            StatusCode::GONE => Err(self.mark_unavailable(&message)),
            StatusCode::NOT_FOUND if api_error.code.as_deref() == Some("sandbox_not_found") => {
                Err(self.mark_unavailable(&message))
            }
            StatusCode::NOT_FOUND => Err(EnvironmentError::NotFound(subject.to_string())),
            StatusCode::FORBIDDEN => Err(EnvironmentError::PermissionDenied(format!(
                "{}: {}",
                subject, message
            ))),
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT => Err(EnvironmentError::InvalidInput(
                format!("{}: {}", subject, message),
            )),
            status => Err(EnvironmentError::Remote {
                status: status.as_u16(),
                message,
            }),
        }
    }

    fn mark_unavailable(&self, message: &str) -> EnvironmentError {
        self.closed.store(true, Ordering::SeqCst);
        warn!("Sandbox {} is no longer available: {}", self.sandbox_id, message);
        EnvironmentError::SandboxUnavailable(format!("sandbox {}: {}", self.sandbox_id, message))
    }

    async fn command_status(&self, pid: u64) -> Result<CommandStatus> {
        let response = self
            .send(
                self.request(Method::GET, &format!("/commands/{}", pid)),
                &format!("command {}", pid),
            )
            .await?;
        Ok(response.json().await?)
    }
}

/// Environment backed by a remote, leased sandbox
pub struct CloudEnvironment {
    api: Arc<SandboxApi>,
    config: CloudConfig,
    workspace: Workspace,
    processes: ProcessRegistry,
}

impl CloudEnvironment {
    /// Provision a fresh sandbox and bind to it
    pub async fn create(config: CloudConfig) -> Result<Self> {
        let client = build_client(&config)?;
        let url = format!("{}/sandboxes", config.api_url.trim_end_matches('/'));
        let mut builder = client.post(&url).json(&CreateSandboxRequest {
            template: &config.template,
            timeout_secs: config.timeout.as_secs(),
            env_vars: &config.env_vars,
        });
        if let Some(key) = &config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            return Err(EnvironmentError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        let info: SandboxInfo = response.json().await?;
        info!(
            "Created cloud sandbox {} (template {}, expires {})",
            info.sandbox_id, config.template, info.expires_at
        );
        Ok(Self::bind(client, config, info.sandbox_id, info.expires_at))
    }

    /// Attach to an existing sandbox whose lease ends at `expires_at`
    pub fn connect(config: CloudConfig, sandbox_id: impl Into<String>, expires_at: DateTime<Utc>) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self::bind(client, config, sandbox_id.into(), expires_at))
    }

    fn bind(client: Client, config: CloudConfig, sandbox_id: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            api: Arc::new(SandboxApi {
                client,
                api_url: config.api_url.clone(),
                api_key: config.api_key.clone(),
                sandbox_id,
                expires_at: RwLock::new(expires_at),
                closed: AtomicBool::new(false),
            }),
            workspace: Workspace::new(PathBuf::from(&config.base_path)),
            processes: ProcessRegistry::new(),
            config,
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.api.sandbox_id
    }

    pub async fn expires_at(&self) -> DateTime<Utc> {
        *self.api.expires_at.read().await
    }

    /// False once the lease expired or the sandbox was torn down
    pub async fn is_alive(&self) -> bool {
        self.api.ensure_alive().await.is_ok()
    }

    /// Ask the service to extend the lease by `timeout` from now
    pub async fn extend_lease(&self, timeout: Duration) -> Result<DateTime<Utc>> {
        let response = self
            .api
            .send(
                self.api
                    .request(Method::POST, "/timeout")
                    .json(&serde_json::json!({ "timeout_secs": timeout.as_secs() })),
                "sandbox lease",
            )
            .await?;
        let lease: LeaseInfo = response.json().await?;
        *self.api.expires_at.write().await = lease.expires_at;
        debug!("Sandbox {} lease extended to {}", self.api.sandbox_id, lease.expires_at);
        Ok(lease.expires_at)
    }

    async fn exec_blocking(&self, request: &ShellRequest, cwd: &str) -> Result<ShellOutput> {
        let timeout = request.timeout.unwrap_or(self.config.shell_timeout);
        let started = Instant::now();
        let body = CommandRequest {
            command: &request.command,
            cwd,
            env: &request.env_vars,
            timeout_secs: timeout.as_secs().max(1),
            background: false,
        };

        // The service enforces the command timeout; the HTTP timeout only bounds a stalled connection
        let builder = self
            .api
            .request(Method::POST, "/commands")
            .timeout(timeout + self.config.request_timeout)
            .json(&body);

        let response = match self.api.send(builder, &request.command).await {
            Ok(response) => response,
            Err(EnvironmentError::Http(e)) if e.is_timeout() => {
                warn!("Cloud command timed out after {:?}: {}", timeout, request.command);
                return Ok(ShellOutput::timed_out(b"", b"", started.elapsed()));
            }
            Err(e) => return Err(e),
        };

        let result: CommandResult = response.json().await?;
        if result.timed_out {
            return Ok(ShellOutput::timed_out(
                result.stdout.as_bytes(),
                result.stderr.as_bytes(),
                started.elapsed(),
            ));
        }
        Ok(ShellOutput::completed(
            result.exit_code.unwrap_or(-1),
            result.stdout.as_bytes(),
            result.stderr.as_bytes(),
            started.elapsed(),
        ))
    }

    async fn exec_background(&self, request: &ShellRequest, cwd: String) -> Result<ShellOutcome> {
        let body = CommandRequest {
            command: &request.command,
            cwd: &cwd,
            env: &request.env_vars,
            timeout_secs: 0,
            background: true,
        };
        let response = self
            .api
            .send(
                self.api.request(Method::POST, "/commands").json(&body),
                &request.command,
            )
            .await?;
        let started: CommandStarted = response.json().await?;

        let control = Arc::new(CloudCommandControl {
            api: self.api.clone(),
            pid: started.pid,
        });
        let api = self.api.clone();
        let interval = self.config.poll_interval;
        let session_id = self
            .processes
            .register(request.command.clone(), cwd, control, move |writer| {
                poll_command(api, started.pid, interval, writer)
            })
            .await;
        Ok(ShellOutcome::started(session_id))
    }
}

fn build_client(config: &CloudConfig) -> Result<Client> {
    Ok(Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .build()?)
}

/// Append whatever the service reports beyond what was already captured
fn append_new(writer: &OutputWriter, stream: StreamType, full: &str) {
    let seen = writer.captured_len(stream);
    if let Some(fresh) = full.as_bytes().get(seen..) {
        writer.append(stream, fresh);
    }
}

async fn poll_command(api: Arc<SandboxApi>, pid: u64, interval: Duration, writer: OutputWriter) {
    let mut failures = 0;
    loop {
        match api.command_status(pid).await {
            Ok(status) => {
                failures = 0;
                append_new(&writer, StreamType::Stdout, &status.stdout);
                append_new(&writer, StreamType::Stderr, &status.stderr);
                if !status.running {
                    writer.finish(status.exit_code);
                    return;
                }
            }
            Err(e) if e.is_terminal() => {
                writer.fail(e.to_string());
                return;
            }
            Err(e) => {
                failures += 1;
                warn!("Polling command {} failed ({}/{}): {}", pid, failures, MAX_POLL_FAILURES, e);
                if failures >= MAX_POLL_FAILURES {
                    writer.fail(e.to_string());
                    return;
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

struct CloudCommandControl {
    api: Arc<SandboxApi>,
    pid: u64,
}

#[async_trait]
impl SessionControl for CloudCommandControl {
    async fn signal(&self, force: bool) -> Result<()> {
        let signal = if force { "SIGKILL" } else { "SIGTERM" };
        self.api
            .send(
                self.api
                    .request(Method::POST, &format!("/commands/{}/kill", self.pid))
                    .json(&serde_json::json!({ "signal": signal })),
                &format!("command {}", self.pid),
            )
            .await?;
        Ok(())
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        self.api
            .send(
                self.api
                    .request(Method::POST, &format!("/commands/{}/stdin", self.pid))
                    .json(&serde_json::json!({ "data": String::from_utf8_lossy(data) })),
                &format!("command {}", self.pid),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Environment for CloudEnvironment {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
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
        let resolved = display(&self.workspace.resolve(path).await?);
        let response = self
            .api
            .send(
                self.api
                    .request(Method::GET, "/files")
                    .query(&[("path", resolved.as_str())]),
                path,
            )
            .await?;
        let bytes = response.bytes().await?.to_vec();
        let content = FileContent::decode(path, bytes, mode)?;
        Ok(ReadFileResult::new(resolved, content))
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: WriteMode) -> Result<WriteFileResult> {
        let resolved = display(&self.workspace.resolve(path).await?);
        let append = if mode == WriteMode::Append { "true" } else { "false" };
        let response = self
            .api
            .send(
                self.api
                    .request(Method::PUT, "/files")
                    .query(&[("path", resolved.as_str()), ("append", append)])
                    .body(content.to_vec()),
                path,
            )
            .await?;
        let written: WrittenFile = response.json().await?;
        Ok(WriteFileResult {
            path: resolved,
            size: written.size,
        })
    }

    async fn delete_file(&self, path: &str) -> Result<DeleteFileResult> {
        let resolved = self.workspace.resolve(path).await?;
        if resolved == self.workspace.base() {
            return Err(EnvironmentError::PermissionDenied(
                "refusing to delete the sandbox root".to_string(),
            ));
        }
        let resolved = display(&resolved);
        self.api
            .send(
                self.api
                    .request(Method::DELETE, "/files")
                    .query(&[("path", resolved.as_str())]),
                path,
            )
            .await?;
        Ok(DeleteFileResult {
            message: format!("Deleted {}", resolved),
        })
    }

    async fn list_files(
        &self,
        path: &str,
        recursive: bool,
        include_hidden: bool,
    ) -> Result<ListFilesResult> {
        let resolved = display(&self.workspace.resolve(path).await?);
        let response = self
            .api
            .send(
                self.api.request(Method::GET, "/files/list").query(&[
                    ("path", resolved.as_str()),
                    ("recursive", if recursive { "true" } else { "false" }),
                ]),
                path,
            )
            .await?;
        let listing: Listing = response.json().await?;

        let mut entries: Vec<FileEntry> = listing
            .entries
            .into_iter()
            .filter(|entry| include_hidden || !is_hidden(&entry.name))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ListFilesResult {
            path: resolved,
            entries,
        })
    }

    async fn create_directory(&self, path: &str, parents: bool, exist_ok: bool) -> Result<DirectoryResult> {
        let resolved = display(&self.workspace.resolve(path).await?);
        self.api
            .send(
                self.api
                    .request(Method::POST, "/directories")
                    .json(&DirectoryRequest {
                        path: &resolved,
                        parents,
                        exist_ok,
                    }),
                path,
            )
            .await?;
        Ok(DirectoryResult {
            working_directory: resolved,
        })
    }

    async fn change_directory(&self, path: &str) -> Result<DirectoryResult> {
        self.api.ensure_alive().await?;
        let resolved = self.workspace.change_directory(path).await?;
        Ok(DirectoryResult {
            working_directory: display(&resolved),
        })
    }

    async fn exec_shell(&self, request: ShellRequest) -> Result<ShellOutcome> {
        let cwd = display(&self.working_directory().await);
        if request.blocking {
            self.exec_blocking(&request, &cwd)
                .await
                .map(ShellOutcome::Completed)
        } else {
            self.exec_background(&request, cwd).await
        }
    }

    async fn get_process_status(&self, session_id: &str) -> Result<ProcessStatus> {
        self.api.ensure_alive().await?;
        self.processes.status(session_id).await
    }

    async fn get_process_output(&self, session_id: &str) -> Result<ProcessOutput> {
        self.api.ensure_alive().await?;
        self.processes.output(session_id).await
    }

    async fn terminate_process(&self, session_id: &str) -> Result<ProcessStatus> {
        self.api.ensure_alive().await?;
        self.processes.terminate(session_id).await
    }

    async fn write_to_process(&self, session_id: &str, text: &str, press_enter: bool) -> Result<()> {
        self.api.ensure_alive().await?;
        self.processes.write_stdin(session_id, text, press_enter).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.processes.shutdown_all().await;
        if self.api.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        match self
            .api
            .send(self.api.request(Method::DELETE, ""), "sandbox")
            .await
        {
            Ok(_) => info!("Terminated cloud sandbox {}", self.api.sandbox_id),
            Err(EnvironmentError::SandboxUnavailable(_)) | Err(EnvironmentError::NotFound(_)) => {
                debug!("Sandbox {} was already gone", self.api.sandbox_id)
            }
            Err(e) => return Err(e),
        }
        self.api.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryType;

    fn writer() -> (OutputWriter, tokio::sync::watch::Receiver<crate::process::SessionBuffers>) {
        let (tx, rx) = tokio::sync::watch::channel(Default::default());
        (OutputWriter::new(tx), rx)
    }

    #[test]
    fn test_append_new_only_adds_unseen_suffix() {
        let (writer, rx) = writer();
        append_new(&writer, StreamType::Stdout, "one\n");
        append_new(&writer, StreamType::Stdout, "one\ntwo\n");
        append_new(&writer, StreamType::Stdout, "one\ntwo\n");
        assert_eq!(rx.borrow().stdout, b"one\ntwo\n");
    }

    #[test]
    fn test_listing_deserializes_entry_types() {
        let listing: Listing = serde_json::from_str(
            r#"{"entries":[{"name":"src","type":"directory","size":0},{"name":"a.txt","type":"file","size":3}]}"#,
        )
        .unwrap();
        assert_eq!(listing.entries[0].entry_type, EntryType::Directory);
        assert_eq!(listing.entries[1].size, 3);
    }

    #[tokio::test]
    async fn test_expired_lease_is_terminal_without_network() {
        let config = CloudConfig::new("http://127.0.0.1:9");
        let env = CloudEnvironment::connect(config, "sbx_1", Utc::now() - chrono::Duration::seconds(1))
            .unwrap();

        let err = env.read_file("a.txt", ReadMode::Text).await.unwrap_err();
        assert_eq!(err.kind(), "sandbox_unavailable");
        assert!(err.is_terminal());
        assert!(!env.is_alive().await);
    }
}

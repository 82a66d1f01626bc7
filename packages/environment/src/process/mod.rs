// ABOUTME: Process session types shared by every backend's non-blocking execution
// ABOUTME: Session ids, states, status/output snapshots and the single-writer output channel

pub mod local;
pub mod registry;

pub use registry::{ProcessRegistry, ProcessSession};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use uuid::Uuid;

/// Opaque, caller-visible handle to a process session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh id; uuids are never reused within a process lifetime
    pub(crate) fn generate() -> Self {
        Self(format!("proc_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Running,
    Exited,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Buffered output and lifecycle of one session.
///
/// Append-only while running; frozen once the state is terminal.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionBuffers {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub state: SessionState,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Exclusive write handle to a session's buffers, owned by its reader task
pub struct OutputWriter {
    tx: watch::Sender<SessionBuffers>,
}

impl OutputWriter {
    pub(crate) fn new(tx: watch::Sender<SessionBuffers>) -> Self {
        Self { tx }
    }

    pub fn append(&self, stream: StreamType, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.tx.send_if_modified(|buffers| {
            if buffers.state.is_terminal() {
                return false;
            }
            match stream {
                StreamType::Stdout => buffers.stdout.extend_from_slice(data),
                StreamType::Stderr => buffers.stderr.extend_from_slice(data),
            }
            true
        });
    }

    /// Mark the session exited and freeze its buffers
    pub fn finish(&self, exit_code: Option<i64>) {
        self.tx.send_if_modified(|buffers| {
            if buffers.state.is_terminal() {
                return false;
            }
            buffers.state = SessionState::Exited;
            buffers.exit_code = exit_code;
            buffers.finished_at = Some(Utc::now());
            true
        });
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_if_modified(|buffers| {
            if buffers.state.is_terminal() {
                return false;
            }
            buffers.state = SessionState::Error;
            buffers.error = Some(message);
            buffers.finished_at = Some(Utc::now());
            true
        });
    }

    /// Bytes already captured for `stream`
    pub fn captured_len(&self, stream: StreamType) -> usize {
        let buffers = self.tx.borrow();
        match stream {
            StreamType::Stdout => buffers.stdout.len(),
            StreamType::Stderr => buffers.stderr.len(),
        }
    }
}

impl Drop for OutputWriter {
    fn drop(&mut self) {
        // A reader that stops without reporting leaves an exited session with no code
        self.finish(None);
    }
}

/// Backend-specific control over the process behind a session
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Ask the process (and its descendants) to stop; `force` kills unconditionally
    async fn signal(&self, force: bool) -> Result<()>;

    async fn write_stdin(&self, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub session_id: SessionId,
    pub command: String,
    pub cwd: String,
    pub state: SessionState,
    pub running: bool,
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    pub session_id: SessionId,
    pub stdout: String,
    pub stderr: String,
    pub state: SessionState,
    pub running: bool,
    pub exit_code: Option<i64>,
}

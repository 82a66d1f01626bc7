// ABOUTME: Request and result types shared by every environment backend
// ABOUTME: File read/write/list results, shell requests and blocking/non-blocking shell outcomes

use crate::process::SessionId;
use base64::Engine;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Container,
    Cloud,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
            Self::Cloud => "cloud",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    #[default]
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Write,
    Append,
    Binary,
}

/// File content as returned by `read_file`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    /// Decode raw bytes according to the requested read mode
    pub(crate) fn decode(path: &str, bytes: Vec<u8>, mode: ReadMode) -> crate::Result<Self> {
        match mode {
            ReadMode::Binary => Ok(Self::Binary(bytes)),
            ReadMode::Text => String::from_utf8(bytes).map(Self::Text).map_err(|_| {
                crate::EnvironmentError::InvalidInput(format!(
                    "{} is not valid UTF-8 text; read it in binary mode",
                    path
                ))
            }),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn encoding(&self) -> &'static str {
        match self {
            Self::Text(_) => "utf-8",
            Self::Binary(_) => "base64",
        }
    }
}

impl Serialize for FileContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text(text) => serializer.serialize_str(text),
            Self::Binary(bytes) => serializer
                .serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadFileResult {
    pub path: String,
    pub content: FileContent,
    pub encoding: &'static str,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text_length: Option<usize>,
}

impl ReadFileResult {
    pub(crate) fn new(path: String, content: FileContent) -> Self {
        let size_bytes = content.as_bytes().len() as u64;
        Self {
            path,
            encoding: content.encoding(),
            content,
            size_bytes,
            extracted_text_length: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFileResult {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteFileResult {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the listed directory
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListFilesResult {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryResult {
    pub working_directory: String,
}

/// Request to execute a shell command in an environment
#[derive(Debug, Clone, PartialEq)]
pub struct ShellRequest {
    pub command: String,
    /// `None` falls back to the environment's default timeout (blocking only)
    pub timeout: Option<Duration>,
    pub blocking: bool,
    pub env_vars: HashMap<String, String>,
}

impl ShellRequest {
    /// Run to completion or timeout
    pub fn blocking(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            blocking: true,
            env_vars: HashMap::new(),
        }
    }

    /// Start and register a process session, returning immediately
    pub fn background(command: impl Into<String>) -> Self {
        Self {
            blocking: false,
            ..Self::blocking(command)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_secs(self, secs: f64) -> Self {
        // Too large for a Duration means "effectively never"
        self.with_timeout(Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellStatus {
    Success,
    Timeout,
    Error,
}

/// Result of a blocking shell command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellOutput {
    pub status: ShellStatus,
    pub return_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock seconds
    pub execution_time: f64,
}

impl ShellOutput {
    pub(crate) fn completed(
        return_code: i64,
        stdout: &[u8],
        stderr: &[u8],
        elapsed: Duration,
    ) -> Self {
        Self {
            status: if return_code == 0 {
                ShellStatus::Success
            } else {
                ShellStatus::Error
            },
            return_code: Some(return_code),
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            execution_time: elapsed.as_secs_f64(),
        }
    }

    pub(crate) fn timed_out(stdout: &[u8], stderr: &[u8], elapsed: Duration) -> Self {
        Self {
            status: ShellStatus::Timeout,
            return_code: None,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            execution_time: elapsed.as_secs_f64(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ShellStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStarted {
    pub status: ShellStatus,
    pub session_id: SessionId,
}

/// Outcome of `exec_shell`: a finished command or a started session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ShellOutcome {
    Completed(ShellOutput),
    Started(SessionStarted),
}

impl ShellOutcome {
    pub(crate) fn started(session_id: SessionId) -> Self {
        Self::Started(SessionStarted {
            status: ShellStatus::Success,
            session_id,
        })
    }

    pub fn status(&self) -> ShellStatus {
        match self {
            Self::Completed(output) => output.status,
            Self::Started(started) => started.status,
        }
    }

    pub fn output(&self) -> Option<&ShellOutput> {
        match self {
            Self::Completed(output) => Some(output),
            Self::Started(_) => None,
        }
    }

    pub fn into_output(self) -> Option<ShellOutput> {
        match self {
            Self::Completed(output) => Some(output),
            Self::Started(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Completed(_) => None,
            Self::Started(started) => Some(&started.session_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binary_content_serializes_as_base64() {
        let result = ReadFileResult::new("img.bin".into(), FileContent::Binary(vec![0, 159, 146]));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["content"], json!("AJ+S"));
        assert_eq!(value["encoding"], json!("base64"));
        assert_eq!(value["size_bytes"], json!(3));
        assert!(value.get("extracted_text_length").is_none());
    }

    #[test]
    fn test_text_mode_rejects_invalid_utf8() {
        let err = FileContent::decode("x.bin", vec![0xff, 0xfe], ReadMode::Text).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        let ok = FileContent::decode("x.txt", b"hi".to_vec(), ReadMode::Text).unwrap();
        assert_eq!(ok.as_text(), Some("hi"));
    }

    #[test]
    fn test_shell_outcome_shapes() {
        let output = ShellOutput::completed(0, b"hi\n", b"", Duration::from_millis(12));
        let value = serde_json::to_value(ShellOutcome::Completed(output)).unwrap();
        assert_eq!(value["status"], json!("success"));
        assert_eq!(value["return_code"], json!(0));
        assert_eq!(value["stdout"], json!("hi\n"));

        let started = ShellOutcome::started(SessionId::from("proc_abc"));
        let value = serde_json::to_value(&started).unwrap();
        assert_eq!(value, json!({"status": "success", "session_id": "proc_abc"}));
    }

    #[test]
    fn test_nonzero_exit_is_error_status() {
        let output = ShellOutput::completed(2, b"", b"boom", Duration::ZERO);
        assert_eq!(output.status, ShellStatus::Error);
        assert_eq!(output.return_code, Some(2));
        assert!(!output.is_success());
    }
}

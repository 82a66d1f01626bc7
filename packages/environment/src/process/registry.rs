// ABOUTME: Registry of non-blocking process sessions for one environment instance
// ABOUTME: Tracks buffered output, status polling, stdin writes and safe termination per session

use super::{
    OutputWriter, ProcessOutput, ProcessStatus, SessionBuffers, SessionControl, SessionId,
};
use crate::error::{EnvironmentError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time a process gets to exit after a polite termination request
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Time the reader gets to flush remaining output after a forced kill
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One non-blocking command and the reader task draining its output
pub struct ProcessSession {
    id: SessionId,
    command: String,
    cwd: String,
    started_at: DateTime<Utc>,
    output: watch::Receiver<SessionBuffers>,
    control: Arc<dyn SessionControl>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSession {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        !self.output.borrow().state.is_terminal()
    }

    pub fn status(&self) -> ProcessStatus {
        let buffers = self.output.borrow();
        ProcessStatus {
            session_id: self.id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            state: buffers.state,
            running: !buffers.state.is_terminal(),
            exit_code: buffers.exit_code,
            error: buffers.error.clone(),
            started_at: self.started_at,
            finished_at: buffers.finished_at,
        }
    }

    /// Snapshot of everything captured so far; never consumes output
    pub fn output(&self) -> ProcessOutput {
        let buffers = self.output.borrow();
        ProcessOutput {
            session_id: self.id.clone(),
            stdout: String::from_utf8_lossy(&buffers.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&buffers.stderr).into_owned(),
            state: buffers.state,
            running: !buffers.state.is_terminal(),
            exit_code: buffers.exit_code,
        }
    }

    async fn wait_terminal(&self, timeout: Duration) -> bool {
        let mut rx = self.output.clone();
        // Bound so the watch guard is dropped before `rx`
        let finished = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|b| b.state.is_terminal())).await,
            Ok(Ok(_))
        );
        finished
    }

    /// Wait for the reader task to return, aborting it if it lingers
    async fn join_reader(&self, timeout: Duration) {
        let handle = self.reader.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!("Reader for session {} did not stop; aborting", self.id);
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

/// Thread-safe mapping of session id to session, shared within one environment
pub struct ProcessRegistry {
    sessions: RwLock<HashMap<String, Arc<ProcessSession>>>,
    terminate_grace: Duration,
    drain_timeout: Duration,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_TERMINATE_GRACE, DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_timeouts(terminate_grace: Duration, drain_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            terminate_grace,
            drain_timeout,
        }
    }

    /// Register a session and spawn its reader.
    ///
    /// The reader receives the only `OutputWriter` for the session; pollers
    /// only ever see snapshots.
    pub async fn register<F, Fut>(
        &self,
        command: String,
        cwd: String,
        control: Arc<dyn SessionControl>,
        reader: F,
    ) -> SessionId
    where
        F: FnOnce(OutputWriter) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SessionId::generate();
        let (tx, rx) = watch::channel(SessionBuffers::default());

        let mut sessions = self.sessions.write().await;
        let handle = tokio::spawn(reader(OutputWriter::new(tx)));

        info!("Started process session {}: {}", id, command);
        sessions.insert(
            id.to_string(),
            Arc::new(ProcessSession {
                id: id.clone(),
                command,
                cwd,
                started_at: Utc::now(),
                output: rx,
                control,
                reader: Mutex::new(Some(handle)),
            }),
        );

        id
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<ProcessSession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| EnvironmentError::NotFound(format!("process session {}", session_id)))
    }

    pub async fn status(&self, session_id: &str) -> Result<ProcessStatus> {
        Ok(self.get(session_id).await?.status())
    }

    pub async fn output(&self, session_id: &str) -> Result<ProcessOutput> {
        Ok(self.get(session_id).await?.output())
    }

    pub async fn list(&self) -> Vec<ProcessStatus> {
        let mut statuses: Vec<ProcessStatus> = self
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.status())
            .collect();
        statuses.sort_by_key(|status| status.started_at);
        statuses
    }

    /// Write to a running session's stdin, optionally followed by a newline
    pub async fn write_stdin(&self, session_id: &str, text: &str, press_enter: bool) -> Result<()> {
        let session = self.get(session_id).await?;
        if !session.is_running() {
            return Err(EnvironmentError::InvalidInput(format!(
                "process session {} is not running",
                session_id
            )));
        }

        let mut data = text.as_bytes().to_vec();
        if press_enter {
            data.push(b'\n');
        }
        debug!("Writing {} bytes to session {}", data.len(), session_id);
        session.control.write_stdin(&data).await
    }

    /// Terminate a session; a no-op for sessions that already finished.
    ///
    /// Escalates from a polite signal to a kill, and only returns once the
    /// reader has flushed the final output and frozen the buffers.
    pub async fn terminate(&self, session_id: &str) -> Result<ProcessStatus> {
        let session = self.get(session_id).await?;

        if !session.is_running() {
            debug!("Session {} already finished; terminate is a no-op", session_id);
            session.join_reader(self.drain_timeout).await;
            return Ok(session.status());
        }

        info!("Terminating process session {}", session_id);
        if let Err(e) = session.control.signal(false).await {
            warn!("Failed to signal session {}: {}", session_id, e);
        }

        if !session.wait_terminal(self.terminate_grace).await {
            warn!(
                "Session {} did not exit within {:?}; killing",
                session_id, self.terminate_grace
            );
            if let Err(e) = session.control.signal(true).await {
                warn!("Failed to kill session {}: {}", session_id, e);
            }

            if !session.wait_terminal(self.drain_timeout).await {
                warn!("Session {} reader did not drain; aborting", session_id);
                if let Some(handle) = session.reader.lock().await.take() {
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        session.join_reader(self.drain_timeout).await;
        Ok(session.status())
    }

    /// Wait until a session finishes or `timeout` elapses
    pub async fn wait_for_exit(&self, session_id: &str, timeout: Duration) -> Result<ProcessStatus> {
        let session = self.get(session_id).await?;
        if session.wait_terminal(timeout).await {
            Ok(session.status())
        } else {
            Err(EnvironmentError::Timeout {
                seconds: timeout.as_secs_f64(),
            })
        }
    }

    /// Remove a finished session from the registry
    pub async fn reap(&self, session_id: &str) -> Result<ProcessStatus> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| EnvironmentError::NotFound(format!("process session {}", session_id)))?;

        if session.is_running() {
            return Err(EnvironmentError::InvalidInput(format!(
                "process session {} is still running; terminate it first",
                session_id
            )));
        }

        sessions.remove(session_id);
        debug!("Reaped process session {}", session_id);
        Ok(session.status())
    }

    /// Terminate every running session and drop them all
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in &ids {
            if let Err(e) = self.terminate(id).await {
                warn!("Failed to terminate session {} during shutdown: {}", id, e);
            }
        }
        self.sessions.write().await.clear();
        if !ids.is_empty() {
            info!("Shut down {} process session(s)", ids.len());
        }
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{SessionState, StreamType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Notify};

    /// Control that forwards stdin to the fake reader and counts signals
    struct FakeControl {
        stop: Arc<Notify>,
        stdin: mpsc::UnboundedSender<Vec<u8>>,
        signals: AtomicUsize,
        ignore_polite: bool,
    }

    #[async_trait]
    impl SessionControl for FakeControl {
        async fn signal(&self, force: bool) -> Result<()> {
            self.signals.fetch_add(1, Ordering::SeqCst);
            if force || !self.ignore_polite {
                self.stop.notify_one();
            }
            Ok(())
        }

        async fn write_stdin(&self, data: &[u8]) -> Result<()> {
            self.stdin
                .send(data.to_vec())
                .map_err(|_| EnvironmentError::InvalidInput("closed".into()))
        }
    }

    async fn spawn_echo(registry: &ProcessRegistry, ignore_polite: bool) -> (SessionId, Arc<FakeControl>) {
        let stop = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let control = Arc::new(FakeControl {
            stop: stop.clone(),
            stdin: tx,
            signals: AtomicUsize::new(0),
            ignore_polite,
        });

        let id = registry
            .register("cat".into(), "/w".into(), control.clone(), move |writer| async move {
                loop {
                    tokio::select! {
                        Some(data) = rx.recv() => writer.append(StreamType::Stdout, &data),
                        _ = stop.notified() => {
                            writer.append(StreamType::Stderr, b"terminated\n");
                            writer.finish(Some(-15));
                            break;
                        }
                    }
                }
            })
            .await;
        (id, control)
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let registry = ProcessRegistry::new();
        let err = registry.status("proc_missing").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(registry.terminate("proc_missing").await.is_err());
    }

    #[tokio::test]
    async fn test_stdin_round_trips_through_reader() {
        let registry = ProcessRegistry::new();
        let (id, _) = spawn_echo(&registry, false).await;

        registry.write_stdin(id.as_str(), "hello", true).await.unwrap();
        for _ in 0..50 {
            if registry.output(id.as_str()).await.unwrap().stdout == "hello\n" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let output = registry.output(id.as_str()).await.unwrap();
        assert_eq!(output.stdout, "hello\n");
        assert!(output.running);

        // Reads are idempotent
        assert_eq!(registry.output(id.as_str()).await.unwrap(), output);
    }

    #[tokio::test]
    async fn test_terminate_waits_for_final_output_and_is_idempotent() {
        let registry = ProcessRegistry::new();
        let (id, control) = spawn_echo(&registry, false).await;

        let status = registry.terminate(id.as_str()).await.unwrap();
        assert_eq!(status.state, SessionState::Exited);
        assert_eq!(status.exit_code, Some(-15));
        assert_eq!(registry.output(id.as_str()).await.unwrap().stderr, "terminated\n");

        let again = registry.terminate(id.as_str()).await.unwrap();
        assert_eq!(again, status);
        assert_eq!(control.signals.load(Ordering::SeqCst), 1);

        let err = registry.write_stdin(id.as_str(), "late", false).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_force() {
        let registry =
            ProcessRegistry::with_timeouts(Duration::from_millis(50), Duration::from_secs(1));
        let (id, control) = spawn_echo(&registry, true).await;

        let status = registry.terminate(id.as_str()).await.unwrap();
        assert!(!status.running);
        assert_eq!(control.signals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reap_requires_finished_session() {
        let registry = ProcessRegistry::new();
        let (id, _) = spawn_echo(&registry, false).await;

        assert_eq!(registry.reap(id.as_str()).await.unwrap_err().kind(), "invalid_input");
        registry.terminate(id.as_str()).await.unwrap();
        registry.reap(id.as_str()).await.unwrap();
        assert!(registry.status(id.as_str()).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_exit_times_out() {
        let registry = ProcessRegistry::new();
        let (id, _) = spawn_echo(&registry, false).await;

        let err = registry
            .wait_for_exit(id.as_str(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");

        registry.shutdown_all().await;
        assert!(registry.list().await.is_empty());
    }
}

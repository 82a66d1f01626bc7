// ABOUTME: Host process spawning for the local backend
// ABOUTME: Runs shell commands in their own process group, drains pipes, and signals whole groups

use super::{OutputWriter, ProcessRegistry, SessionControl, SessionId, StreamType};
use crate::error::{EnvironmentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;

/// Build `<shell> -c <command>` running in its own process group
pub(crate) fn shell_command(
    shell: &str,
    command: &str,
    cwd: &Path,
    env_vars: &HashMap<String, String>,
) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command).current_dir(cwd).envs(env_vars);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Signal every process in the group led by `pid`
pub(crate) fn signal_process_group(pid: u32, force: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) => {
                debug!("Sent {} to process group {}", signal, pid);
                Ok(())
            }
            // Group already gone
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(EnvironmentError::Io(std::io::Error::from(e))),
        }
    }

    #[cfg(not(unix))]
    {
        warn!(
            "Process group signalling not implemented for this platform (pid {}, force {})",
            pid, force
        );
        Ok(())
    }
}

/// Exit code, or the negated signal number for signal-terminated processes
pub(crate) fn exit_code(status: ExitStatus) -> Option<i64> {
    if let Some(code) = status.code() {
        return Some(code as i64);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|signal| -(signal as i64))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

/// Drain stdout and stderr concurrently into the session buffers until both close
pub(crate) async fn pump_pipes<O, E>(mut stdout: Option<O>, mut stderr: Option<E>, writer: &OutputWriter)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Ok(n) if n > 0 => writer.append(StreamType::Stdout, &out_buf[..n]),
                _ => stdout = None,
            },
            read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(n) if n > 0 => writer.append(StreamType::Stderr, &err_buf[..n]),
                _ => stderr = None,
            },
            else => break,
        }
    }
}

/// Pipe output shared with its reader task so partial reads survive cancellation
pub(crate) type PipeBuffer = Arc<Mutex<Vec<u8>>>;

/// Collect a pipe into `buffer` until it closes
pub(crate) async fn read_into<R: AsyncRead + Unpin>(reader: Option<R>, buffer: PipeBuffer) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.lock().await.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!("Pipe read ended with error: {}", e);
                break;
            }
        }
    }
}

struct LocalProcessControl {
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
}

#[async_trait]
impl SessionControl for LocalProcessControl {
    async fn signal(&self, force: bool) -> Result<()> {
        match self.pid {
            Some(pid) => signal_process_group(pid, force),
            None => Ok(()),
        }
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

async fn drain_child(mut child: Child, writer: OutputWriter) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    pump_pipes(stdout, stderr, &writer).await;

    match child.wait().await {
        Ok(status) => {
            let code = exit_code(status);
            debug!("Session process exited with {:?}", code);
            writer.finish(code);
        }
        Err(e) => {
            warn!("Failed to wait for session process: {}", e);
            writer.fail(e.to_string());
        }
    }
}

/// Spawn a non-blocking host command and register it as a session
pub(crate) async fn spawn_session(
    registry: &ProcessRegistry,
    shell: &str,
    command: &str,
    cwd: &Path,
    env_vars: &HashMap<String, String>,
) -> Result<SessionId> {
    let mut cmd = shell_command(shell, command, cwd, env_vars);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        EnvironmentError::InvalidInput(format!("failed to spawn '{}': {}", command, e))
    })?;

    let control = Arc::new(LocalProcessControl {
        pid: child.id(),
        stdin: Mutex::new(child.stdin.take()),
    });

    let id = registry
        .register(
            command.to_string(),
            crate::paths::display(cwd),
            control,
            move |writer| drain_child(child, writer),
        )
        .await;
    Ok(id)
}

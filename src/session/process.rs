//! Agent Subprocess
//!
//! Spawning, stdin writes and signalling for one agent process. Each
//! process runs in its own process group so an interrupt or kill also
//! reaches anything it started.

use bytes::BytesMut;
use log::{debug, info, warn};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::PipelineError;
use crate::router::{OutputRouter, RawChunk, StreamKind};

/// Bytes requested per pipe read
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Handle for writing to an agent's stdin without holding its lifecycle lock.
///
/// Clones share the pipe. Once closed, pending and future writes fail with
/// `BrokenPipe` instead of waiting for the agent to read.
#[derive(Clone)]
pub struct StdinWriter {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    closed: CancellationToken,
}

impl StdinWriter {
    fn new(stdin: Option<ChildStdin>) -> Self {
        Self {
            stdin: Arc::new(Mutex::new(stdin)),
            closed: CancellationToken::new(),
        }
    }

    /// Write one line, adding the trailing newline if missing
    pub async fn write_line(&self, text: &str) -> io::Result<()> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(broken_pipe()),
            result = self.write_locked(text) => result,
        }
    }

    async fn write_locked(&self, text: &str) -> io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(broken_pipe)?;

        stdin.write_all(text.as_bytes()).await?;
        if !text.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await
    }

    /// Fail every pending and future write
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed")
}

/// A live agent process with its pipe reader tasks
pub struct ManagedProcess {
    /// Session ID this process belongs to
    pub session_id: String,
    /// Spawn generation stamped on every chunk it produces
    pub generation: u64,
    /// Process ID (also the process group ID on unix)
    pub pid: u32,
    child: Child,
    stdin: StdinWriter,
    stdout_handle: Option<JoinHandle<()>>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    /// Resolve the agent executable and start it in `working_directory`.
    ///
    /// Output is forwarded to `router` tagged with `generation`. Must be
    /// called within a tokio runtime.
    pub fn spawn(
        session_id: &str,
        generation: u64,
        agent: &AgentConfig,
        working_directory: &Path,
        env: &[(String, String)],
        router: Arc<OutputRouter>,
    ) -> Result<Self, PipelineError> {
        let executable = which::which(&agent.program).map_err(|e| PipelineError::Spawn {
            program: agent.program.clone(),
            reason: e.to_string(),
        })?;

        let mut command = Command::new(&executable);
        command
            .args(&agent.args)
            .current_dir(working_directory)
            .envs(&agent.env)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| PipelineError::Spawn {
            program: executable.display().to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id().unwrap_or(0);
        let stdin = StdinWriter::new(child.stdin.take());
        let stdout_handle = child.stdout.take().map(|out| {
            spawn_reader(out, session_id, generation, StreamKind::Stdout, Arc::clone(&router))
        });
        let stderr_handle = child.stderr.take().map(|err| {
            spawn_reader(err, session_id, generation, StreamKind::Stderr, Arc::clone(&router))
        });

        info!(
            "Spawned {} for session {} (pid {}, generation {}) in {}",
            executable.display(),
            session_id,
            pid,
            generation,
            working_directory.display()
        );

        Ok(Self {
            session_id: session_id.to_string(),
            generation,
            pid,
            child,
            stdin,
            stdout_handle,
            stderr_handle,
        })
    }

    /// A writer sharing this process's stdin
    pub fn writer(&self) -> StdinWriter {
        self.stdin.clone()
    }

    /// Close stdin, then wait up to `timeout` for the agent to exit and its
    /// stdout to drain. Returns false if it was still running.
    pub async fn finish_output(&mut self, timeout: Duration) -> bool {
        self.stdin.close();
        // Dropping the pipe is what delivers EOF to the agent
        self.stdin.stdin.lock().await.take();

        let drained = tokio::time::timeout(timeout, async {
            let exited = self.child.wait().await.is_ok();
            if let Some(handle) = self.stdout_handle.take() {
                let _ = handle.await;
            }
            if let Some(handle) = self.stderr_handle.take() {
                let _ = handle.await;
            }
            exited
        })
        .await;

        match drained {
            Ok(exited) => exited,
            Err(_) => {
                debug!("Process {} still running after stdin closed", self.pid);
                false
            }
        }
    }

    /// Send SIGINT to the process group
    #[cfg(unix)]
    pub fn interrupt(&mut self) -> io::Result<()> {
        self.signal_group(libc::SIGINT)
    }

    #[cfg(not(unix))]
    pub fn interrupt(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    /// Interrupt, wait up to `grace`, then kill. Returns true if the kill was needed.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<bool> {
        if let Err(e) = self.interrupt() {
            warn!("Failed to interrupt pid {}: {}", self.pid, e);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process {} exited after interrupt: {}", self.pid, status);
                self.abort_readers();
                Ok(false)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.kill().await?;
                Ok(true)
            }
        }
    }

    /// Kill the process group immediately and reap the child
    pub async fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            if let Err(e) = self.signal_group(libc::SIGKILL) {
                debug!("Group kill of {} failed: {}", self.pid, e);
            }
        }

        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        self.abort_readers();
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        // pid 0 would address our own group
        if self.pid == 0 {
            return Ok(());
        }
        let rc = unsafe { libc::kill(-(self.pid as libc::pid_t), signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone
            return Ok(());
        }
        Err(err)
    }

    fn abort_readers(&mut self) {
        self.stdin.close();
        if let Some(handle) = self.stdout_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_handle.take() {
            handle.abort();
        }
    }
}

/// Forward one pipe to the router until EOF
fn spawn_reader<R>(
    mut reader: R,
    session_id: &str,
    generation: u64,
    stream: StreamKind,
    router: Arc<OutputRouter>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        loop {
            buf.reserve(READ_CHUNK_SIZE);
            match reader.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = RawChunk {
                        session_id: session_id.clone(),
                        generation,
                        stream,
                        bytes: buf.split().freeze(),
                    };
                    if router.route(chunk).is_err() {
                        // Session is gone; nobody will read the rest
                        break;
                    }
                }
                Err(e) => {
                    warn!("Read from {:?} of session {} failed: {}", stream, session_id, e);
                    break;
                }
            }
        }

        router.finish(&session_id, generation, stream);
        debug!("{:?} reader for session {} (generation {}) ended", stream, session_id, generation);
    })
}

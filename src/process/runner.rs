//! Foreground and detached process execution.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::output::{OutputBuffer, utf8_safe_split};
use super::terminate::{PlatformTerminator, ProcessTreeTerminator, TerminateError};
use super::{CommandSpec, ExecutionOutcome, SpawnError};
use crate::redact::SecretRedactor;

/// Default per-stream character budget.
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 1_000_000;
/// Default wait for output pipes to close after the child exits.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Partial lines longer than this are flushed without waiting for a newline.
const MAX_PENDING_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub max_output_chars: usize,
    pub drain_timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

type SharedBuffer = Arc<Mutex<OutputBuffer>>;

fn lock_buffer(buffer: &Mutex<OutputBuffer>) -> MutexGuard<'_, OutputBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_reader_task<R>(reader: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let available = match reader.fill_buf().await {
                Ok([]) => break,
                Ok(available) => available,
                Err(err) => {
                    debug!(error = %err, "output stream closed with error");
                    break;
                }
            };

            let (consumed, line_done) = match available.iter().position(|b| *b == b'\n') {
                Some(idx) => (idx + 1, true),
                None => (available.len(), false),
            };
            pending.extend_from_slice(&available[..consumed]);
            reader.consume(consumed);

            if line_done {
                lock_buffer(&buffer).push(&String::from_utf8_lossy(&pending));
                pending.clear();
            } else if pending.len() >= MAX_PENDING_LINE_BYTES {
                let split = utf8_safe_split(&pending);
                lock_buffer(&buffer).push(&String::from_utf8_lossy(&pending[..split]));
                pending.drain(..split);
            }
        }
        if !pending.is_empty() {
            lock_buffer(&buffer).push(&String::from_utf8_lossy(&pending));
        }
    })
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Wait for reader tasks to observe EOF, bounded by `timeout`.
///
/// Grandchildren that outlive the child can keep a pipe open forever; after
/// the timeout the readers are abandoned and whatever was captured is used.
async fn drain_readers(readers: Vec<JoinHandle<()>>, timeout: Duration) {
    let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    let joined = tokio::time::timeout(timeout, async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
    if joined.is_err() {
        debug!("output pipes still open after drain timeout");
        for abort in aborts {
            abort.abort();
        }
    }
}

/// Spawns tool processes and captures their output.
///
/// Every call owns its own child and buffers, so concurrent calls are
/// independent. Mutual exclusion between operations is the caller's job.
#[derive(Clone)]
pub struct ProcessRunner {
    settings: RunnerSettings,
    redactor: SecretRedactor,
    terminator: Arc<dyn ProcessTreeTerminator>,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(RunnerSettings::default())
    }
}

impl ProcessRunner {
    #[must_use]
    pub fn new(settings: RunnerSettings) -> Self {
        Self {
            settings,
            redactor: SecretRedactor::new(),
            terminator: Arc::new(PlatformTerminator),
        }
    }

    #[must_use]
    pub fn with_redactor(mut self, redactor: SecretRedactor) -> Self {
        self.redactor = redactor;
        self
    }

    #[must_use]
    pub fn with_terminator(mut self, terminator: Arc<dyn ProcessTreeTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    #[must_use]
    pub fn settings(&self) -> RunnerSettings {
        self.settings
    }

    #[must_use]
    pub fn terminator(&self) -> Arc<dyn ProcessTreeTerminator> {
        Arc::clone(&self.terminator)
    }

    fn spawn_child(&self, spec: &CommandSpec) -> Result<Child, SpawnError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        // Own process group, so the whole tree can be signalled together.
        #[cfg(unix)]
        command.process_group(0);

        command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SpawnError::NotFound {
                    program: spec.program.clone(),
                }
            } else {
                SpawnError::Io {
                    command: self.redactor.redact_owned(&spec.display()),
                    source,
                }
            }
        })
    }

    fn attach_readers(
        &self,
        child: &mut Child,
    ) -> (SharedBuffer, SharedBuffer, Vec<JoinHandle<()>>) {
        let max_chars = self.settings.max_output_chars;
        let stdout = Arc::new(Mutex::new(OutputBuffer::new(max_chars)));
        let stderr = Arc::new(Mutex::new(OutputBuffer::new(max_chars)));
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_reader_task(pipe, Arc::clone(&stdout)));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_reader_task(pipe, Arc::clone(&stderr)));
        }
        (stdout, stderr, readers)
    }

    fn finish_output(&self, buffer: &SharedBuffer, redact: bool) -> String {
        let text = lock_buffer(buffer).as_str().to_string();
        if redact {
            self.redactor.redact_owned(&text)
        } else {
            text
        }
    }

    /// Run `spec` to completion or until `cancel` fires.
    ///
    /// On cancellation the whole process tree is killed and the output
    /// captured so far is returned as [`ExecutionOutcome::Cancelled`]. With
    /// `redact` set, both streams pass through the secret redactor first.
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        redact: bool,
    ) -> ExecutionOutcome {
        let command = spec.display();
        let logged_command = self.redactor.redact_owned(&command);

        if cancel.is_cancelled() {
            debug!(command = %logged_command, "cancelled before spawn");
            return ExecutionOutcome::Cancelled {
                command,
                stdout: String::new(),
                stderr: String::new(),
            };
        }

        let mut child = match self.spawn_child(spec) {
            Ok(child) => child,
            Err(err @ SpawnError::NotFound { .. }) => {
                warn!(command = %logged_command, "executable not available");
                return ExecutionOutcome::Unavailable {
                    command,
                    message: err.to_string(),
                };
            }
            Err(err) => {
                warn!(command = %logged_command, error = %err, "process failed to start");
                return ExecutionOutcome::StartFailed {
                    command,
                    message: err.to_string(),
                };
            }
        };

        let pid = child.id();
        debug!(pid, command = %logged_command, "spawned process");
        let (stdout, stderr, readers) = self.attach_readers(&mut child);

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };

        match waited {
            Some(Ok(status)) => {
                drain_readers(readers, self.settings.drain_timeout).await;
                let exit_code = exit_code_of(status);
                debug!(pid, exit_code, "process exited");
                ExecutionOutcome::Completed {
                    command,
                    stdout: self.finish_output(&stdout, redact),
                    stderr: self.finish_output(&stderr, redact),
                    exit_code,
                }
            }
            Some(Err(err)) => {
                warn!(pid, error = %err, "failed waiting for process");
                self.kill_tree(pid, &mut child).await;
                drain_readers(readers, self.settings.drain_timeout).await;
                ExecutionOutcome::StartFailed {
                    command,
                    message: format!("failed waiting for process: {err}"),
                }
            }
            None => {
                info!(pid, command = %logged_command, "cancellation requested, killing process tree");
                self.kill_tree(pid, &mut child).await;
                drain_readers(readers, self.settings.drain_timeout).await;
                ExecutionOutcome::Cancelled {
                    command,
                    stdout: self.finish_output(&stdout, redact),
                    stderr: self.finish_output(&stderr, redact),
                }
            }
        }
    }

    async fn kill_tree(&self, pid: Option<u32>, child: &mut Child) {
        if let Some(pid) = pid {
            if let Err(err) = self.terminator.terminate_tree(pid) {
                warn!(pid, error = %err, "process tree termination failed; killing child only");
                let _ = child.start_kill();
            }
        } else {
            let _ = child.start_kill();
        }
        if tokio::time::timeout(self.settings.drain_timeout, child.wait())
            .await
            .is_err()
        {
            warn!(pid, "process did not exit after kill");
        }
    }

    /// Start `spec` without waiting for it.
    ///
    /// Output keeps streaming into bounded buffers owned by the returned
    /// handle; dropping the handle kills the child.
    pub fn spawn_detached(&self, spec: &CommandSpec) -> Result<DetachedProcess, SpawnError> {
        let mut child = self.spawn_child(spec)?;
        let pid = child.id();
        let command = spec.display();
        debug!(pid, command = %self.redactor.redact_owned(&command), "spawned detached process");
        let (stdout, stderr, readers) = self.attach_readers(&mut child);
        Ok(DetachedProcess {
            child,
            pid,
            command,
            started_at: Utc::now(),
            stdout,
            stderr,
            readers,
            exit_code: None,
        })
    }
}

/// A background child handed off to a session.
pub struct DetachedProcess {
    child: Child,
    pid: Option<u32>,
    command: String,
    started_at: DateTime<Utc>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Vec<JoinHandle<()>>,
    exit_code: Option<i32>,
}

impl std::fmt::Debug for DetachedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedProcess")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

impl DetachedProcess {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Unredacted command line; redact before showing it to anyone.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Exit code if the process has finished, without blocking.
    pub fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        let exit_code = self.child.try_wait()?.map(exit_code_of);
        self.exit_code = exit_code;
        Ok(exit_code)
    }

    /// Current captured `(stdout, stderr)`, unredacted.
    #[must_use]
    pub fn output_snapshot(&self) -> (String, String) {
        (
            lock_buffer(&self.stdout).as_str().to_string(),
            lock_buffer(&self.stderr).as_str().to_string(),
        )
    }

    /// Kill the process tree, then wait up to `grace` for the child to exit.
    ///
    /// A child that has already exited is not an error. Failing to exit in
    /// time is only logged: the kill has been delivered.
    pub async fn terminate(
        &mut self,
        terminator: &dyn ProcessTreeTerminator,
        grace: Duration,
    ) -> Result<Option<i32>, TerminateError> {
        if let Ok(Some(code)) = self.try_wait() {
            return Ok(Some(code));
        }

        match self.pid {
            Some(pid) => terminator.terminate_tree(pid)?,
            None => {
                let _ = self.child.start_kill();
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                let code = exit_code_of(status);
                self.exit_code = Some(code);
                Ok(Some(code))
            }
            Ok(Err(err)) => {
                warn!(pid = self.pid, error = %err, "failed waiting for terminated process");
                Ok(None)
            }
            Err(_) => {
                warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "process did not exit within grace period");
                Ok(None)
            }
        }
    }
}

impl Drop for DetachedProcess {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

//! Subprocess execution: spawning, bounded capture, cancellation and
//! process-tree termination.
//!
//! Arguments are always passed as a literal vector. Nothing here goes
//! through a shell, so caller-supplied arguments can never inject commands.

mod output;
mod runner;
mod terminate;


use std::path::PathBuf;

use thiserror::Error;

use crate::classifier::ErrorClassifier;
use crate::error_taxonomy::{CANCELLED_EXIT_CODE, ClassifiedError, CommandResponse};

pub use output::{OutputBuffer, TRUNCATION_MARKER};
pub use runner::{DetachedProcess, ProcessRunner, RunnerSettings};
pub use terminate::{PlatformTerminator, ProcessTreeTerminator, TerminateError};

/// Exit code reported when the executable could not be found.
pub const NOT_FOUND_EXIT_CODE: i32 = 127;
/// Exit code reported when the OS refused to start the executable.
pub const START_FAILED_EXIT_CODE: i32 = 126;

/// A fully-built command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-quoted rendering for logs and error context. Never executed.
    #[must_use]
    pub fn display(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(words.clone()).unwrap_or_else(|_| words.collect::<Vec<_>>().join(" "))
    }
}

/// Why a process could not be started.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("`{program}` is not installed or not on PATH")]
    NotFound { program: String },
    #[error("failed to start `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// How one foreground execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The process exited on its own.
    Completed {
        command: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// The cancellation token fired; output is whatever was captured first.
    Cancelled {
        command: String,
        stdout: String,
        stderr: String,
    },
    /// The executable does not exist here.
    Unavailable { command: String, message: String },
    /// The OS refused to start the process.
    StartFailed { command: String, message: String },
}

impl ExecutionOutcome {
    #[must_use]
    pub fn command(&self) -> &str {
        match self {
            ExecutionOutcome::Completed { command, .. }
            | ExecutionOutcome::Cancelled { command, .. }
            | ExecutionOutcome::Unavailable { command, .. }
            | ExecutionOutcome::StartFailed { command, .. } => command,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionOutcome::Completed { exit_code, .. } => *exit_code,
            ExecutionOutcome::Cancelled { .. } => CANCELLED_EXIT_CODE,
            ExecutionOutcome::Unavailable { .. } => NOT_FOUND_EXIT_CODE,
            ExecutionOutcome::StartFailed { .. } => START_FAILED_EXIT_CODE,
        }
    }

    /// Turn the outcome into the caller-facing response.
    #[must_use]
    pub fn classify(&self, classifier: &ErrorClassifier) -> CommandResponse {
        let redactor = classifier.redactor();
        match self {
            ExecutionOutcome::Completed {
                command,
                stdout,
                stderr,
                exit_code,
            } => classifier.classify(stdout, stderr, *exit_code, command),
            ExecutionOutcome::Cancelled {
                command,
                stdout,
                stderr,
            } => CommandResponse::failure(
                ClassifiedError::cancelled(
                    Some(redactor.redact_owned(command)),
                    &redactor.redact(stdout),
                    &redactor.redact(stderr),
                ),
                CANCELLED_EXIT_CODE,
            ),
            ExecutionOutcome::Unavailable { command, message } => CommandResponse::failure(
                ClassifiedError::capability_unavailable(
                    message.clone(),
                    Some(redactor.redact_owned(command)),
                ),
                NOT_FOUND_EXIT_CODE,
            ),
            ExecutionOutcome::StartFailed { command, message } => CommandResponse::failure(
                ClassifiedError::process_start_failed(
                    redactor.redact_owned(message),
                    Some(redactor.redact_owned(command)),
                ),
                START_FAILED_EXIT_CODE,
            ),
        }
    }
}

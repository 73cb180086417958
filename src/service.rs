//! Host wiring: one guard, one runner, one session registry and the
//! catalog caches, composed into the request flows callers use.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheMetrics, Cached, LoadOptions, ResourceCache};
use crate::classifier::ErrorClassifier;
use crate::config::ResolvedConfig;
use crate::error_taxonomy::{ClassifiedError, CommandResponse, ErrorCategory};
use crate::guard::{ConflictGuard, KindClass, OperationKind, OperationPermit};
use crate::process::{
    CommandSpec, ExecutionOutcome, NOT_FOUND_EXIT_CODE, ProcessRunner, START_FAILED_EXIT_CODE,
    SpawnError,
};
use crate::sessions::{
    SessionError, SessionInfo, SessionOutput, SessionRegistry, StopOutcome, new_session_id,
};

/// Exit code for requests rejected before any process was started.
pub const REJECTED_EXIT_CODE: i32 = 1;

/// One operation to run: a kind tag, the fully-built `dotnet` arguments and
/// where to run them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub args: Vec<String>,
    /// Lock target. Defaults to `cwd` when absent.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub operation_id: Option<String>,
}

impl OperationRequest {
    #[must_use]
    pub fn new<I, S>(kind: OperationKind, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            args: args.into_iter().map(Into::into).collect(),
            target: None,
            cwd: None,
            operation_id: None,
        }
    }

    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Target used for locking. Global kinds always lock the empty target;
    /// everything else falls back to the directory the child will run in.
    fn lock_target(&self) -> String {
        if self.kind.class() == KindClass::Global {
            return String::new();
        }
        if let Some(target) = &self.target {
            return target.clone();
        }
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Returned by [`BridgeService::start_background`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub session_id: String,
    pub pid: Option<u32>,
    pub kind: String,
    pub command: String,
}

/// Session status plus its captured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDetails {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub output: SessionOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkInfo {
    pub version: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheReport {
    #[serde(flatten)]
    pub metrics: CacheMetrics,
    pub cached: bool,
    pub ttl_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub sdks: CacheReport,
    pub runtimes: CacheReport,
    pub version: CacheReport,
}

fn cache_report<T>(cache: &ResourceCache<T>) -> CacheReport {
    let metadata = cache.peek_metadata();
    CacheReport {
        metrics: cache.metrics(),
        cached: !cache.is_expired(),
        ttl_secs: metadata.map_or(cache.default_ttl(), |m| m.ttl).as_secs(),
        age_secs: metadata.map(|m| m.age.as_secs_f64()),
    }
}

/// Reject input that must never reach a subprocess.
fn validate(request: &OperationRequest) -> Result<(), ClassifiedError> {
    if request.args.is_empty() {
        return Err(ClassifiedError::validation("Argument list cannot be empty"));
    }
    if request.args.iter().any(|arg| arg.contains('\0')) {
        return Err(ClassifiedError::validation(
            "Arguments must not contain NUL bytes",
        ));
    }
    if let Some(cwd) = &request.cwd
        && !cwd.is_dir()
    {
        return Err(ClassifiedError::validation(format!(
            "Working directory does not exist: {}",
            cwd.display()
        )));
    }
    Ok(())
}

/// Parse `dotnet --list-sdks`: `8.0.100 [/usr/share/dotnet/sdk]`.
#[must_use]
pub fn parse_sdk_list(output: &str) -> Vec<SdkInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (version, path) = split_bracketed(line)?;
            Some(SdkInfo {
                version: version.to_string(),
                path: path.to_string(),
            })
        })
        .collect()
}

/// Parse `dotnet --list-runtimes`:
/// `Microsoft.NETCore.App 8.0.0 [/usr/share/dotnet/shared/Microsoft.NETCore.App]`.
#[must_use]
pub fn parse_runtime_list(output: &str) -> Vec<RuntimeInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (head, path) = split_bracketed(line)?;
            let (name, version) = head.rsplit_once(' ')?;
            Some(RuntimeInfo {
                name: name.trim().to_string(),
                version: version.to_string(),
                path: path.to_string(),
            })
        })
        .collect()
}

fn split_bracketed(line: &str) -> Option<(&str, &str)> {
    let (head, rest) = line.trim().split_once(" [")?;
    let path = rest.strip_suffix(']')?;
    let head = head.trim();
    (!head.is_empty()).then_some((head, path))
}

/// The bridge's request surface.
#[derive(Debug)]
pub struct BridgeService {
    config: ResolvedConfig,
    guard: ConflictGuard,
    runner: ProcessRunner,
    classifier: ErrorClassifier,
    sessions: SessionRegistry,
    sdk_cache: ResourceCache<Vec<SdkInfo>>,
    runtime_cache: ResourceCache<Vec<RuntimeInfo>>,
    version_cache: ResourceCache<String>,
}

impl BridgeService {
    #[must_use]
    pub fn new(config: ResolvedConfig) -> Self {
        let runner = ProcessRunner::new(config.runner_settings());
        let sessions = SessionRegistry::new(runner.terminator(), config.stop_grace_period);
        Self {
            guard: ConflictGuard::new(),
            classifier: ErrorClassifier::new(),
            sessions,
            sdk_cache: ResourceCache::new(config.cache_ttl).with_name("sdks"),
            runtime_cache: ResourceCache::new(config.cache_ttl).with_name("runtimes"),
            version_cache: ResourceCache::new(config.cache_ttl).with_name("version"),
            runner,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    #[must_use]
    pub fn guard(&self) -> &ConflictGuard {
        &self.guard
    }

    fn command_spec(&self, request: &OperationRequest) -> CommandSpec {
        let spec = CommandSpec::new(&self.config.dotnet_path).args(request.args.iter().cloned());
        match &request.cwd {
            Some(cwd) => spec.cwd(cwd),
            None => spec,
        }
    }

    /// Take the lock for mutating and global kinds. Read-only kinds never
    /// enter the guard.
    fn acquire(
        &self,
        request: &OperationRequest,
        operation_id: &str,
    ) -> Result<Option<OperationPermit>, CommandResponse> {
        if request.kind.class() == KindClass::ReadOnly {
            return Ok(None);
        }
        let target = request.lock_target();
        match self.guard.try_acquire(&request.kind, &target, operation_id) {
            Ok(permit) => Ok(Some(permit)),
            Err(conflict) => {
                let requested = format!("{} on {}", request.kind, permit_target(&target));
                Err(CommandResponse::failure(
                    ClassifiedError::concurrency_conflict(&requested, &conflict.description()),
                    REJECTED_EXIT_CODE,
                ))
            }
        }
    }

    /// Run one operation to completion: validate, lock, execute, classify.
    pub async fn execute(
        &self,
        request: OperationRequest,
        cancel: &CancellationToken,
    ) -> CommandResponse {
        if let Err(error) = validate(&request) {
            return CommandResponse::failure(error, REJECTED_EXIT_CODE);
        }

        let operation_id = request
            .operation_id
            .clone()
            .unwrap_or_else(new_session_id);
        let permit = match self.acquire(&request, &operation_id) {
            Ok(permit) => permit,
            Err(response) => return response,
        };

        info!(kind = %request.kind, operation_id = %operation_id, "operation started");
        let spec = self.command_spec(&request);
        let outcome = self
            .runner
            .execute(&spec, cancel, self.config.redact_output)
            .await;
        drop(permit);

        let response = outcome.classify(&self.classifier);
        info!(
            kind = %request.kind,
            operation_id = %operation_id,
            exit_code = response.exit_code(),
            success = response.is_success(),
            "operation finished"
        );
        response
    }

    /// Start a long-running operation and track it as a session.
    ///
    /// Mutating kinds keep their lock until the session is stopped or reaped.
    pub fn start_background(
        &self,
        request: OperationRequest,
    ) -> Result<SessionStarted, CommandResponse> {
        validate(&request).map_err(|error| CommandResponse::failure(error, REJECTED_EXIT_CODE))?;

        let session_id = request
            .operation_id
            .clone()
            .unwrap_or_else(new_session_id);
        if self.sessions.contains(&session_id) {
            return Err(duplicate_session(&session_id));
        }
        let permit = self.acquire(&request, &session_id)?;

        let spec = self.command_spec(&request);
        let redacted_command = self.classifier.redactor().redact_owned(&spec.display());
        let process = match self.runner.spawn_detached(&spec) {
            Ok(process) => process,
            Err(err @ SpawnError::NotFound { .. }) => {
                return Err(CommandResponse::failure(
                    ClassifiedError::capability_unavailable(err.to_string(), Some(redacted_command)),
                    NOT_FOUND_EXIT_CODE,
                ));
            }
            Err(err) => {
                return Err(CommandResponse::failure(
                    ClassifiedError::process_start_failed(
                        self.classifier.redactor().redact_owned(&err.to_string()),
                        Some(redacted_command),
                    ),
                    START_FAILED_EXIT_CODE,
                ));
            }
        };

        let started = SessionStarted {
            session_id: session_id.clone(),
            pid: process.pid(),
            kind: request.kind.to_string(),
            command: redacted_command,
        };
        let target = request.lock_target();
        match self
            .sessions
            .register(&session_id, process, request.kind, &target, permit)
        {
            Ok(()) => Ok(started),
            Err(SessionError::DuplicateId { id, process, .. }) => {
                // Lost a registration race. Nothing else owns this child;
                // dropping it kills it.
                drop(process);
                Err(duplicate_session(&id))
            }
        }
    }

    pub async fn stop_session(&self, session_id: &str) -> CommandResponse {
        match self.sessions.try_stop(session_id).await {
            StopOutcome::Stopped => CommandResponse::success(
                format!("Session {session_id} stopped"),
                format!("stop {session_id}"),
            ),
            StopOutcome::NotFound => CommandResponse::failure(
                ClassifiedError::validation(format!("Session '{session_id}' not found")),
                REJECTED_EXIT_CODE,
            ),
            StopOutcome::Failed(message) => CommandResponse::failure(
                ClassifiedError::new("STOP_FAILED", message, ErrorCategory::Unknown),
                REJECTED_EXIT_CODE,
            ),
        }
    }

    #[must_use]
    pub fn session_info(&self, session_id: &str) -> Option<SessionDetails> {
        let info = self.sessions.try_get_info(session_id)?;
        let output = self.sessions.recent_output(session_id)?;
        Some(SessionDetails { info, output })
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list_active()
    }

    /// Reap sessions that exited on their own, releasing their locks.
    pub fn cleanup_sessions(&self) -> usize {
        self.sessions.cleanup_exited()
    }

    /// Stop every session. Call before exiting.
    pub async fn shutdown(&self) {
        let stopped = self.sessions.stop_all().await;
        if stopped > 0 {
            info!(stopped, "stopped sessions on shutdown");
        }
    }

    /// Run a read-only `dotnet` query and return its stdout.
    ///
    /// The configured default timeout applies on top of `cancel`, so a hung
    /// query never holds a cache's load lock forever.
    async fn query(
        &self,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<String, CommandResponse> {
        let spec = CommandSpec::new(&self.config.dotnet_path).args(args.iter().copied());
        let deadline = self.deadline_token(cancel, None);
        let outcome = self.runner.execute(&spec, &deadline, true).await;
        deadline.cancel();
        if let ExecutionOutcome::Completed { exit_code, .. } = &outcome
            && *exit_code != 0
        {
            warn!(args = ?args, exit_code, "catalog query failed");
        }
        match outcome.classify(&self.classifier) {
            CommandResponse::Success { output, .. } => Ok(output),
            failure => Err(failure),
        }
    }

    pub async fn installed_sdks(
        &self,
        force_reload: bool,
        cancel: &CancellationToken,
    ) -> Result<Cached<Vec<SdkInfo>>, CommandResponse> {
        self.sdk_cache
            .get_or_load(
                || async {
                    self.query(&["--list-sdks"], cancel)
                        .await
                        .map(|out| parse_sdk_list(&out))
                },
                LoadOptions::force(force_reload),
            )
            .await
    }

    pub async fn installed_runtimes(
        &self,
        force_reload: bool,
        cancel: &CancellationToken,
    ) -> Result<Cached<Vec<RuntimeInfo>>, CommandResponse> {
        self.runtime_cache
            .get_or_load(
                || async {
                    self.query(&["--list-runtimes"], cancel)
                        .await
                        .map(|out| parse_runtime_list(&out))
                },
                LoadOptions::force(force_reload),
            )
            .await
    }

    pub async fn tool_version(
        &self,
        force_reload: bool,
        cancel: &CancellationToken,
    ) -> Result<Cached<String>, CommandResponse> {
        self.version_cache
            .get_or_load(
                || async {
                    self.query(&["--version"], cancel)
                        .await
                        .map(|out| out.trim().to_string())
                },
                LoadOptions::force(force_reload),
            )
            .await
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            sdks: cache_report(&self.sdk_cache),
            runtimes: cache_report(&self.runtime_cache),
            version: cache_report(&self.version_cache),
        }
    }

    pub fn clear_caches(&self) {
        self.sdk_cache.clear();
        self.runtime_cache.clear();
        self.version_cache.clear();
    }

    pub fn reset_cache_metrics(&self) {
        self.sdk_cache.reset_metrics();
        self.runtime_cache.reset_metrics();
        self.version_cache.reset_metrics();
    }

    /// Child of `parent` that also fires after `timeout`, or after the
    /// configured default timeout when `timeout` is `None`.
    ///
    /// Cancel the token once the operation is done; that also ends the
    /// timer task.
    #[must_use]
    pub fn deadline_token(
        &self,
        parent: &CancellationToken,
        timeout: Option<Duration>,
    ) -> CancellationToken {
        let token = parent.child_token();
        if let Some(timeout) = timeout.or(self.config.default_timeout) {
            let child = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => child.cancel(),
                    () = child.cancelled() => {}
                }
            });
        }
        token
    }
}

fn duplicate_session(id: &str) -> CommandResponse {
    CommandResponse::failure(
        ClassifiedError::validation(format!("Session id '{id}' is already in use")),
        REJECTED_EXIT_CODE,
    )
}

fn permit_target(target: &str) -> &str {
    if target.is_empty() { "<global>" } else { target }
}

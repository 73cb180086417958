//! Registry of long-running background processes (`watch`, `run`).
//!
//! Sessions live in a concurrent map. Stopping removes the entry before the
//! kill is attempted, so two concurrent stops of one id never race on the
//! same OS handle: the loser simply sees [`StopOutcome::NotFound`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::guard::{OperationKind, OperationPermit};
use crate::process::{DetachedProcess, PlatformTerminator, ProcessTreeTerminator};
use crate::redact::SecretRedactor;

/// Default wait for a killed session to exit.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Generate a fresh random session id.
#[must_use]
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The id is taken. The rejected process and permit are handed back.
    #[error("session id `{id}` is already registered")]
    DuplicateId {
        id: String,
        process: Box<DetachedProcess>,
        permit: Option<OperationPermit>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotFound,
    Failed(String),
}

/// Public view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub kind: String,
    pub target: String,
    /// Redacted command line.
    pub command: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Redacted output captured so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOutput {
    pub stdout: String,
    pub stderr: String,
}

struct Session {
    process: DetachedProcess,
    kind: OperationKind,
    target: String,
    // Held for the session's lifetime; dropping it frees the target.
    _permit: Option<OperationPermit>,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    terminator: Arc<dyn ProcessTreeTerminator>,
    grace_period: Duration,
    redactor: SecretRedactor,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(PlatformTerminator), DEFAULT_STOP_GRACE_PERIOD)
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new(terminator: Arc<dyn ProcessTreeTerminator>, grace_period: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            terminator,
            grace_period,
            redactor: SecretRedactor::new(),
        }
    }

    #[must_use]
    pub fn with_redactor(mut self, redactor: SecretRedactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Track `process` under `id`. Fails without replacing anything if the
    /// id is already in use.
    pub fn register(
        &self,
        id: &str,
        process: DetachedProcess,
        kind: OperationKind,
        target: &str,
        permit: Option<OperationPermit>,
    ) -> Result<(), SessionError> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => {
                warn!(session_id = id, "duplicate session id rejected");
                Err(SessionError::DuplicateId {
                    id: id.to_string(),
                    process: Box::new(process),
                    permit,
                })
            }
            Entry::Vacant(slot) => {
                info!(
                    session_id = id,
                    kind = %kind,
                    pid = process.pid(),
                    "session registered"
                );
                slot.insert(Session {
                    process,
                    kind,
                    target: target.to_string(),
                    _permit: permit,
                });
                Ok(())
            }
        }
    }

    /// Stop a session, killing its whole process tree.
    pub async fn try_stop(&self, id: &str) -> StopOutcome {
        let Some((_, mut session)) = self.sessions.remove(id) else {
            debug!(session_id = id, "stop requested for unknown session");
            return StopOutcome::NotFound;
        };

        match session
            .process
            .terminate(self.terminator.as_ref(), self.grace_period)
            .await
        {
            Ok(exit_code) => {
                info!(session_id = id, exit_code, "session stopped");
                StopOutcome::Stopped
            }
            Err(err) => {
                warn!(session_id = id, error = %err, "failed to stop session");
                StopOutcome::Failed(err.to_string())
            }
        }
    }

    #[must_use]
    pub fn try_get_info(&self, id: &str) -> Option<SessionInfo> {
        let mut session = self.sessions.get_mut(id)?;
        Some(self.info(id, &mut session))
    }

    /// Every tracked session, oldest first. Sessions that exited on their
    /// own stay listed until [`SessionRegistry::cleanup_exited`] reaps them.
    #[must_use]
    pub fn list_active(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter_mut()
            .map(|mut entry| {
                let id = entry.key().clone();
                self.info(&id, entry.value_mut())
            })
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Remove sessions whose process already exited. Returns how many.
    pub fn cleanup_exited(&self) -> usize {
        let mut reaped = 0;
        self.sessions.retain(|id, session| match session.process.try_wait() {
            Ok(None) => true,
            Ok(Some(exit_code)) => {
                info!(session_id = %id, exit_code, "reaped exited session");
                reaped += 1;
                false
            }
            Err(err) => {
                warn!(session_id = %id, error = %err, "dropping session with unreadable status");
                reaped += 1;
                false
            }
        });
        reaped
    }

    /// Redacted snapshot of a session's captured output.
    #[must_use]
    pub fn recent_output(&self, id: &str) -> Option<SessionOutput> {
        let session = self.sessions.get(id)?;
        let (stdout, stderr) = session.process.output_snapshot();
        Some(SessionOutput {
            stdout: self.redactor.redact_owned(&stdout),
            stderr: self.redactor.redact_owned(&stderr),
        })
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every session. Used on shutdown.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0;
        for id in ids {
            if self.try_stop(&id).await == StopOutcome::Stopped {
                stopped += 1;
            }
        }
        stopped
    }

    fn info(&self, id: &str, session: &mut Session) -> SessionInfo {
        let exit_code = match session.process.try_wait() {
            Ok(code) => code,
            Err(err) => {
                debug!(session_id = id, error = %err, "could not poll session");
                None
            }
        };
        SessionInfo {
            session_id: id.to_string(),
            kind: session.kind.to_string(),
            target: session.target.clone(),
            command: self.redactor.redact_owned(session.process.command()),
            pid: session.process.pid(),
            started_at: session.process.started_at(),
            running: exit_code.is_none(),
            exit_code,
        }
    }
}

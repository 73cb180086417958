//! Killing a child together with everything it spawned.
//!
//! Build tools fan out into compiler servers, test hosts and MSBuild worker
//! nodes; killing only the direct child leaves those running and holding the
//! output pipes open. On Unix every child is started as the leader of its own
//! process group so the whole group can be signalled at once. On Windows the
//! tree is walked by `taskkill /T`.

use thiserror::Error;

/// Errors from tree termination. "Already exited" is never an error.
#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to signal process group {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("taskkill failed for process {pid} with status {status}")]
    Taskkill { pid: u32, status: i32 },
    #[error("failed to run taskkill for process {pid}: {source}")]
    TaskkillSpawn {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("process tree termination is not supported on this platform")]
    Unsupported,
}

/// Capability to terminate a process and all of its descendants.
pub trait ProcessTreeTerminator: Send + Sync {
    /// Kill the tree rooted at `pid`. Returns `Ok` when the tree is already gone.
    fn terminate_tree(&self, pid: u32) -> Result<(), TerminateError>;
}

/// Terminator for the host operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformTerminator;

impl ProcessTreeTerminator for PlatformTerminator {
    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn terminate_tree(&self, pid: u32) -> Result<(), TerminateError> {
        let pgid = match libc::pid_t::try_from(pid) {
            Ok(pgid) if pgid > 0 => pgid,
            _ => {
                return Err(TerminateError::Signal {
                    pid,
                    source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
                });
            }
        };

        // SAFETY: `pgid` is positive, so `-pgid` addresses exactly the group
        // this child leads and never the caller's own group or every process.
        let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if result == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            tracing::debug!(pid, "process group already exited");
            return Ok(());
        }
        Err(TerminateError::Signal { pid, source: err })
    }

    #[cfg(windows)]
    fn terminate_tree(&self, pid: u32) -> Result<(), TerminateError> {
        let output = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .output()
            .map_err(|source| TerminateError::TaskkillSpawn { pid, source })?;

        if output.status.success() {
            return Ok(());
        }
        // 128: no such process.
        match output.status.code() {
            Some(128) => {
                tracing::debug!(pid, "process tree already exited");
                Ok(())
            }
            code => Err(TerminateError::Taskkill {
                pid,
                status: code.unwrap_or(-1),
            }),
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn terminate_tree(&self, _pid: u32) -> Result<(), TerminateError> {
        Err(TerminateError::Unsupported)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn missing_process_group_counts_as_terminated() {
        // Above the kernel's pid limit, so no such group can exist.
        let result = PlatformTerminator.terminate_tree(i32::MAX as u32 - 1);
        assert!(result.is_ok());
    }

    #[test]
    fn zero_pid_is_rejected() {
        let result = PlatformTerminator.terminate_tree(0);
        assert!(matches!(result, Err(TerminateError::Signal { pid: 0, .. })));
    }
}

//! Termination: graceful-then-forced shutdown of the monitored process
//! group, and reaping of the final status.
//!
//! Owned mode sends SIGTERM to the whole group, waits a bounded grace
//! period, then escalates to SIGKILL. Cooperative (pipe) mode has no process
//! to signal: we stop reading and close our ends, and the upstream process
//! takes SIGPIPE on its next write. That is a deliberately weaker guarantee
//! with no forced-kill escalation.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

/// How termination is achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationMode {
    /// We own the child: signal its process group, escalate, reap.
    #[default]
    Owned,
    /// Pipe topology: close our end and rely on upstream SIGPIPE.
    Cooperative,
}

/// Errors raised by the kill sequence. Never silently swallowed; surfaced
/// as a runtime error (exit code 3) by the caller.
#[derive(Debug)]
pub enum TerminationError {
    /// Sending a signal to the process group failed (not ESRCH).
    Signal {
        signal: &'static str,
        source: nix::errno::Errno,
    },
    /// Reaping the child failed.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for TerminationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationError::Signal { signal, source } => {
                write!(f, "failed to send {signal} to process group: {source}")
            }
            TerminationError::Wait { source } => {
                write!(f, "failed to reap process: {source}")
            }
        }
    }
}

impl std::error::Error for TerminationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TerminationError::Signal { source, .. } => Some(source),
            TerminationError::Wait { source } => Some(source),
        }
    }
}

/// Executes the graceful-then-forced kill sequence.
pub struct Terminator {
    grace: Duration,
}

impl Terminator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Terminate the child and its process group, returning the reaped
    /// status.
    ///
    /// Sequence: if already exited, just reap. Otherwise SIGTERM the group,
    /// wait up to the grace period, then SIGKILL the group and wait for the
    /// reap. ESRCH from `killpg` means the group is already gone and is
    /// treated as success.
    pub async fn shut_down(
        &self,
        child: &mut Child,
        pid: u32,
    ) -> Result<ExitStatus, TerminationError> {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| TerminationError::Wait { source: e })?
        {
            tracing::debug!(pid, status = %status, "process already exited before termination");
            return Ok(status);
        }

        tracing::info!(pid, grace_secs = self.grace.as_secs_f64(), "sending SIGTERM to process group");
        signal_group(pid, Signal::SIGTERM, "SIGTERM")?;

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid, status = %status, "process exited within grace period");
                return Ok(status);
            }
            Ok(Err(e)) => return Err(TerminationError::Wait { source: e }),
            Err(_) => {
                tracing::warn!(pid, "grace period expired, sending SIGKILL to process group");
            }
        }

        signal_group(pid, Signal::SIGKILL, "SIGKILL")?;
        child
            .wait()
            .await
            .map_err(|e| TerminationError::Wait { source: e })
    }
}

/// Signal the whole process group of `pid`. ESRCH is not an error: the
/// group is already gone.
fn signal_group(pid: u32, signal: Signal, name: &'static str) -> Result<(), TerminationError> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => {
            tracing::debug!(pid, signal = name, "process group already gone");
            Ok(())
        }
        Err(e) => Err(TerminationError::Signal {
            signal: name,
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{launch, LaunchSpec};
    use std::os::unix::process::ExitStatusExt;
    use std::time::Instant;

    fn spec(script: &str) -> LaunchSpec {
        LaunchSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_shut_down_reaps_already_exited() {
        let mut proc = launch(&spec("exit 7")).unwrap();
        // Give it a moment to exit on its own
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = Terminator::new(Duration::from_secs(1))
            .shut_down(&mut proc.child, proc.pid)
            .await
            .unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test]
    async fn test_shut_down_sigterm_is_enough() {
        // Default SIGTERM disposition terminates the shell
        let mut proc = launch(&spec("sleep 30")).unwrap();
        let started = Instant::now();
        let status = Terminator::new(Duration::from_secs(5))
            .shut_down(&mut proc.child, proc.pid)
            .await
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_shut_down_escalates_to_sigkill() {
        // Shell ignores SIGTERM, so only SIGKILL ends it
        let mut proc = launch(&spec("trap '' TERM; sleep 30")).unwrap();
        // Let the trap install before signaling
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = Terminator::new(Duration::from_millis(500))
            .shut_down(&mut proc.child, proc.pid)
            .await
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_shut_down_kills_spawned_children_via_group() {
        // Child spawns a grandchild; group signaling reaches both
        let mut proc = launch(&spec("sleep 30 & wait")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        Terminator::new(Duration::from_secs(5))
            .shut_down(&mut proc.child, proc.pid)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}

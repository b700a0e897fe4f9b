//! Process launching: spawn the child in its own process group, pipe
//! stdout/stderr, and plumb any auxiliary descriptors the caller wants
//! monitored.
//!
//! Aux descriptors are wired with `pipe(2)`: the write end is `dup2`'d onto
//! the requested fd number inside `pre_exec`, the read end stays with us and
//! is handed to a blocking channel reader.

use crate::channel::ChannelId;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// What to launch and which descriptors to monitor.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Auxiliary descriptor numbers to monitor beyond stdout/stderr.
    pub aux_fds: Vec<i32>,
}

/// A spawned child with live read handles, one per monitored descriptor.
pub struct LaunchedProcess {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    /// Read ends of the auxiliary pipes.
    pub aux: Vec<(ChannelId, std::fs::File)>,
    pub pid: u32,
}

/// Errors raised while launching the child.
#[derive(Debug)]
pub enum LaunchError {
    /// Executable not found, permission denied, and friends.
    Spawn { source: std::io::Error },
    /// Could not create an auxiliary pipe.
    Pipe { fd: i32, source: nix::errno::Errno },
    /// The child was spawned without a piped descriptor we asked for.
    MissingPipe { stream: &'static str },
    /// An auxiliary descriptor number collides with stdin/stdout/stderr.
    ReservedFd { fd: i32 },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { source } => write!(f, "failed to spawn process: {source}"),
            LaunchError::Pipe { fd, source } => {
                write!(f, "failed to create pipe for fd {fd}: {source}")
            }
            LaunchError::MissingPipe { stream } => {
                write!(f, "child process has no piped {stream}")
            }
            LaunchError::ReservedFd { fd } => {
                write!(f, "auxiliary fd {fd} is reserved (0-2 are standard streams)")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source } => Some(source),
            LaunchError::Pipe { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Spawn the child in a new process group with all monitored descriptors
/// piped back to us.
pub fn launch(spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
    for &fd in &spec.aux_fds {
        if (0..=2).contains(&fd) {
            return Err(LaunchError::ReservedFd { fd });
        }
    }

    // One pipe per aux descriptor; write ends go to the child via dup2.
    let mut aux_reads: Vec<(ChannelId, OwnedFd)> = Vec::new();
    let mut aux_writes: Vec<OwnedFd> = Vec::new();
    let mut dup_pairs: Vec<(i32, i32)> = Vec::new();
    for &fd in &spec.aux_fds {
        let (read, write) =
            nix::unistd::pipe().map_err(|e| LaunchError::Pipe { fd, source: e })?;
        dup_pairs.push((write.as_raw_fd(), fd));
        aux_reads.push((ChannelId(fd), read));
        aux_writes.push(write);
    }

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean group kill
        .kill_on_drop(true);

    if !dup_pairs.is_empty() {
        let pairs = dup_pairs.clone();
        // Runs in the child between fork and exec; only async-signal-safe
        // calls allowed, hence raw libc.
        unsafe {
            cmd.pre_exec(move || {
                for &(from, to) in &pairs {
                    if libc::dup2(from, to) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    libc::close(from);
                }
                Ok(())
            });
        }
    }

    tracing::info!(
        command = %spec.command,
        args = ?spec.args,
        aux_fds = ?spec.aux_fds,
        "spawning monitored process"
    );

    let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn { source: e })?;

    // Parent copies of the write ends must close so aux readers see EOF
    // when the child exits.
    drop(aux_writes);

    let pid = child.id().unwrap_or(0);
    let stdout = child
        .stdout
        .take()
        .ok_or(LaunchError::MissingPipe { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(LaunchError::MissingPipe { stream: "stderr" })?;
    let aux = aux_reads
        .into_iter()
        .map(|(id, fd)| (id, std::fs::File::from(fd)))
        .collect();

    tracing::info!(pid, "monitored process started");
    Ok(LaunchedProcess {
        child,
        stdout,
        stderr,
        aux,
        pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn test_launch_pipes_stdout_and_stderr() {
        let spec = LaunchSpec {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo out-line; echo err-line >&2".to_string(),
            ],
            ..Default::default()
        };
        let mut proc = launch(&spec).unwrap();
        assert!(proc.pid > 0);

        let mut out = String::new();
        let mut err = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut proc.stdout, &mut out)
            .await
            .unwrap();
        tokio::io::AsyncReadExt::read_to_string(&mut proc.stderr, &mut err)
            .await
            .unwrap();
        assert_eq!(out, "out-line\n");
        assert_eq!(err, "err-line\n");

        let status = proc.child.wait().await.unwrap();
        assert_eq!(status.code(), Some(0));
    }

    #[tokio::test]
    async fn test_launch_spawn_failure() {
        let spec = LaunchSpec {
            command: "definitely-not-a-real-binary-xyz".to_string(),
            ..Default::default()
        };
        let Err(err) = launch(&spec) else {
            panic!("expected spawn failure")
        };
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_launch_rejects_reserved_aux_fd() {
        let spec = LaunchSpec {
            command: "true".to_string(),
            aux_fds: vec![2],
            ..Default::default()
        };
        let Err(err) = launch(&spec) else {
            panic!("expected reserved-fd rejection")
        };
        assert!(matches!(err, LaunchError::ReservedFd { fd: 2 }));
    }

    #[tokio::test]
    async fn test_launch_aux_fd_carries_child_writes() {
        let spec = LaunchSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo aux-data >&3".to_string()],
            aux_fds: vec![3],
            ..Default::default()
        };
        let mut proc = launch(&spec).unwrap();
        let status = proc.child.wait().await.unwrap();
        assert_eq!(status.code(), Some(0));

        let (id, mut file) = proc.aux.pop().unwrap();
        assert_eq!(id, ChannelId(3));
        let mut data = String::new();
        file.read_to_string(&mut data).unwrap();
        assert_eq!(data, "aux-data\n");
    }

    #[tokio::test]
    async fn test_launch_applies_env() {
        let spec = LaunchSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "printf '%s' \"$LINEWATCH_TEST\"".to_string()],
            env: vec![("LINEWATCH_TEST".to_string(), "hello".to_string())],
            ..Default::default()
        };
        let mut proc = launch(&spec).unwrap();
        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut proc.stdout, &mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello");
        proc.child.wait().await.unwrap();
    }
}

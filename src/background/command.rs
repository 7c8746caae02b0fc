//! External command execution for session start and stop.
//!
//! Commands run through the platform shell in their own process group, so
//! cancellation and destroy can reap the whole descendant tree rather than
//! just the immediate shell. Stdout and stderr are streamed line-by-line
//! into the session's log buffer while the command runs.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Command;
use crate::models::Session;

/// Grace period between SIGTERM and SIGKILL when reaping a process group.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors from command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command could not be spawned.
    #[error("could not spawn command: {0}")]
    Spawn(std::io::Error),

    /// The command exited non-zero.
    #[error("command failed with exit code {code:?}")]
    NonZeroExit { code: Option<i32> },

    /// The per-command timeout expired.
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    /// The surrounding scope was cancelled.
    #[error("command cancelled")]
    Cancelled,

    /// IO error while supervising the child.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes one configured command for a session.
///
/// The command line and environment values are run through `{{variable}}`
/// substitution first. The spawned process group is tracked on the session
/// so destroy can terminate survivors. Cancellation of `scope` (or the
/// per-command timeout) terminates the group and returns.
pub async fn exec_command(
    session: &Arc<Session>,
    command: &Command,
    scope: &CancellationToken,
) -> Result<(), CommandError> {
    let command_line = session.apply_variables(&command.command);
    session.log_stdin(&command_line);

    let mut cmd = shell_command(&command_line);
    cmd.current_dir(working_dir(session, command.working_dir.as_deref()));
    for entry in &command.environment {
        if let Some((name, value)) = entry.split_once('=') {
            cmd.env(name, session.apply_variables(value));
        }
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(CommandError::Spawn)?;
    let pgid = child.id().map(|pid| pid as i32);
    if let Some(pgid) = pgid {
        session.track_process_group(pgid);
    }

    stream_output(session, &mut child);

    let timeout = (command.timeout > 0).then(|| Duration::from_secs(command.timeout));
    let outcome = tokio::select! {
        _ = scope.cancelled() => None,
        status = wait_with_timeout(&mut child, timeout) => Some(status),
    };
    let outcome = match outcome {
        Some(status) => status,
        None => {
            reap(&mut child, pgid).await;
            Err(CommandError::Cancelled)
        }
    };

    match outcome {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(CommandError::NonZeroExit {
            code: status.code(),
        }),
        Err(e) => Err(e),
    }
}

async fn wait_with_timeout(
    child: &mut tokio::process::Child,
    timeout: Option<Duration>,
) -> Result<std::process::ExitStatus, CommandError> {
    let pgid = child.id().map(|pid| pid as i32);
    match timeout {
        None => child.wait().await.map_err(CommandError::Io),
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status.map_err(CommandError::Io),
            Err(_) => {
                reap(child, pgid).await;
                Err(CommandError::TimedOut(limit))
            }
        },
    }
}

/// Spawns line readers pumping the child's output into the session log.
fn stream_output(session: &Arc<Session>, child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                session.log_stdout(&line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                session.log_stderr(&line);
            }
        });
    }
}

async fn reap(child: &mut tokio::process::Child, pgid: Option<i32>) {
    if let Some(pgid) = pgid {
        terminate_process_group(pgid, KILL_GRACE).await;
    } else if let Err(e) = child.kill().await {
        warn!(error = %e, "Could not kill child process");
    }
    let _ = child.wait().await;
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command_line);
    // New session => new process group, so a group signal reaches every
    // descendant the shell spawns.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd
}

#[cfg(not(unix))]
fn shell_command(command_line: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

/// Signals a process group: SIGTERM, then SIGKILL once the grace period
/// elapses. Signalling an already-dead group is a no-op.
#[cfg(unix)]
pub async fn terminate_process_group(pgid: i32, grace: Duration) {
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        // Signal 0 probes for group existence.
        let gone = unsafe { libc::kill(-pgid, 0) } == -1;
        if gone {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(not(unix))]
pub async fn terminate_process_group(_pgid: i32, _grace: Duration) {}

fn working_dir(session: &Arc<Session>, working_dir: Option<&str>) -> std::path::PathBuf {
    let folder = session.folder();
    match working_dir {
        Some(dir) if !dir.is_empty() => folder.join(session.apply_variables(dir)),
        _ => folder,
    }
}

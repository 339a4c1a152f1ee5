//! Spawning and terminating one client executable.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::error::{FleetError, FleetResult};

/// How a running process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub exit_code: Option<i32>,
    /// The process outlived the graceful window and was killed.
    pub forced: bool,
}

/// Spawn `executable <flag> <document>` with output drained into the log.
///
/// Both paths are resolved to absolute form and the child runs inside the
/// client directory.
pub(crate) fn spawn(client_id: &str, executable: &Path, document: &Path, flag: &str) -> FleetResult<Child> {
    let executable = std::fs::canonicalize(executable).map_err(|e| FleetError::io(executable, e))?;
    let document = std::fs::canonicalize(document).map_err(|e| FleetError::io(document, e))?;

    let mut command = Command::new(&executable);
    command
        .arg(flag)
        .arg(&document)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = document.parent() {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .map_err(|e| FleetError::process(client_id, format!("failed to spawn {}: {e}", executable.display())))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain(client_id.to_string(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain(client_id.to_string(), "stderr", stderr));
    }
    Ok(child)
}

async fn drain<R>(client_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if stream == "stderr" => tracing::warn!(client_id = %client_id, stream, "{line}"),
            Ok(Some(line)) => tracing::info!(client_id = %client_id, stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(client_id = %client_id, stream, error = %e, "output stream closed");
                break;
            }
        }
    }
}

/// Ask the process to exit, then kill it if it is still alive after
/// `timeout`.
pub(crate) async fn terminate(
    client_id: &str,
    child: &mut Child,
    timeout: Duration,
    poll_interval: Duration,
) -> FleetResult<Termination> {
    if let Some(status) = child.try_wait().map_err(|e| FleetError::process(client_id, e.to_string()))? {
        return Ok(Termination {
            exit_code: status.code(),
            forced: false,
        });
    }

    request_exit(client_id, child)?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(Termination {
                    exit_code: status.code(),
                    forced: false,
                })
            }
            Ok(None) => {}
            Err(e) => return Err(FleetError::process(client_id, format!("liveness check failed: {e}"))),
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(poll_interval).await;
    }

    tracing::warn!(client_id, timeout_ms = timeout.as_millis() as u64, "process ignored termination request, killing");
    child
        .kill()
        .await
        .map_err(|e| FleetError::process(client_id, format!("forced kill failed: {e}")))?;
    let status = child
        .wait()
        .await
        .map_err(|e| FleetError::process(client_id, e.to_string()))?;
    Ok(Termination {
        exit_code: status.code(),
        forced: true,
    })
}

#[cfg(unix)]
fn request_exit(client_id: &str, child: &mut Child) -> FleetResult<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid).map_err(|_| FleetError::process(client_id, format!("pid {pid} out of range")))?;
    // SAFETY: `pid` belongs to a child we own and have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(FleetError::process(client_id, format!("SIGTERM failed: {err}")))
}

#[cfg(not(unix))]
fn request_exit(client_id: &str, child: &mut Child) -> FleetResult<()> {
    child
        .start_kill()
        .map_err(|e| FleetError::process(client_id, format!("termination failed: {e}")))
}

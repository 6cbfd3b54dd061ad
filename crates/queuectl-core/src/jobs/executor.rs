//! Runs exactly one job's command in a child process, non-blocking. The
//! shell interprets `job.command` directly -- the engine does no argument
//! splitting, matching the source's `subprocess.Popen(..., shell=True)`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::{self, File};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::{Error, Result};

/// A synthetic, guaranteed-non-zero exit code reported when a timeout
/// forces termination rather than a real exit code from the child.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// A running (or just-finished) child process for one job.
pub struct Handle {
    child: Child,
    out_path: PathBuf,
    err_path: PathBuf,
}

/// What `poll` observed.
pub enum PollOutcome {
    StillRunning,
    Exited(i32),
}

impl Handle {
    /// Non-blocking check: does not wait for the child.
    pub async fn poll(&mut self) -> Result<PollOutcome> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(PollOutcome::Exited(status.code().unwrap_or(TIMEOUT_EXIT_CODE))),
            Ok(None) => Ok(PollOutcome::StillRunning),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Graceful shutdown request (SIGTERM on Unix). Does not wait for exit.
    /// On platforms without a graceful-signal story this falls back to a
    /// forceful kill, same as the source's Windows `taskkill /F` path.
    pub async fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.kill().await
        }
    }

    /// Forceful kill, waited on.
    pub async fn kill(&mut self) -> Result<()> {
        self.child.start_kill().map_err(Error::from)?;
        let _ = self.child.wait().await;
        Ok(())
    }

    /// Waits for exit without killing -- used while Draining, where the
    /// policy is to let the child finish naturally.
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await.map_err(Error::from)?;
        Ok(status.code().unwrap_or(TIMEOUT_EXIT_CODE))
    }

    /// No explicit close is needed: the log file handles were handed to
    /// the child at spawn time and are dropped (closed) when `Handle` is
    /// dropped, on every path -- success, failure, timeout, or shutdown.
    pub fn close(self) {
        drop(self);
    }

    pub fn out_log_path(&self) -> &Path {
        &self.out_path
    }

    pub fn err_log_path(&self) -> &Path {
        &self.err_path
    }
}

/// Spawns a job's command, redirecting stdout/stderr to
/// `<log_dir>/<id>.out.log` / `.err.log` (created or truncated at start).
/// Creates `log_dir` if it doesn't exist.
pub async fn start(log_dir: &Path, job_id: &str, command: &str) -> Result<Handle> {
    fs::create_dir_all(log_dir).await.map_err(Error::from)?;

    let out_path = log_dir.join(format!("{}.out.log", job_id));
    let err_path = log_dir.join(format!("{}.err.log", job_id));

    let out_file = File::create(&out_path).await.map_err(Error::from)?;
    let err_file = File::create(&err_path).await.map_err(Error::from)?;

    let shell = if cfg!(windows) { "cmd" } else { "sh" };
    let shell_flag = if cfg!(windows) { "/C" } else { "-c" };

    let spawned = Command::new(shell)
        .arg(shell_flag)
        .arg(command)
        .stdout(Stdio::from(out_file.into_std().await))
        .stderr(Stdio::from(err_file.into_std().await))
        .stdin(Stdio::null())
        .spawn();

    match spawned {
        Ok(child) => {
            info!(job_id, "job process started");
            Ok(Handle {
                child,
                out_path,
                err_path,
            })
        }
        Err(e) => {
            warn!(job_id, error = %e, "failed to start job process");
            Err(Error::ExecutorStartError(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn start_redirects_output_to_log_files() {
        let dir = tempdir().unwrap();
        let mut handle = start(dir.path(), "job1", "echo hello").await.unwrap();

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit, 0);

        let out = tokio::fs::read_to_string(handle.out_log_path()).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = tempdir().unwrap();
        let mut handle = start(dir.path(), "job2", "exit 3").await.unwrap();
        let exit = handle.wait().await.unwrap();
        assert_eq!(exit, 3);
    }

    #[tokio::test]
    async fn poll_reports_still_running_then_exited() {
        let dir = tempdir().unwrap();
        let mut handle = start(dir.path(), "job3", "sleep 0.2 && exit 0").await.unwrap();
        match handle.poll().await.unwrap() {
            PollOutcome::StillRunning => {}
            PollOutcome::Exited(_) => panic!("should not have exited yet"),
        }
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        match handle.poll().await.unwrap() {
            PollOutcome::Exited(code) => assert_eq!(code, 0),
            PollOutcome::StillRunning => panic!("should have exited by now"),
        }
    }
}

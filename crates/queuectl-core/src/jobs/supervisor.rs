//! Fleet lifecycle: PID file, shared shutdown flag, spawning and joining
//! worker tasks (§4.6). Workers run as `tokio` tasks in this process
//! rather than as forked OS processes -- see `DESIGN.md`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::jobs::store::Store;
use crate::jobs::worker::Worker;
use crate::{Error, Result};

pub struct Supervisor {
    store: Arc<Store>,
    log_dir: PathBuf,
    pid_file: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(store: Arc<Store>, log_dir: PathBuf, pid_file: PathBuf) -> Self {
        Self {
            store,
            log_dir,
            pid_file,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs `count` workers in the foreground until a graceful shutdown is
    /// requested (Ctrl+C, or `worker stop` sending SIGTERM to this
    /// process). Refuses to start if the PID file already exists.
    pub async fn run(&self, count: usize) -> Result<()> {
        if self.pid_file.exists() {
            return Err(Error::bad_input(format!(
                "PID file '{}' already exists. Workers may already be running. \
                 Run 'queuectl worker stop' to clear it.",
                self.pid_file.display()
            )));
        }

        let recovered = self.store.recover_orphans().await?;
        if recovered > 0 {
            info!(recovered, "recovered orphaned jobs from a previous crash before starting");
        }

        let pid = std::process::id();
        std::fs::write(&self.pid_file, format!("{}\n", pid))?;
        info!(pid, count, "supervisor started");

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(count);
        for _ in 0..count {
            let store = self.store.clone();
            let log_dir = self.log_dir.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut worker = Worker::new(store, log_dir, shutdown);
                worker.run().await;
            }));
        }

        install_signal_handlers(self.shutdown.clone());

        for handle in handles {
            let _ = handle.await;
        }

        let _ = std::fs::remove_file(&self.pid_file);
        info!("supervisor stopped, all workers joined");
        Ok(())
    }

    /// Used by tests and by a future in-process `worker stop` path; the
    /// CLI's separate `stop` command instead signals the PID in the file.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Reads the PID file and sends a graceful terminate signal to the
/// Supervisor process. There is no child process tree to kill forcibly --
/// Workers are tasks inside that one process, not forked children -- so a
/// single SIGTERM (routed through the same handler Ctrl+C uses) is
/// sufficient and matches the source's actual POSIX behavior despite its
/// docstring's "kill the tree" claim.
pub fn stop(pid_file: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(pid_file)
        .map_err(|_| Error::not_found(format!("no PID file found at '{}'", pid_file.display())))?;
    let pid: i32 = contents
        .trim()
        .parse()
        .map_err(|_| Error::bad_input("PID file contents are not a valid process id"))?;

    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status();
    }

    info!(pid, "sent shutdown signal to supervisor");
    Ok(())
}

#[cfg(unix)]
fn install_signal_handlers(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl+C received, shutting down gracefully");
                    }
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down gracefully");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, falling back to Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl+C received, shutting down gracefully");
            }
        }
        shutdown.store(true, Ordering::SeqCst);
    });
}

#[cfg(not(unix))]
fn install_signal_handlers(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down gracefully");
        shutdown.store(true, Ordering::SeqCst);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reports_not_found_without_a_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("queuectl.pid");
        let err = stop(&pid_file).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

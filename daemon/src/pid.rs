//! PID file handling.
//!
//! One instance per host: the PID file both prevents a second daemon from
//! grabbing the same interface and lets `--reload` find the running process.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

const PID_FILE_NAME: &str = "sssonector.pid";

fn runtime_dir() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        PathBuf::from("/run")
    } else if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
    } else {
        std::env::temp_dir()
    }
}

fn read_pid(path: &Path) -> Option<Pid> {
    let raw = fs::read_to_string(path).ok()?;

    raw.trim().parse::<i32>().ok().map(Pid::from_raw)
}

fn is_alive(pid: Pid) -> bool {
    // Signal 0 probes for existence without delivering anything. EPERM means
    // the process exists but belongs to someone else.
    matches!(kill(pid, None), Ok(()) | Err(nix::errno::Errno::EPERM))
}

/// The daemon's claim on being the only instance. Released on drop.
pub(crate) struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub(crate) fn acquire() -> Result<Self> {
        Self::acquire_in(&runtime_dir())
    }

    fn acquire_in(dir: &Path) -> Result<Self> {
        let path = dir.join(PID_FILE_NAME);

        if let Some(existing) = read_pid(&path)
            && is_alive(existing)
            && existing.as_raw() != std::process::id() as i32
        {
            bail!("another instance is already running (pid {existing})");
        }

        fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write `{}`", path.display()))?;

        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!("Failed to remove PID file: {e}");
        }
    }
}

/// Sends SIGHUP to the running instance, asking it to reload its config.
pub(crate) fn signal_reload() -> Result<()> {
    let path = runtime_dir().join(PID_FILE_NAME);
    let pid =
        read_pid(&path).context("no running instance found (missing or unreadable PID file)")?;

    if !is_alive(pid) {
        bail!("stale PID file: process {pid} is gone");
    }

    kill(pid, Signal::SIGHUP).with_context(|| format!("Failed to signal process {pid}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_our_pid_and_drop_removes_it() {
        let dir = tempfile::tempdir().unwrap();

        let pid_file = PidFile::acquire_in(dir.path()).unwrap();
        let contents = fs::read_to_string(dir.path().join(PID_FILE_NAME)).unwrap();

        assert_eq!(contents, std::process::id().to_string());

        drop(pid_file);
        assert!(!dir.path().join(PID_FILE_NAME).exists());
    }

    #[test]
    fn a_foreign_live_pid_blocks_acquisition() {
        let dir = tempfile::tempdir().unwrap();

        // PID 1 always exists and is never us.
        fs::write(dir.path().join(PID_FILE_NAME), "1").unwrap();

        assert!(PidFile::acquire_in(dir.path()).is_err());
    }

    #[test]
    fn a_stale_pid_file_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();

        // i32::MAX is (virtually) never a live PID.
        fs::write(dir.path().join(PID_FILE_NAME), i32::MAX.to_string()).unwrap();

        assert!(PidFile::acquire_in(dir.path()).is_ok());
    }
}

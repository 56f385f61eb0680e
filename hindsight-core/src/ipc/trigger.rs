//! Toggle trigger IPC: PID file plus SIGUSR1.
//!
//! Some host environments sandbox global key events, so the hotkey daemon
//! cannot reach a running instance directly. Instead, a second invocation
//! of the program in `--toggle` mode reads the PID file from the runtime
//! directory and delivers SIGUSR1. The receiving side installs a tokio
//! signal stream whose only job is to forward `ControlEvent::Toggle` into
//! the coordinator channel — the signal context itself never touches the
//! state machine.
//!
//! On platforms without POSIX signals this collaborator is absent and the
//! engine runs without it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{HindsightError, Result};

const PID_FILE_NAME: &str = "hindsight.pid";

/// Well-known PID file location: the user's runtime directory, falling
/// back to the system temp directory.
pub fn pid_file_path() -> PathBuf {
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .unwrap_or_else(std::env::temp_dir);
    dir.join(PID_FILE_NAME)
}

/// Guard that owns the PID file for this process; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write this process's PID at the well-known path.
    pub fn create() -> Result<Self> {
        Self::create_at(pid_file_path())
    }

    pub fn create_at(path: PathBuf) -> Result<Self> {
        fs::write(&path, std::process::id().to_string())?;
        info!(path = %path.display(), "pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove pid file: {e}");
            }
        }
    }
}

/// Read the PID recorded at `path`.
fn read_pid(path: &Path) -> Result<u32> {
    let raw = fs::read_to_string(path).map_err(|_| HindsightError::NoRunningInstance)?;
    raw.trim()
        .parse::<u32>()
        .map_err(|_| HindsightError::NoRunningInstance)
}

/// Deliver a toggle to the running instance named by the default PID file.
pub fn send_toggle() -> Result<()> {
    send_toggle_at(&pid_file_path())
}

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn send_toggle_at(path: &Path) -> Result<()> {
    let pid = read_pid(path)?;
    // SAFETY: kill(2) with a validated pid has no memory-safety
    // obligations; the only failure mode is an error return.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGUSR1) };
    if rc == 0 {
        info!(pid, "toggle delivered");
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Err(HindsightError::NoRunningInstance)
        } else {
            Err(HindsightError::Io(err))
        }
    }
}

#[cfg(not(unix))]
pub fn send_toggle_at(_path: &Path) -> Result<()> {
    Err(HindsightError::ToggleUnsupported)
}

/// Forward SIGUSR1 deliveries into the coordinator channel.
///
/// Spawns onto the ambient tokio runtime; the task ends when the process
/// stops receiving signals (runtime shutdown).
#[cfg(unix)]
pub fn spawn_toggle_listener(
    events_tx: std::sync::mpsc::SyncSender<crate::controller::ControlEvent>,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    Ok(tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("SIGUSR1 received; forwarding toggle");
            if events_tx
                .try_send(crate::controller::ControlEvent::Toggle)
                .is_err()
            {
                warn!("control channel unavailable; toggle dropped");
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_toggle_listener(
    _events_tx: std::sync::mpsc::SyncSender<crate::controller::ControlEvent>,
) -> Result<tokio::task::JoinHandle<()>> {
    Err(HindsightError::ToggleUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pid_file_writes_own_pid_and_cleans_up() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("hindsight.pid");

        let guard = PidFile::create_at(path.clone()).expect("create");
        assert_eq!(guard.path(), path);
        assert_eq!(read_pid(&path).expect("read"), std::process::id());

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn missing_pid_file_reports_no_running_instance() {
        let tmp = TempDir::new().expect("tmp");
        let err = send_toggle_at(&tmp.path().join("absent.pid")).unwrap_err();
        assert!(matches!(
            err,
            HindsightError::NoRunningInstance | HindsightError::ToggleUnsupported
        ));
    }

    #[test]
    fn garbage_pid_file_reports_no_running_instance() {
        let tmp = TempDir::new().expect("tmp");
        let path = tmp.path().join("hindsight.pid");
        fs::write(&path, "not a pid").expect("write");
        assert!(matches!(
            read_pid(&path),
            Err(HindsightError::NoRunningInstance)
        ));
    }
}

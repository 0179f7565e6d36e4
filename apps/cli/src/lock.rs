//! Single-instance guard backed by a PID file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use natrium_shared::{NatriumError, Result};
use tracing::{info, warn};

/// Held for the lifetime of a generating command; removes the PID file on drop.
#[derive(Debug)]
pub(crate) struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Create the PID file exclusively.
    ///
    /// The PID is written to a private file first and hard-linked into place,
    /// so the lock file never exists without its content. A file left behind
    /// by a process that no longer exists is replaced.
    pub(crate) fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match Self::create(path) {
            Err(NatriumError::AlreadyRunning { pid }) if is_stale(path, &pid) => {
                warn!(?path, %pid, "removing stale lock file");
                std::fs::remove_file(path).map_err(|e| NatriumError::io(path, e))?;
                Self::create(path)
            }
            other => other,
        }
    }

    fn create(path: &Path) -> Result<Self> {
        let pid = std::process::id();
        let staging = staging_path(path, pid);
        std::fs::write(&staging, pid.to_string()).map_err(|e| NatriumError::io(&staging, e))?;

        let linked = std::fs::hard_link(&staging, path);
        let _ = std::fs::remove_file(&staging);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let pid = std::fs::read_to_string(path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                return Err(NatriumError::AlreadyRunning { pid });
            }
            Err(e) => return Err(NatriumError::io(path, e)),
        }

        info!(?path, pid, "instance lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = ?self.path, "instance lock released"),
            Err(e) => warn!(path = ?self.path, error = %e, "could not remove lock file"),
        }
    }
}

/// How long an unreadable lock file may exist before it counts as abandoned.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

fn staging_path(path: &Path, pid: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{pid}.tmp"));
    PathBuf::from(name)
}

/// Whether the lock at `path`, holding `pid`, was abandoned.
///
/// A parsable PID is stale when its process is gone. Empty or garbled
/// content is stale once the file is older than [`UNREADABLE_GRACE`].
fn is_stale(path: &Path, pid: &str) -> bool {
    let Ok(pid) = pid.parse::<u32>() else {
        return std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > UNREADABLE_GRACE);
    };
    let proc = Path::new("/proc");
    proc.is_dir() && !proc.join(pid.to_string()).exists()
}

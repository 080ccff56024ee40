use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

enum Guard {
    Flock(Flock<File>),
    /// Fallback when the filesystem does not support `flock`.
    PidFile,
}

/// Attempts at locking a path whose file is replaced under us.
const LOCK_ATTEMPTS: usize = 5;

/// Host-wide single-run lock. Released on drop.
pub struct RunLock {
    path: PathBuf,
    guard: Option<Guard>,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

impl RunLock {
    /// Take the lock without waiting. Fails with [`PipelineError::LockHeld`]
    /// when another live process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io("creating lock directory", e))?;
        }

        for _ in 0..LOCK_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| PipelineError::io(format!("opening lock {}", path.display()), e))?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(mut flock) => {
                    // The previous holder unlinks on release; a lock on that
                    // orphaned inode excludes nobody.
                    if !is_current(&flock, path) {
                        debug!(path = %path.display(), "Lock file replaced while locking, retrying");
                        continue;
                    }
                    if let Some(pid) = read_pid(&mut flock)
                        && pid != std::process::id() as i32
                        && !is_alive(pid)
                    {
                        info!(pid, path = %path.display(), "Recovered stale lock");
                    }
                    write_pid(&mut flock).map_err(|e| PipelineError::io("writing lock pid", e))?;
                    debug!(path = %path.display(), "Lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        guard: Some(Guard::Flock(flock)),
                    });
                }
                Err((mut file, Errno::EWOULDBLOCK)) => {
                    return Err(PipelineError::LockHeld {
                        pid: read_pid(&mut file).unwrap_or(0),
                        path: path.to_path_buf(),
                    });
                }
                Err((_, errno @ (Errno::ENOLCK | Errno::EOPNOTSUPP | Errno::ENOSYS))) => {
                    warn!(error = %errno, "flock unavailable, falling back to a pid file lock");
                    return Self::acquire_pid_file(path);
                }
                Err((_, errno)) => {
                    return Err(PipelineError::io(
                        format!("locking {}", path.display()),
                        io::Error::from(errno),
                    ));
                }
            }
        }

        Err(PipelineError::LockHeld {
            pid: 0,
            path: path.to_path_buf(),
        })
    }

    /// Exclusive-create lock file holding our pid. A file left by a dead
    /// process is removed and the lock retried once.
    pub fn acquire_pid_file(path: &Path) -> Result<Self> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .map_err(|e| PipelineError::io("writing lock pid", e))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        guard: Some(Guard::PidFile),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let pid = fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<i32>().ok());
                    match pid {
                        Some(pid) if is_alive(pid) => {
                            return Err(PipelineError::LockHeld {
                                pid,
                                path: path.to_path_buf(),
                            });
                        }
                        _ => {
                            info!(pid = ?pid, path = %path.display(), "Removing stale lock file");
                            fs::remove_file(path)
                                .map_err(|e| PipelineError::io("removing stale lock", e))?;
                        }
                    }
                }
                Err(e) => return Err(PipelineError::io(format!("creating lock {}", path.display()), e)),
            }
        }

        Err(PipelineError::LockHeld {
            pid: 0,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            // Unlink while still locked; waiters that locked the old inode
            // notice the swap in `is_current` and retry.
            if let Err(e) = fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "Could not remove lock file");
            }
            if let Guard::Flock(flock) = guard
                && let Err((_, errno)) = flock.unlock()
            {
                debug!(error = %errno, "flock unlock failed");
            }
            debug!(path = %self.path.display(), "Lock released");
        }
    }
}

/// Whether `file` is still the inode linked at `path`.
fn is_current(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(linked)) => held.dev() == linked.dev() && held.ino() == linked.ino(),
        _ => false,
    }
}

fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_pid(file: &mut File) -> Option<i32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.sync_all()
}

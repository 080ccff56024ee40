//! Forced removal of a dataset this tool created.
//!
//! Annexed objects are stored read-only, so a plain recursive delete is not
//! enough. The ladder asks datalad first, then unlocks annexed files, then
//! forces permissions before deleting.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::command::CommandRunner;
use crate::core::gateway::ToolGateway;
use crate::core::retry::RetryPolicy;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalStrategy {
    AlreadyAbsent,
    Datalad,
    UnlockAndDelete,
    ForcePermissions,
    /// Dry-run: nothing removed.
    Skipped,
}

/// Refuse paths that must never be removed, and non-datasets unless forced.
pub fn check_removable(path: &Path, force: bool) -> Result<PathBuf> {
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    let home = std::env::var_os("HOME").map(PathBuf::from);
    let too_shallow = resolved.components().count() < 3;
    if too_shallow || home.as_deref() == Some(resolved.as_path()) {
        return Err(PipelineError::Refused {
            path: resolved,
            reason: "root-level and home directories are never removed".to_string(),
        });
    }

    if resolved.exists() && !resolved.join(".datalad").is_dir() && !force {
        return Err(PipelineError::Refused {
            path: resolved,
            reason: "not a DataLad dataset; pass --force to remove it anyway".to_string(),
        });
    }

    Ok(resolved)
}

/// Gateway for the `cleanup` command. It always acts: a configured
/// `dry_run` belongs to conversions.
pub fn removal_gateway(runner: Arc<dyn CommandRunner>, config: &AppConfig) -> ToolGateway {
    ToolGateway::new(runner, RetryPolicy::from_config(config), false)
}

/// Remove `path`, escalating until it is gone.
pub async fn remove_dataset(gateway: &ToolGateway, path: &Path) -> Result<RemovalStrategy> {
    if !path.exists() {
        return Ok(RemovalStrategy::AlreadyAbsent);
    }
    if gateway.is_dry_run() {
        info!(path = %path.display(), "[dry-run] would remove dataset");
        return Ok(RemovalStrategy::Skipped);
    }

    if path.join(".datalad").is_dir() {
        match gateway.remove(path).await {
            Ok(_) if !path.exists() => {
                info!(path = %path.display(), "Dataset removed by datalad");
                return Ok(RemovalStrategy::Datalad);
            }
            Ok(_) => debug!(path = %path.display(), "datalad remove left files behind"),
            Err(e) => warn!(path = %path.display(), error = %e, "datalad remove failed"),
        }

        if path.join(".git").exists()
            && let Err(e) = gateway.git(path, &["annex", "unlock", "."]).await
        {
            debug!(error = %e, "git annex unlock failed");
        }
    }

    match fs::remove_dir_all(path) {
        Ok(()) => {
            info!(path = %path.display(), "Dataset deleted");
            return Ok(RemovalStrategy::UnlockAndDelete);
        }
        Err(e) if !path.exists() => {
            debug!(error = %e, "Path vanished during delete");
            return Ok(RemovalStrategy::UnlockAndDelete);
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Delete failed, forcing permissions"),
    }

    if let Err(e) = make_writable(path) {
        warn!(path = %path.display(), error = %e, "Could not reset all permissions");
    }
    let last = fs::remove_dir_all(path);

    if path.exists() {
        return Err(PipelineError::io(
            format!("{} could not be removed", path.display()),
            last.err().unwrap_or_else(|| io::Error::other("path still exists")),
        ));
    }
    info!(path = %path.display(), "Dataset deleted after forcing permissions");
    Ok(RemovalStrategy::ForcePermissions)
}

/// Grant the owner full access to every entry below `path`. Symlinks are not followed.
pub(crate) fn make_writable(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_symlink() {
        return Ok(());
    }

    let mut permissions = metadata.permissions();
    let extra = if metadata.is_dir() { 0o700 } else { 0o600 };
    permissions.set_mode(permissions.mode() | extra);
    fs::set_permissions(path, permissions)?;

    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            make_writable(&entry?.path())?;
        }
    }
    Ok(())
}

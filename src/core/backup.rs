//! Verified backup of a non-empty destination before it is reused.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::core::cleanup::make_writable;
use crate::core::transfer_engine::human_bytes;
use crate::error::{IoContext, PipelineError, Result};

/// Entry count and byte total of a tree. Symlinks count as entries of zero bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeTotals {
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub backup: PathBuf,
    pub totals: TreeTotals,
}

/// `<dir>_backup_<timestamp>` next to `dir`.
pub fn backup_path(dir: &Path, timestamp: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    dir.with_file_name(format!("{name}_backup_{timestamp}"))
}

pub fn tree_totals(root: &Path) -> io::Result<TreeTotals> {
    let mut totals = TreeTotals::default();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let metadata = fs::symlink_metadata(entry.path())?;
        if metadata.is_dir() {
            let sub = tree_totals(&entry.path())?;
            totals.entries += sub.entries;
            totals.bytes += sub.bytes;
        } else {
            totals.entries += 1;
            if metadata.is_file() {
                totals.bytes += metadata.len();
            }
        }
    }
    Ok(totals)
}

/// Copy `from` into `to`, keeping symlinks as links and permissions as they are.
fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let metadata = fs::symlink_metadata(&source)?;

        if metadata.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&source)?, &target)?;
        } else if metadata.is_dir() {
            copy_tree(&source, &target)?;
            fs::set_permissions(&target, metadata.permissions())?;
        } else {
            fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

/// Copy `dir` to a timestamped sibling and check that entry count and byte
/// total agree. The original is left untouched.
pub fn backup_directory(dir: &Path, timestamp: &str) -> Result<BackupOutcome> {
    let backup = backup_path(dir, timestamp);
    if backup.exists() {
        return Err(PipelineError::Refused {
            path: backup,
            reason: "a backup with this timestamp already exists; retry in a moment".to_string(),
        });
    }

    info!(from = %dir.display(), to = %backup.display(), "Backing up destination");
    copy_tree(dir, &backup).io_context(|| format!("backing up {}", dir.display()))?;

    let original = tree_totals(dir).io_context(|| format!("measuring {}", dir.display()))?;
    let copied = tree_totals(&backup).io_context(|| format!("measuring {}", backup.display()))?;
    if original != copied {
        warn!(?original, ?copied, "Backup does not match original");
        return Err(PipelineError::Integrity(format!(
            "backup {} holds {} entries ({}), original has {} ({})",
            backup.display(),
            copied.entries,
            human_bytes(copied.bytes),
            original.entries,
            human_bytes(original.bytes)
        )));
    }

    info!(
        backup = %backup.display(),
        entries = copied.entries,
        size = %human_bytes(copied.bytes),
        "Backup verified"
    );
    Ok(BackupOutcome {
        backup,
        totals: copied,
    })
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn clear_directory(dir: &Path) -> Result<()> {
    make_writable(dir).io_context(|| format!("unlocking {}", dir.display()))?;
    for entry in fs::read_dir(dir).io_context(|| format!("reading {}", dir.display()))? {
        let path = entry.io_context(|| format!("reading {}", dir.display()))?.path();
        let removed = match fs::symlink_metadata(&path) {
            Ok(m) if m.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        removed.io_context(|| format!("clearing {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn populated(root: &Path) -> PathBuf {
        let ds = root.join("study");
        fs::create_dir_all(ds.join(".git/annex/objects")).unwrap();
        fs::create_dir_all(ds.join("sub-01/anat")).unwrap();
        fs::write(ds.join(".git/annex/objects/key"), b"volume").unwrap();
        fs::write(ds.join("dataset_description.json"), b"{}").unwrap();
        std::os::unix::fs::symlink(
            "../../.git/annex/objects/key",
            ds.join("sub-01/anat/sub-01_T1w.nii.gz"),
        )
        .unwrap();
        ds
    }

    #[test]
    fn backup_name_is_a_timestamped_sibling() {
        let path = backup_path(Path::new("/data/out/study"), "20240101_120000");
        assert_eq!(path, PathBuf::from("/data/out/study_backup_20240101_120000"));
    }

    #[test]
    fn backup_preserves_links_and_totals() {
        let temp = tempdir().unwrap();
        let ds = populated(temp.path());

        let outcome = backup_directory(&ds, "20240101_120000").unwrap();

        assert_eq!(outcome.totals, tree_totals(&ds).unwrap());
        assert_eq!(outcome.totals.entries, 3);
        let link = outcome.backup.join("sub-01/anat/sub-01_T1w.nii.gz");
        assert!(fs::symlink_metadata(&link).unwrap().is_symlink());
        assert_eq!(fs::read(&link).unwrap(), b"volume");
    }

    #[test]
    fn clearing_handles_read_only_content() {
        let temp = tempdir().unwrap();
        let ds = populated(temp.path());
        let objects = ds.join(".git/annex/objects");
        fs::set_permissions(objects.join("key"), fs::Permissions::from_mode(0o444)).unwrap();
        fs::set_permissions(&objects, fs::Permissions::from_mode(0o555)).unwrap();

        clear_directory(&ds).unwrap();

        assert!(ds.is_dir());
        assert_eq!(fs::read_dir(&ds).unwrap().count(), 0);
    }
}

//! Single-pass directory archiving: tar+gzip, digest, verify, optionally delete.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::core::command::{CommandRunner, args, command_line};
use crate::core::hashing::{Digest, HashVerifier};
use crate::core::transfer_engine::{ExclusionRules, scan_directory};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    pub delete_source: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub archive: PathBuf,
    pub digest_file: PathBuf,
    pub digest: Option<Digest>,
    pub files: usize,
    pub verified: bool,
    pub source_deleted: bool,
}

/// `<parent>/<name>.tar.gz` for `dir`.
pub fn archive_path(dir: &Path) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| PipelineError::Config(format!("{} has no directory name", dir.display())))?;
    let parent = dir.parent().unwrap_or(Path::new("."));
    Ok(parent.join(format!("{}.tar.gz", name.to_string_lossy())))
}

fn digest_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(".blake3");
    PathBuf::from(name)
}

async fn run_tar(runner: &dyn CommandRunner, argv: Vec<String>) -> Result<String> {
    let output = runner
        .run("tar", &argv, None)
        .await
        .map_err(|e| PipelineError::MissingDependencies(vec![format!("tar ({e})")]))?;
    if !output.success() {
        return Err(PipelineError::Tool {
            operation: command_line("tar", &argv),
            attempts: 1,
            detail: output.combined(),
        });
    }
    Ok(output.stdout)
}

pub async fn archive_directory(
    runner: &dyn CommandRunner,
    dir: &Path,
    options: ArchiveOptions,
) -> Result<ArchiveOutcome> {
    if !dir.is_dir() {
        return Err(PipelineError::Config(format!("{} is not a directory", dir.display())));
    }
    let archive = archive_path(dir)?;
    let digest_file = digest_path(&archive);
    if archive.exists() {
        return Err(PipelineError::Refused {
            path: archive,
            reason: "an archive already exists; remove or rename it first".to_string(),
        });
    }

    let files = scan_directory(dir, &ExclusionRules::new(Vec::new()))
        .map_err(|e| PipelineError::io(format!("scanning {}", dir.display()), e))?
        .files
        .len();

    let parent = dir.parent().unwrap_or(Path::new("."));
    let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let create = args([
        "-czf".to_string(),
        archive.display().to_string(),
        "-C".to_string(),
        parent.display().to_string(),
        name,
    ]);

    if options.dry_run {
        info!(command = %command_line("tar", &create), files, "[dry-run] would archive");
        return Ok(ArchiveOutcome {
            archive,
            digest_file,
            digest: None,
            files,
            verified: false,
            source_deleted: false,
        });
    }

    info!(dir = %dir.display(), archive = %archive.display(), files, "Creating archive");
    run_tar(runner, create).await?;

    let verifier = HashVerifier::default();
    let digest = verifier
        .digest(&archive)
        .map_err(|e| PipelineError::io("hashing archive", e))?;
    let archive_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::write(&digest_file, format!("{digest}  {archive_name}\n"))
        .map_err(|e| PipelineError::io("writing digest file", e))?;

    let listing = run_tar(runner, args(["-tzf".to_string(), archive.display().to_string()])).await?;
    let listed = listing
        .lines()
        .filter(|l| !l.is_empty() && !l.ends_with('/'))
        .count();
    let recorded = fs::read_to_string(&digest_file)
        .ok()
        .and_then(|s| s.split_whitespace().next().map(Digest::from_hex));
    let rehashed = verifier
        .digest(&archive)
        .map_err(|e| PipelineError::io("re-hashing archive", e))?;

    let verified = listed == files && recorded.as_ref() == Some(&rehashed);
    if !verified {
        warn!(listed, expected = files, "Archive verification failed");
        return Err(PipelineError::Integrity(format!(
            "archive {} lists {listed} file(s), directory has {files}; digest {}",
            archive.display(),
            if recorded.as_ref() == Some(&rehashed) { "matches" } else { "differs" }
        )));
    }
    info!(archive = %archive.display(), digest = %digest, "Archive verified");

    let mut source_deleted = false;
    if options.delete_source {
        fs::remove_dir_all(dir)
            .map_err(|e| PipelineError::io(format!("deleting {}", dir.display()), e))?;
        info!(dir = %dir.display(), "Source directory deleted");
        source_deleted = true;
    }

    Ok(ArchiveOutcome {
        archive,
        digest_file,
        digest: Some(digest),
        files,
        verified,
        source_deleted,
    })
}

use crate::core::hashing::blake3_file;
use crate::core::transfer_engine::{
    FileHash, FileInfo, IntegrityMode, TransferEngine, TransferRequest, TransferResult,
    TransferStatus, scan_directory_following,
};
use crate::error::{PipelineError, Result};
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span};

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// How often to send progress updates (bytes between updates)
const PROGRESS_UPDATE_INTERVAL: u64 = 1024 * 1024; // 1MB

/// Native file copy transfer engine.
///
/// Files already present at the destination are skipped when they match:
/// by size and BLAKE3 digest in standard mode, by size and mtime in
/// fast-track mode. In standard mode every written file is re-read and its
/// digest compared to the one computed while copying.
pub struct NativeCopyEngine {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for NativeCopyEngine {
    fn default() -> Self {
        Self { sync_files: true }
    }
}

impl TransferEngine for NativeCopyEngine {
    fn name(&self) -> &'static str {
        "native"
    }

    fn transfer(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Pin<Box<dyn Future<Output = Result<TransferResult>> + Send>> {
        let req = req.clone();
        let sync_files = self.sync_files;

        Box::pin(async move {
            let _ = tx.send(TransferStatus::Ready).await;

            if let Err(e) = fs::create_dir_all(&req.destination) {
                let msg = format!("Failed to create destination directory: {}", e);
                let _ = tx.send(TransferStatus::Failed(msg.clone())).await;
                return Err(PipelineError::Transfer(msg));
            }

            let span = info_span!(
                "native_copy_transfer",
                source = %req.source.display(),
                destination = %req.destination.display()
            );

            async {
                let start_time = Instant::now();

                let scan_source = req.source.clone();
                let exclusions = req.exclusions.clone();
                let scan_result = match tokio::task::spawn_blocking(move || {
                    scan_directory_following(&scan_source, &exclusions)
                })
                .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        let msg = if is_storage_unreachable(&e) {
                            format!("Source storage is unreachable: {}", e)
                        } else {
                            format!("Failed to scan source directory: {}", e)
                        };
                        let _ = tx.send(TransferStatus::Failed(msg.clone())).await;
                        return Err(PipelineError::Transfer(msg));
                    }
                    Err(e) => return Err(PipelineError::Transfer(format!("scan task failed: {e}"))),
                };

                debug!(
                    total_files = scan_result.files.len(),
                    total_bytes = scan_result.total_bytes,
                    total_dirs = scan_result.directories.len(),
                    "Scan complete"
                );

                if let Err(e) =
                    create_directory_structure(&req.source, &req.destination, &scan_result.directories)
                        .await
                {
                    let msg = format!("Failed to create directory structure: {}", e);
                    let _ = tx.send(TransferStatus::Failed(msg.clone())).await;
                    return Err(PipelineError::Transfer(msg));
                }

                let options = CopyOptions {
                    sync_files,
                    mode: req.mode,
                };

                let result = copy_files_with_progress(
                    &req.destination,
                    scan_result.files,
                    scan_result.total_bytes,
                    options,
                    tx.clone(),
                )
                .await;

                let result = match result {
                    Ok(summary) => apply_directory_permissions(
                        &req.source,
                        &req.destination,
                        scan_result.directories,
                    )
                    .await
                    .map(|()| summary)
                    .map_err(|e| {
                        PipelineError::Transfer(format!("Failed to apply directory permissions: {e}"))
                    }),
                    Err(e) => Err(e),
                };

                match result {
                    Ok(summary) => {
                        let duration_secs = start_time.elapsed().as_secs();
                        info!(
                            files_copied = summary.files_copied,
                            files_unchanged = summary.files_unchanged,
                            total_bytes = summary.bytes_copied,
                            duration_secs,
                            "Native copy transfer complete"
                        );
                        let _ = tx.send(TransferStatus::Complete).await;

                        Ok(TransferResult {
                            files_copied: summary.files_copied,
                            files_unchanged: summary.files_unchanged,
                            total_bytes: summary.bytes_copied,
                            duration_secs,
                            file_hashes: match req.mode {
                                IntegrityMode::Standard => Some(summary.hashes),
                                IntegrityMode::FastTrack => None,
                            },
                        })
                    }
                    Err(e) => {
                        let _ = tx.send(TransferStatus::Failed(e.to_string())).await;
                        Err(e)
                    }
                }
            }
            .instrument(span)
            .await
        })
    }
}

#[derive(Clone, Copy)]
struct CopyOptions {
    sync_files: bool,
    mode: IntegrityMode,
}

#[derive(Default)]
struct CopySummary {
    files_copied: u64,
    files_unchanged: u64,
    bytes_copied: u64,
    hashes: Vec<FileHash>,
}

/// Create all directories in the destination, writable by us until the
/// files are in place. Modes are applied by [`apply_directory_permissions`].
async fn create_directory_structure(
    source: &Path,
    destination: &Path,
    directories: &[PathBuf],
) -> io::Result<()> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    let directories = directories.to_vec();

    tokio::task::spawn_blocking(move || {
        for dir_path in &directories {
            let Ok(relative) = dir_path.strip_prefix(&source) else {
                continue;
            };
            let dest_dir = destination.join(relative);
            fs::create_dir_all(&dest_dir)?;
            ensure_owner_writable(&dest_dir)?;
        }
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

/// Copy source directory modes onto the destination, deepest first so a
/// read-only parent never blocks a child.
async fn apply_directory_permissions(
    source: &Path,
    destination: &Path,
    mut directories: Vec<PathBuf>,
) -> io::Result<()> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    directories.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

    tokio::task::spawn_blocking(move || {
        for dir_path in &directories {
            let Ok(relative) = dir_path.strip_prefix(&source) else {
                continue;
            };
            let permissions = fs::metadata(dir_path)?.permissions();
            fs::set_permissions(destination.join(relative), permissions)?;
        }
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

/// A directory left read-only by an earlier run is reopened for writing.
fn ensure_owner_writable(dir: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(dir)?.permissions();
    let mode = permissions.mode();
    if mode & 0o700 != 0o700 {
        permissions.set_mode(mode | 0o700);
        fs::set_permissions(dir, permissions)?;
    }
    Ok(())
}

/// Copy all files with progress reporting
async fn copy_files_with_progress(
    destination: &Path,
    files: Vec<FileInfo>,
    total_bytes: u64,
    options: CopyOptions,
    tx: mpsc::Sender<TransferStatus>,
) -> Result<CopySummary> {
    let destination = destination.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut summary = CopySummary::default();
        let mut processed: u64 = 0;
        let mut last_progress_update: u64 = 0;
        let mut errors: Vec<CopyError> = Vec::new();

        for file_info in &files {
            let dest_path = destination.join(&file_info.relative);
            let current_file = file_info.relative.to_string_lossy().to_string();

            match sync_single_file(&file_info.path, &dest_path, options) {
                Ok(FileOutcome::Unchanged(hash)) => {
                    debug!(file = %current_file, "Unchanged, skipped");
                    summary.files_unchanged += 1;
                    if let Some(hash) = hash {
                        summary.hashes.push(FileHash {
                            relative_path: file_info.relative.clone(),
                            hash: *hash.as_bytes(),
                            size: file_info.size,
                        });
                    }
                }
                Ok(FileOutcome::Copied { bytes, hash }) => {
                    debug!(file = %current_file, size = bytes, "Copied");
                    summary.files_copied += 1;
                    summary.bytes_copied += bytes;
                    if let Some(hash) = hash {
                        summary.hashes.push(FileHash {
                            relative_path: file_info.relative.clone(),
                            hash: *hash.as_bytes(),
                            size: bytes,
                        });
                    }
                }
                Err(e) => {
                    if e.storage_lost {
                        return Err(PipelineError::Transfer(format!(
                            "Source storage became unreachable at {}",
                            current_file
                        )));
                    }

                    error!(file = %current_file, error = %e.message, "Failed to copy file");
                    errors.push(CopyError {
                        file: current_file.clone(),
                        message: e.message,
                    });
                }
            }

            processed += file_info.size;
            if processed - last_progress_update >= PROGRESS_UPDATE_INTERVAL || processed == total_bytes {
                let percentage = if total_bytes > 0 {
                    ((processed as f64 / total_bytes as f64) * 100.0) as u8
                } else {
                    100
                };

                let _ = tx.blocking_send(TransferStatus::InProgress {
                    total_bytes,
                    bytes_copied: processed,
                    current_file,
                    percentage,
                });
                last_progress_update = processed;
            }
        }

        if !errors.is_empty() {
            let mut summary_text = format!(
                "completed with {} error(s):\n{}",
                errors.len(),
                errors
                    .iter()
                    .take(10)
                    .map(|e| format!("  - {}: {}", e.file, e.message))
                    .collect::<Vec<_>>()
                    .join("\n")
            );

            if errors.len() > 10 {
                summary_text.push_str(&format!("\n  ... and {} more errors", errors.len() - 10));
            }
            return Err(PipelineError::Transfer(summary_text));
        }

        Ok(summary)
    })
    .await
    .map_err(|e| PipelineError::Transfer(format!("copy task failed: {e}")))?
}

/// Error information from a file copy operation
struct FileCopyError {
    message: String,
    storage_lost: bool,
}

impl FileCopyError {
    fn new(context: &str, e: &io::Error) -> Self {
        Self {
            message: format!("{}: {}", context, e),
            storage_lost: is_storage_unreachable(e),
        }
    }
}

/// Error tracking for copy operations
struct CopyError {
    file: String,
    message: String,
}

enum FileOutcome {
    Unchanged(Option<blake3::Hash>),
    Copied { bytes: u64, hash: Option<blake3::Hash> },
}

/// Bring `dest` in line with `source` according to the integrity mode.
fn sync_single_file(
    source: &Path,
    dest: &Path,
    options: CopyOptions,
) -> std::result::Result<FileOutcome, FileCopyError> {
    let source_metadata =
        fs::metadata(source).map_err(|e| FileCopyError::new("Failed to read source metadata", &e))?;

    if let Ok(dest_metadata) = fs::metadata(dest)
        && dest_metadata.is_file()
        && dest_metadata.len() == source_metadata.len()
    {
        match options.mode {
            IntegrityMode::FastTrack => {
                let src_mtime = filetime::FileTime::from_last_modification_time(&source_metadata);
                let dst_mtime = filetime::FileTime::from_last_modification_time(&dest_metadata);
                if src_mtime == dst_mtime {
                    return Ok(FileOutcome::Unchanged(None));
                }
            }
            IntegrityMode::Standard => {
                let src_hash = blake3_file(source)
                    .map_err(|e| FileCopyError::new("Failed to hash source", &e))?;
                if blake3_file(dest).is_ok_and(|h| h == src_hash) {
                    return Ok(FileOutcome::Unchanged(Some(src_hash)));
                }
            }
        }
    }

    let verify = options.mode == IntegrityMode::Standard;
    let (bytes, hash) = copy_single_file(source, dest, options.sync_files, verify)?;

    if let Some(expected) = hash {
        let actual =
            blake3_file(dest).map_err(|e| FileCopyError::new("Failed to re-read destination", &e))?;
        if actual != expected {
            return Err(FileCopyError {
                message: format!(
                    "Checksum mismatch after copy: source {} destination {}",
                    expected.to_hex(),
                    actual.to_hex()
                ),
                storage_lost: false,
            });
        }
    }

    Ok(FileOutcome::Copied { bytes, hash })
}

/// Copy a single file with metadata preservation, optionally hashing inline
fn copy_single_file(
    source: &Path,
    dest: &Path,
    sync_file: bool,
    hash_inline: bool,
) -> std::result::Result<(u64, Option<blake3::Hash>), FileCopyError> {
    let source_metadata =
        fs::metadata(source).map_err(|e| FileCopyError::new("Failed to read source metadata", &e))?;

    let source_file =
        File::open(source).map_err(|e| FileCopyError::new("Failed to open source file", &e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    // Annexed or read-only leftovers from an earlier run
    if dest.exists() {
        let _ = fs::remove_file(dest);
    }

    let dest_file =
        File::create(dest).map_err(|e| FileCopyError::new("Failed to create destination file", &e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut hasher = hash_inline.then(blake3::Hasher::new);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| FileCopyError::new("Failed to read from source", &e))?;

        if bytes_read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| FileCopyError::new("Failed to write to destination", &e))?;
        if let Some(h) = hasher.as_mut() {
            h.update(&buffer[..bytes_read]);
        }

        bytes_written += bytes_read as u64;
    }

    writer
        .flush()
        .map_err(|e| FileCopyError::new("Failed to flush destination file", &e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| FileCopyError::new("Failed to get inner file handle", e.error()))?;
        inner
            .sync_all()
            .map_err(|e| FileCopyError::new("Failed to sync file", &e))?;
    }

    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    if let Err(e) = preserve_timestamps(&source_metadata, dest) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok((bytes_written, hasher.map(|h| h.finalize())))
}

/// Preserve access and modification timestamps from source to destination
fn preserve_timestamps(source_metadata: &fs::Metadata, dest: &Path) -> io::Result<()> {
    let atime = filetime::FileTime::from_last_access_time(source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(source_metadata);
    filetime::set_file_times(dest, atime, mtime)
}

/// Errors after which no further file can be read: a stale NFS handle, a
/// dropped SMB session or a failing disk. Copying stops instead of logging
/// one failure per remaining file.
fn is_storage_unreachable(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::NotConnected
    ) {
        return true;
    }
    error.raw_os_error().is_some_and(|code| {
        matches!(
            code,
            libc::EIO | libc::ENODEV | libc::ENXIO | libc::ESTALE | libc::EHOSTDOWN | libc::EHOSTUNREACH
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer_engine::ExclusionRules;
    use std::time::Duration;
    use tempfile::tempdir;

    fn request(source: &Path, dest: &Path, mode: IntegrityMode) -> TransferRequest {
        TransferRequest {
            source: source.to_path_buf(),
            destination: dest.to_path_buf(),
            mode,
            exclusions: ExclusionRules::default(),
        }
    }

    async fn run(req: TransferRequest) -> (Result<TransferResult>, Vec<TransferStatus>) {
        let engine = NativeCopyEngine::default();
        let (tx, mut rx) = mpsc::channel(100);
        let handle = tokio::spawn(async move { engine.transfer(&req, tx).await });

        let mut updates = Vec::new();
        while let Some(status) = rx.recv().await {
            updates.push(status);
        }
        (handle.await.unwrap(), updates)
    }

    #[test]
    fn stale_handle_is_unreachable() {
        assert!(is_storage_unreachable(&io::Error::from_raw_os_error(libc::ESTALE)));
        assert!(is_storage_unreachable(&io::Error::from_raw_os_error(libc::EIO)));
    }

    #[test]
    fn per_file_errors_are_not_unreachable() {
        assert!(!is_storage_unreachable(&io::Error::new(ErrorKind::NotFound, "gone")));
        assert!(!is_storage_unreachable(&io::Error::new(
            ErrorKind::PermissionDenied,
            "permission denied"
        )));
    }

    #[tokio::test]
    async fn test_standard_copy_records_hashes() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");

        fs::create_dir_all(source.join("sub-01/anat")).unwrap();
        fs::write(source.join("dataset_description.json"), b"{\"Name\":\"x\"}").unwrap();
        fs::write(source.join("sub-01/anat/sub-01_T1w.nii.gz"), b"nested content").unwrap();
        fs::write(source.join("sub-01/.DS_Store"), b"junk").unwrap();

        let (result, updates) = run(request(&source, &dest, IntegrityMode::Standard)).await;
        let result = result.unwrap();

        assert_eq!(result.files_copied, 2);
        assert_eq!(result.total_bytes, 12 + 14);
        let hashes = result.file_hashes.unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(
            fs::read_to_string(dest.join("sub-01/anat/sub-01_T1w.nii.gz")).unwrap(),
            "nested content"
        );
        assert!(!dest.join("sub-01/.DS_Store").exists());
        assert!(matches!(updates.first(), Some(TransferStatus::Ready)));
        assert!(matches!(updates.last(), Some(TransferStatus::Complete)));
    }

    #[tokio::test]
    async fn test_existing_destination_is_merged_not_refused() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&dest).unwrap();
        fs::write(source.join("participants.tsv"), b"participant_id\n").unwrap();

        let (result, _) = run(request(&source, &dest, IntegrityMode::Standard)).await;
        assert_eq!(result.unwrap().files_copied, 1);
    }

    #[tokio::test]
    async fn test_standard_mode_skips_identical_files() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&dest).unwrap();
        fs::write(source.join("same.json"), b"{}").unwrap();
        fs::write(dest.join("same.json"), b"{}").unwrap();
        fs::write(source.join("changed.json"), b"ab").unwrap();
        fs::write(dest.join("changed.json"), b"xy").unwrap();

        let (result, _) = run(request(&source, &dest, IntegrityMode::Standard)).await;
        let result = result.unwrap();

        assert_eq!(result.files_unchanged, 1);
        assert_eq!(result.files_copied, 1);
        assert_eq!(fs::read(dest.join("changed.json")).unwrap(), b"ab");
    }

    #[tokio::test]
    async fn test_fast_track_trusts_size_and_mtime() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&dest).unwrap();
        fs::write(source.join("a.tsv"), b"ab").unwrap();
        fs::write(dest.join("a.tsv"), b"xy").unwrap();
        let stamp = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(source.join("a.tsv"), stamp).unwrap();
        filetime::set_file_mtime(dest.join("a.tsv"), stamp).unwrap();

        let (result, _) = run(request(&source, &dest, IntegrityMode::FastTrack)).await;
        let result = result.unwrap();

        // Same size and timestamp: fast-track does not look at content
        assert_eq!(result.files_unchanged, 1);
        assert!(result.file_hashes.is_none());
        assert_eq!(fs::read(dest.join("a.tsv")).unwrap(), b"xy");
    }

    #[tokio::test]
    async fn test_fast_track_copies_when_mtime_differs() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source");
        let dest = temp.path().join("dest");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("a.tsv"), b"xy").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(source.join("a.tsv"), b"ab").unwrap();
        filetime::set_file_mtime(
            dest.join("a.tsv"),
            filetime::FileTime::from_unix_time(1_500_000_000, 0),
        )
        .unwrap();

        let (result, _) = run(request(&source, &dest, IntegrityMode::FastTrack)).await;
        assert_eq!(result.unwrap().files_copied, 1);
        assert_eq!(fs::read(dest.join("a.tsv")).unwrap(), b"ab");
    }

    #[test]
    fn test_copy_single_file_preserves_content_and_hashes() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("source.txt");
        let dest = temp.path().join("dest.txt");

        let content = b"test file content for copying";
        fs::write(&source, content).unwrap();

        let (bytes, hash) = copy_single_file(&source, &dest, true, true).ok().unwrap();
        assert_eq!(bytes, content.len() as u64);
        assert_eq!(hash.unwrap(), blake3::hash(content));
        assert_eq!(fs::read(&dest).unwrap(), content);
    }
}

//! Bulk transfer of the source tree into the dataset.
//!
//! Two engines implement [`TransferEngine`]: `rsync` (default) and a native
//! copy with inline BLAKE3 verification. [`CopyEngine`] wraps either one with
//! the pre-scan, free-space bookkeeping and progress logging.

pub mod native_copy;
pub mod rsync;

use std::fmt;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::preflight::available_space;
use crate::error::{PipelineError, Result};
use crate::logging::LogThrottle;

pub use native_copy::NativeCopyEngine;
pub use rsync::RsyncEngine;

/// Files never transferred: platform artifacts and foreign versioning metadata.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    ".DS_Store",
    "._*",
    "Thumbs.db",
    "desktop.ini",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
    ".git",
    ".datalad",
];

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferEngineType {
    #[default]
    Rsync,
    Native,
}

/// How strongly the transfer checks content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityMode {
    /// Content checksums decide what to copy and verify what was written.
    Standard,
    /// Size and modification time only.
    FastTrack,
}

impl IntegrityMode {
    pub fn from_fast_track(fast_track: bool) -> Self {
        if fast_track {
            Self::FastTrack
        } else {
            Self::Standard
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Standard => "checksum verification during transfer",
            Self::FastTrack => "size/timestamp change detection (fast-track)",
        }
    }
}

/// Glob-lite exclusion patterns matched against single path components.
/// Supports a leading or trailing `*`.
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    patterns: Vec<String>,
}

impl Default for ExclusionRules {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect())
    }
}

impl ExclusionRules {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| component_matches(p, name))
    }

    /// True when any component of `relative` is excluded.
    pub fn excludes_path(&self, relative: &Path) -> bool {
        relative
            .components()
            .any(|c| self.is_excluded(&c.as_os_str().to_string_lossy()))
    }
}

fn component_matches(pattern: &str, name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else {
        pattern == name
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: IntegrityMode,
    pub exclusions: ExclusionRules,
}

#[derive(Debug, Clone)]
pub enum TransferStatus {
    Ready,
    InProgress {
        total_bytes: u64,
        bytes_copied: u64,
        current_file: String,
        percentage: u8,
    },
    Complete,
    Failed(String),
}

/// Hash of a copied file, recorded during a native standard-mode transfer.
#[derive(Debug, Clone)]
pub struct FileHash {
    pub relative_path: PathBuf,
    pub hash: [u8; 32],
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub files_copied: u64,
    pub files_unchanged: u64,
    pub total_bytes: u64,
    pub duration_secs: u64,
    /// Only the native engine hashes inline; rsync verifies internally.
    pub file_hashes: Option<Vec<FileHash>>,
}

pub trait TransferEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn transfer(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Pin<Box<dyn Future<Output = Result<TransferResult>> + Send>>;
}

pub fn create_engine(engine_type: TransferEngineType) -> Box<dyn TransferEngine> {
    match engine_type {
        TransferEngineType::Rsync => Box::new(RsyncEngine),
        TransferEngineType::Native => Box::new(NativeCopyEngine::default()),
    }
}

/// A regular file found by [`scan_directory`].
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub size: u64,
}

/// Result of scanning a directory
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Regular files in lexical traversal order
    pub files: Vec<FileInfo>,
    /// Directories, parents before children
    pub directories: Vec<PathBuf>,
    pub total_bytes: u64,
}

/// Walk `root` in lexical order, skipping excluded names and symlinks.
pub fn scan_directory(root: &Path, rules: &ExclusionRules) -> io::Result<ScanResult> {
    let mut result = ScanResult::default();
    scan_recursive(root, root, rules, false, &mut result)?;
    Ok(result)
}

/// Like [`scan_directory`], but symlinks to regular files count as files.
/// Annexed content in a saved dataset is reached this way.
pub fn scan_directory_following(root: &Path, rules: &ExclusionRules) -> io::Result<ScanResult> {
    let mut result = ScanResult::default();
    scan_recursive(root, root, rules, true, &mut result)?;
    Ok(result)
}

fn scan_recursive(
    base: &Path,
    current: &Path,
    rules: &ExclusionRules,
    follow_file_links: bool,
    result: &mut ScanResult,
) -> io::Result<()> {
    let mut entries = fs::read_dir(current)
        .map_err(|e| io::Error::new(e.kind(), format!("failed to read {}: {e}", current.display())))?
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if rules.is_excluded(&name.to_string_lossy()) {
            continue;
        }

        let path = entry.path();
        let mut metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if metadata.is_symlink() {
            match fs::metadata(&path) {
                Ok(target) if follow_file_links && target.is_file() => metadata = target,
                Ok(target) => {
                    let kind = if target.is_dir() { "directory" } else { "file" };
                    warn!(path = %path.display(), kind, "Skipping symlink");
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping dangling symlink");
                    continue;
                }
            }
        }

        if metadata.is_dir() {
            result.directories.push(path.clone());
            scan_recursive(base, &path, rules, follow_file_links, result)?;
        } else if metadata.is_file() {
            let relative = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
            result.total_bytes += metadata.len();
            result.files.push(FileInfo {
                path,
                relative,
                size: metadata.len(),
            });
        }
    }

    Ok(())
}

/// Outcome of a [`CopyEngine::run`].
#[derive(Debug, Clone)]
pub struct CopyReport {
    pub eligible_files: u64,
    pub eligible_bytes: u64,
    pub result: TransferResult,
    pub mode: IntegrityMode,
    pub free_before: Option<u64>,
    pub free_after: Option<u64>,
    pub low_space: bool,
}

impl fmt::Display for CopyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files ({} copied, {} unchanged), {} in {}s using {}",
            self.eligible_files,
            self.result.files_copied,
            self.result.files_unchanged,
            human_bytes(self.eligible_bytes),
            self.result.duration_secs,
            self.mode.describe()
        )
    }
}

/// Wraps a [`TransferEngine`] with counting, progress and free-space checks.
pub struct CopyEngine {
    engine: Box<dyn TransferEngine>,
    exclusions: ExclusionRules,
    low_space_threshold: u64,
}

impl CopyEngine {
    pub fn new(engine: Box<dyn TransferEngine>, low_space_threshold_gb: u64) -> Self {
        Self {
            engine,
            exclusions: ExclusionRules::default(),
            low_space_threshold: low_space_threshold_gb * GIB,
        }
    }

    pub fn with_exclusions(mut self, exclusions: ExclusionRules) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Count eligible files without copying (dry-run and progress totals).
    pub fn count(&self, source: &Path) -> Result<ScanResult> {
        scan_directory_following(source, &self.exclusions)
            .map_err(|e| PipelineError::io(format!("scanning {}", source.display()), e))
    }

    pub async fn run(
        &self,
        source: &Path,
        destination: &Path,
        mode: IntegrityMode,
    ) -> Result<CopyReport> {
        let free_before = log_free_space(destination, "before copy");

        let scan = self.count(source)?;
        info!(
            files = scan.files.len(),
            bytes = scan.total_bytes,
            engine = self.engine.name(),
            mode = mode.describe(),
            "Eligible files counted"
        );

        let req = TransferRequest {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            mode,
            exclusions: self.exclusions.clone(),
        };

        let (tx, mut rx) = mpsc::channel(64);
        let transfer = self.engine.transfer(&req, tx);

        let progress = async {
            let throttle = LogThrottle::new(Duration::from_secs(5));
            let started = Instant::now();
            while let Some(status) = rx.recv().await {
                match status {
                    TransferStatus::InProgress {
                        bytes_copied,
                        total_bytes,
                        percentage,
                        current_file,
                    } if throttle.should_log() => {
                        info!(
                            percentage,
                            copied = %human_bytes(bytes_copied),
                            total = %human_bytes(total_bytes),
                            elapsed_secs = started.elapsed().as_secs(),
                            file = %current_file,
                            "Copy progress"
                        );
                    }
                    TransferStatus::Failed(msg) => warn!(error = %msg, "Transfer reported failure"),
                    other => debug!(status = ?other, "Transfer status"),
                }
            }
        };

        let (result, ()) = tokio::join!(transfer, progress);
        let result = result?;

        let free_after = log_free_space(destination, "after copy");
        let low_space = free_after.is_some_and(|free| free < self.low_space_threshold);
        if low_space {
            warn!(
                free = %human_bytes(free_after.unwrap_or_default()),
                threshold = %human_bytes(self.low_space_threshold),
                "Low free space remaining at destination"
            );
        }

        Ok(CopyReport {
            eligible_files: scan.files.len() as u64,
            eligible_bytes: scan.total_bytes,
            result,
            mode,
            free_before,
            free_after,
            low_space,
        })
    }
}

fn log_free_space(path: &Path, when: &str) -> Option<u64> {
    match available_space(path) {
        Ok(free) => {
            info!(free = %human_bytes(free), path = %path.display(), "Free space {}", when);
            Some(free)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not determine free space {}", when);
            None
        }
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

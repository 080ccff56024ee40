use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::core::hashing::Digest;
use crate::core::transfer_engine::{ExclusionRules, scan_directory_following};
use crate::error::{IoContext, Result};

pub static SUBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sub-[A-Za-z0-9]+$").expect("valid subject regex"));

/// Required top-level descriptor of a BIDS dataset.
pub const DESCRIPTOR_FILE: &str = "dataset_description.json";
pub const PARTICIPANTS_FILE: &str = "participants.tsv";

/// The read-only input tree.
#[derive(Debug, Clone, Serialize)]
pub struct SourceTree {
    pub root: PathBuf,
    /// Subject directory names in lexical order.
    pub subjects: Vec<String>,
    /// Regular files directly under the root.
    pub metadata_files: Vec<String>,
    pub total_files: u64,
    pub total_bytes: u64,
}

impl SourceTree {
    pub fn scan(root: &Path) -> Result<Self> {
        let mut subjects = Vec::new();
        let mut metadata_files = Vec::new();
        let rules = ExclusionRules::default();

        for entry in std::fs::read_dir(root).io_context(|| format!("reading {}", root.display()))? {
            let entry = entry.io_context(|| format!("reading {}", root.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if rules.is_excluded(&name) {
                continue;
            }
            let file_type = entry
                .file_type()
                .io_context(|| format!("inspecting {}", entry.path().display()))?;
            if file_type.is_dir() && SUBJECT_RE.is_match(&name) {
                subjects.push(name);
            } else if file_type.is_file() {
                metadata_files.push(name);
            }
        }
        subjects.sort();
        metadata_files.sort();

        let scan = scan_directory_following(root, &rules).io_context(|| format!("scanning {}", root.display()))?;

        Ok(Self {
            root: root.to_path_buf(),
            subjects,
            metadata_files,
            total_files: scan.files.len() as u64,
            total_bytes: scan.total_bytes,
        })
    }

    /// Dataset name used for the destination directory.
    pub fn study_name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string())
    }
}

/// Phases of a conversion run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PipelineState {
    Locking,
    PreflightChecks,
    SourceValidation,
    DestinationPreparation,
    DatasetCreation,
    SubUnitCreation,
    FileCopy,
    Commit,
    StorageOptimization,
    IntegrityAudit,
    FinalReport,
    Done,
    Aborted,
}

impl PipelineState {
    /// The state that follows this one on success. Terminal states map to themselves.
    pub fn next(self) -> Self {
        use PipelineState::*;
        match self {
            Locking => PreflightChecks,
            PreflightChecks => SourceValidation,
            SourceValidation => DestinationPreparation,
            DestinationPreparation => DatasetCreation,
            DatasetCreation => SubUnitCreation,
            SubUnitCreation => FileCopy,
            FileCopy => Commit,
            Commit => StorageOptimization,
            StorageOptimization => IntegrityAudit,
            IntegrityAudit => FinalReport,
            FinalReport => Done,
            Done => Done,
            Aborted => Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Locking => "locking",
            Self::PreflightChecks => "pre-flight checks",
            Self::SourceValidation => "source validation",
            Self::DestinationPreparation => "destination preparation",
            Self::DatasetCreation => "dataset creation",
            Self::SubUnitCreation => "sub-dataset creation",
            Self::FileCopy => "file copy",
            Self::Commit => "commit",
            Self::StorageOptimization => "storage optimization",
            Self::IntegrityAudit => "integrity audit",
            Self::FinalReport => "final report",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Comparison result for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityRecord {
    pub relative_path: PathBuf,
    pub source_digest: Option<Digest>,
    /// `None` when the destination file is missing.
    pub destination_digest: Option<Digest>,
    pub matched: bool,
}

impl IntegrityRecord {
    pub fn missing(relative_path: PathBuf, source_digest: Option<Digest>) -> Self {
        Self {
            relative_path,
            source_digest,
            destination_digest: None,
            matched: false,
        }
    }

    pub fn compared(relative_path: PathBuf, source: Digest, destination: Digest) -> Self {
        Self {
            matched: source == destination,
            relative_path,
            source_digest: Some(source),
            destination_digest: Some(destination),
        }
    }
}

/// Named stage marker written to the run's temp directory.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub name: String,
    pub state: PipelineState,
    pub reached_at: DateTime<Utc>,
}

/// How the destination dataset came to exist in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DestinationOrigin {
    /// The directory did not exist before the run.
    Created,
    /// Existed but was empty, or was cleared after a verified backup.
    PreexistingEmpty,
    /// An existing dataset reused through `update` or an unsafe continue.
    Reused,
}

impl DestinationOrigin {
    /// Whether a fatal failure may delete the destination.
    pub fn rollback_allowed(self) -> bool {
        !matches!(self, Self::Reused)
    }
}

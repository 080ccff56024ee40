//! Post-copy proof that the dataset holds what the source holds.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::gateway::ToolGateway;
use crate::core::hashing::{Digest, HashVerifier, run_pool};
use crate::core::models::{DESCRIPTOR_FILE, IntegrityRecord, SUBJECT_RE};
use crate::core::transfer_engine::{ExclusionRules, scan_directory_following};
use crate::core::validator::is_domain_file;
use crate::error::{PipelineError, Result};

/// How many paths a set difference or failure listing shows.
pub const DISPLAY_CAP: usize = 20;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CountCheck {
    pub source: usize,
    pub destination: usize,
    pub only_in_source: Vec<PathBuf>,
    pub only_in_destination: Vec<PathBuf>,
}

impl CountCheck {
    pub fn passed(&self) -> bool {
        self.source == self.destination
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StructureCheck {
    pub descriptor_present: bool,
    pub source_subjects: usize,
    pub destination_subjects: usize,
}

impl StructureCheck {
    pub fn passed(&self) -> bool {
        self.descriptor_present && self.source_subjects == self.destination_subjects
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub count: CountCheck,
    /// Number of files the content check was asked to compare.
    pub expected: usize,
    pub records: Vec<IntegrityRecord>,
    pub structure: StructureCheck,
    /// Uncommitted entries reported by `status` after the commit phase.
    pub tracking_warnings: Vec<String>,
    pub method: String,
}

impl AuditReport {
    pub fn failures(&self) -> impl Iterator<Item = &IntegrityRecord> {
        self.records.iter().filter(|r| !r.matched)
    }

    pub fn verified(&self) -> usize {
        self.records.iter().filter(|r| r.matched).count()
    }

    /// Every requested file produced a record.
    pub fn complete(&self) -> bool {
        self.records.len() == self.expected
    }

    pub fn passed(&self) -> bool {
        self.count.passed()
            && self.complete()
            && self.failures().next().is_none()
            && self.structure.passed()
    }

    /// `Err(Integrity)` with an itemised, capped listing when anything failed.
    pub fn ensure_passed(&self) -> Result<()> {
        if self.passed() {
            return Ok(());
        }

        let mut msg = String::new();
        if !self.count.passed() {
            msg.push_str(&format!(
                "file count mismatch: {} in source, {} in destination",
                self.count.source, self.count.destination
            ));
            push_listing(&mut msg, "only in source", &self.count.only_in_source);
            push_listing(&mut msg, "only in destination", &self.count.only_in_destination);
        }

        if !self.complete() {
            if !msg.is_empty() {
                msg.push('\n');
            }
            msg.push_str(&format!(
                "content check incomplete: {} of {} files compared",
                self.records.len(),
                self.expected
            ));
        }

        let failures: Vec<&IntegrityRecord> = self.failures().collect();
        if !failures.is_empty() {
            if !msg.is_empty() {
                msg.push('\n');
            }
            msg.push_str(&format_mismatch_error(&failures));
        }

        if !self.structure.passed() {
            if !msg.is_empty() {
                msg.push('\n');
            }
            if !self.structure.descriptor_present {
                msg.push_str(&format!("{DESCRIPTOR_FILE} missing in destination"));
            } else {
                msg.push_str(&format!(
                    "subject count mismatch: {} in source, {} in destination",
                    self.structure.source_subjects, self.structure.destination_subjects
                ));
            }
        }

        Err(PipelineError::Integrity(msg))
    }
}

fn push_listing(msg: &mut String, label: &str, paths: &[PathBuf]) {
    if paths.is_empty() {
        return;
    }
    msg.push_str(&format!("\n  {label}:"));
    for p in paths.iter().take(DISPLAY_CAP) {
        msg.push_str(&format!("\n    - {}", p.display()));
    }
    if paths.len() > DISPLAY_CAP {
        msg.push_str(&format!("\n    ... and {} more", paths.len() - DISPLAY_CAP));
    }
}

/// Format content failures into a human-readable message
fn format_mismatch_error(failures: &[&IntegrityRecord]) -> String {
    let mut msg = format!(
        "Verification failed: {} file(s) did not match",
        failures.len()
    );

    for r in failures.iter().take(DISPLAY_CAP) {
        let reason = match (&r.source_digest, &r.destination_digest) {
            (None, _) => "source unreadable".to_string(),
            (Some(_), None) => "missing in destination".to_string(),
            (Some(s), Some(d)) => format!("hash mismatch ({s} != {d})"),
        };
        msg.push_str(&format!("\n  - {}: {}", r.relative_path.display(), reason));
    }

    if failures.len() > DISPLAY_CAP {
        msg.push_str(&format!("\n  ... and {} more", failures.len() - DISPLAY_CAP));
    }

    msg
}

/// Domain-relevant files under `root`, relative and sorted.
pub fn domain_files(root: &Path) -> Result<BTreeSet<PathBuf>> {
    let scan = scan_directory_following(root, &ExclusionRules::default())
        .map_err(|e| PipelineError::io(format!("scanning {}", root.display()), e))?;
    Ok(scan
        .files
        .into_iter()
        .map(|f| f.relative)
        .filter(|rel| is_domain_file(rel))
        .collect())
}

fn compare_one(verifier: &HashVerifier, source: &Path, destination: &Path, rel: &Path) -> IntegrityRecord {
    let src_digest = match verifier.digest(&source.join(rel)) {
        Ok(d) => d,
        Err(e) => {
            debug!(file = %rel.display(), error = %e, "Source digest failed");
            return IntegrityRecord::missing(rel.to_path_buf(), None);
        }
    };

    match verifier.digest(&destination.join(rel)) {
        Ok(dst_digest) => IntegrityRecord::compared(rel.to_path_buf(), src_digest, dst_digest),
        Err(_) => IntegrityRecord::missing(rel.to_path_buf(), Some(src_digest)),
    }
}

/// Worker output line for one file.
fn encode(record: &IntegrityRecord) -> String {
    let rel = record.relative_path.display();
    match (&record.source_digest, &record.destination_digest) {
        (None, _) => format!("UNREADABLE: {rel}"),
        (Some(s), None) => format!("MISSING: {rel} {s}"),
        (Some(s), Some(d)) if record.matched => format!("MATCH: {rel} {s} {d}"),
        (Some(s), Some(d)) => format!("MISMATCH: {rel} {s} {d}"),
    }
}

/// Parse a worker line back into a record.
fn parse_tagged(line: &str) -> Option<IntegrityRecord> {
    let (tag, rest) = line.split_once(": ")?;
    match tag {
        "MISSING" => {
            let (rel, src) = rest.rsplit_once(' ')?;
            Some(IntegrityRecord::missing(PathBuf::from(rel), Some(Digest::from_hex(src))))
        }
        "UNREADABLE" => Some(IntegrityRecord::missing(PathBuf::from(rest), None)),
        "MATCH" | "MISMATCH" => {
            let mut parts = rest.rsplitn(3, ' ');
            let dst = parts.next()?;
            let src = parts.next()?;
            let rel = parts.next()?;
            Some(IntegrityRecord::compared(
                PathBuf::from(rel),
                Digest::from_hex(src),
                Digest::from_hex(dst),
            ))
        }
        _ => None,
    }
}

pub struct IntegrityAuditor {
    verifier: HashVerifier,
    parallel: bool,
    workers: usize,
}

impl IntegrityAuditor {
    pub fn new(verifier: HashVerifier, parallel: bool, workers: usize) -> Self {
        Self {
            verifier,
            parallel,
            workers,
        }
    }

    /// Step 1: domain file counts, with set differences on mismatch.
    pub fn count_check(&self, source: &Path, destination: &Path) -> Result<(CountCheck, BTreeSet<PathBuf>)> {
        let src = domain_files(source)?;
        let dst = domain_files(destination)?;

        let mut check = CountCheck {
            source: src.len(),
            destination: dst.len(),
            ..Default::default()
        };
        info!(source = check.source, destination = check.destination, "File count check");

        if !check.passed() {
            check.only_in_source = src.difference(&dst).cloned().collect();
            check.only_in_destination = dst.difference(&src).cloned().collect();
            for p in check.only_in_source.iter().take(DISPLAY_CAP) {
                warn!(file = %p.display(), "Only in source");
            }
            for p in check.only_in_destination.iter().take(DISPLAY_CAP) {
                warn!(file = %p.display(), "Only in destination");
            }
        }
        Ok((check, src))
    }

    /// Step 2: digest every source file against its mirror. All failures are collected.
    pub async fn content_check(
        &self,
        source: &Path,
        destination: &Path,
        files: Vec<PathBuf>,
    ) -> Result<Vec<IntegrityRecord>> {
        info!(
            files = files.len(),
            parallel = self.parallel,
            digest = self.verifier.label(),
            "Content check"
        );

        if self.parallel {
            let verifier = self.verifier;
            let source = Arc::new(source.to_path_buf());
            let destination = Arc::new(destination.to_path_buf());
            let lines = run_pool(files, self.workers, move |rel: &PathBuf| {
                encode(&compare_one(&verifier, &source, &destination, rel))
            })
            .await;

            let mut records: Vec<IntegrityRecord> = lines
                .iter()
                .filter_map(|line| {
                    let parsed = parse_tagged(line);
                    if parsed.is_none() {
                        warn!(line = %line, "Unparseable worker output");
                    }
                    parsed
                })
                .collect();
            records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
            Ok(records)
        } else {
            let verifier = self.verifier;
            let source = source.to_path_buf();
            let destination = destination.to_path_buf();
            tokio::task::spawn_blocking(move || {
                files
                    .iter()
                    .map(|rel| compare_one(&verifier, &source, &destination, rel))
                    .collect()
            })
            .await
            .map_err(|e| PipelineError::Integrity(format!("content check task failed: {e}")))
        }
    }

    /// Step 3: descriptor present and subject counts equal.
    pub fn structure_check(&self, source_subjects: usize, destination: &Path) -> StructureCheck {
        let destination_subjects = std::fs::read_dir(destination)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_dir())
                    .filter(|e| SUBJECT_RE.is_match(&e.file_name().to_string_lossy()))
                    .count()
            })
            .unwrap_or(0);

        StructureCheck {
            descriptor_present: destination.join(DESCRIPTOR_FILE).exists(),
            source_subjects,
            destination_subjects,
        }
    }

    /// Post-commit tracking state. Only produces warnings.
    pub async fn tracking_check(
        &self,
        gateway: &ToolGateway,
        dataset: &Path,
        ignore: Option<&str>,
    ) -> Vec<String> {
        match gateway.status(dataset).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| ignore.is_none_or(|name| !e.path.ends_with(name)))
                .map(|e| format!("{}: {}", e.state, e.path))
                .inspect(|w| warn!(entry = %w, "Uncommitted change after save"))
                .collect(),
            Err(e) => vec![format!("status check failed: {e}")],
        }
    }

    /// Run every step and return the combined report.
    pub async fn audit(
        &self,
        source: &Path,
        destination: &Path,
        source_subjects: usize,
    ) -> Result<AuditReport> {
        let (count, files) = self.count_check(source, destination)?;
        let expected = files.len();
        let records = self
            .content_check(source, destination, files.into_iter().collect())
            .await?;
        let structure = self.structure_check(source_subjects, destination);

        Ok(AuditReport {
            count,
            expected,
            records,
            structure,
            tracking_warnings: Vec::new(),
            method: if self.parallel {
                format!("{} ({} workers)", self.verifier.label(), self.workers)
            } else {
                self.verifier.label().to_string()
            },
        })
    }
}

//! Source checks before any expensive work.
//!
//! [`StructureValidator`] inspects the tree itself; [`DomainValidator`] runs
//! the external BIDS validator and re-reads its diagnostics so that known
//! benign gzip header codes never fail a run on their own.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::command::{CommandOutput, CommandRunner, command_line};
use crate::core::gzheader;
use crate::core::models::{DESCRIPTOR_FILE, PARTICIPANTS_FILE, SUBJECT_RE};
use crate::core::transfer_engine::{ExclusionRules, scan_directory};
use crate::error::{PipelineError, Result};

/// Extensions counted as domain data by the validator and the auditor.
pub const DOMAIN_EXTENSIONS: &[&str] = &[
    "nii", "nii.gz", "json", "tsv", "tsv.gz", "bval", "bvec", "edf", "bdf", "vhdr", "vmrk", "eeg",
    "set", "fdt", "snirf",
];

/// Validator codes caused by gzip header metadata, never fatal.
pub const BENIGN_CODES: &[&str] = &[
    "GZIP_HEADER_MTIME",
    "GZIP_HEADER_FILENAME",
    "GZIP_HEADER_EXTRA",
];

const MAX_NAME_BYTES: usize = 255;
const MAX_PATH_BYTES: usize = 1024;
/// How many offending paths a single finding lists.
const LISTING_CAP: usize = 10;

static ERROR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(?:ERROR|ERR)\]\s+([A-Z0-9_]+)").expect("valid marker regex"));
static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\s<>:"|?*\\\x00-\x1f]"#).expect("valid name regex"));

/// Whether `path` has one of the [`DOMAIN_EXTENSIONS`].
pub fn is_domain_file(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return false;
    };
    DOMAIN_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(&format!(".{ext}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Advisory,
    /// Ambiguous: the operator may confirm; fatal without a prompt.
    NeedsConfirmation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            message: message.into(),
        }
    }

    fn advisory(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Advisory,
            message: message.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Fatal => "fatal",
            Severity::Advisory => "advisory",
            Severity::NeedsConfirmation => "needs confirmation",
        };
        write!(f, "[{tag}] {}", self.message)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
    pub subjects: usize,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        !self.findings.iter().any(|f| f.severity == Severity::Fatal)
    }

    pub fn fatal(&self) -> impl Iterator<Item = &Finding> {
        self.of(Severity::Fatal)
    }

    pub fn advisory(&self) -> impl Iterator<Item = &Finding> {
        self.of(Severity::Advisory)
    }

    pub fn needs_confirmation(&self) -> impl Iterator<Item = &Finding> {
        self.of(Severity::NeedsConfirmation)
    }

    fn of(&self, severity: Severity) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity == severity)
    }
}

fn listing(paths: &[String]) -> String {
    let mut text = paths
        .iter()
        .take(LISTING_CAP)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if paths.len() > LISTING_CAP {
        text.push_str(&format!(" ... and {} more", paths.len() - LISTING_CAP));
    }
    text
}

/// Structural inspection of a BIDS source tree.
#[derive(Debug, Clone)]
pub struct StructureValidator {
    check_gzip_headers: bool,
}

impl Default for StructureValidator {
    fn default() -> Self {
        Self {
            check_gzip_headers: true,
        }
    }
}

impl StructureValidator {
    pub fn new(check_gzip_headers: bool) -> Self {
        Self { check_gzip_headers }
    }

    pub fn validate(&self, root: &Path) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        self.check_descriptor(root, &mut report);

        let scan = scan_directory(root, &ExclusionRules::default())
            .map_err(|e| PipelineError::io(format!("scanning {}", root.display()), e))?;

        let subjects: Vec<String> = std::fs::read_dir(root)
            .map_err(|e| PipelineError::io(format!("reading {}", root.display()), e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| SUBJECT_RE.is_match(name))
            .collect();
        report.subjects = subjects.len();
        if subjects.is_empty() {
            report.findings.push(Finding {
                severity: Severity::NeedsConfirmation,
                message: "no subject directories (sub-*) found".to_string(),
            });
        }

        if !root.join(PARTICIPANTS_FILE).is_file() {
            report
                .findings
                .push(Finding::advisory(format!("{PARTICIPANTS_FILE} is missing")));
        }

        let data_files = scan
            .files
            .iter()
            .filter(|f| {
                f.relative
                    .components()
                    .next()
                    .is_some_and(|c| SUBJECT_RE.is_match(&c.as_os_str().to_string_lossy()))
                    && f.relative.components().count() > 1
            })
            .filter(|f| is_domain_file(&f.relative))
            .count();
        if data_files == 0 {
            report
                .findings
                .push(Finding::advisory("no domain data files found under subject directories"));
        }

        let mut all_paths: Vec<PathBuf> = scan.files.iter().map(|f| f.relative.clone()).collect();
        all_paths.extend(
            scan.directories
                .iter()
                .filter_map(|d| d.strip_prefix(root).ok().map(Path::to_path_buf)),
        );
        self.check_names(&all_paths, &mut report);

        if self.check_gzip_headers {
            match gzheader::find_dirty(root) {
                Ok(dirty) if !dirty.is_empty() => {
                    let names: Vec<String> = dirty.iter().map(|p| p.display().to_string()).collect();
                    report.findings.push(Finding::advisory(format!(
                        "{} gzip file(s) carry header timestamps or names (clean with `clean-gz-headers`): {}",
                        dirty.len(),
                        listing(&names)
                    )));
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "gzip header scan failed"),
            }
        }

        for finding in &report.findings {
            match finding.severity {
                Severity::Advisory => warn!("{finding}"),
                _ => info!("{finding}"),
            }
        }

        Ok(report)
    }

    fn check_descriptor(&self, root: &Path, report: &mut ValidationReport) {
        let path = root.join(DESCRIPTOR_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                report
                    .findings
                    .push(Finding::fatal(format!("{DESCRIPTOR_FILE} is missing")));
                return;
            }
        };

        let json: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                report
                    .findings
                    .push(Finding::fatal(format!("{DESCRIPTOR_FILE} is not valid JSON: {e}")));
                return;
            }
        };

        for field in ["Name", "BIDSVersion"] {
            if json.get(field).is_none_or(|v| v.is_null()) {
                report.findings.push(Finding::fatal(format!(
                    "{DESCRIPTOR_FILE} lacks required field {field}"
                )));
            }
        }
    }

    fn check_names(&self, paths: &[PathBuf], report: &mut ValidationReport) {
        let mut illegal = Vec::new();
        let mut long_names = Vec::new();
        let mut long_paths = Vec::new();
        let mut folded: HashMap<String, Vec<String>> = HashMap::new();

        for path in paths {
            let display = path.display().to_string();
            if let Some(name) = path.file_name().map(|n| n.to_string_lossy()) {
                if ILLEGAL_CHARS.is_match(&name) {
                    illegal.push(display.clone());
                }
                if name.len() > MAX_NAME_BYTES {
                    long_names.push(display.clone());
                }
            }
            if path.as_os_str().len() > MAX_PATH_BYTES {
                long_paths.push(display.clone());
            }
            folded.entry(display.to_lowercase()).or_default().push(display);
        }

        if !illegal.is_empty() {
            report.findings.push(Finding::advisory(format!(
                "{} name(s) contain whitespace or illegal characters: {}",
                illegal.len(),
                listing(&illegal)
            )));
        }
        if !long_names.is_empty() {
            report.findings.push(Finding::advisory(format!(
                "{} name(s) exceed {MAX_NAME_BYTES} bytes: {}",
                long_names.len(),
                listing(&long_names)
            )));
        }
        if !long_paths.is_empty() {
            report.findings.push(Finding::advisory(format!(
                "{} path(s) exceed {MAX_PATH_BYTES} bytes: {}",
                long_paths.len(),
                listing(&long_paths)
            )));
        }

        let mut collisions: Vec<String> = folded
            .into_values()
            .filter(|group| group.len() > 1)
            .map(|mut group| {
                group.sort();
                group.join(" / ")
            })
            .collect();
        if !collisions.is_empty() {
            collisions.sort();
            report.findings.push(Finding::advisory(format!(
                "{} case-insensitive name collision(s): {}",
                collisions.len(),
                listing(&collisions)
            )));
        }
    }
}

/// Parsed outcome of one external validator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorVerdict {
    pub passed: bool,
    /// Error codes that are not on the benign list.
    pub errors: Vec<String>,
    pub benign: Vec<String>,
}

/// Decide pass/fail from the validator output rather than its exit code alone.
pub fn interpret(output: &CommandOutput) -> ValidatorVerdict {
    let text = output.combined();
    let mut errors = Vec::new();
    let mut benign = Vec::new();

    for caps in ERROR_MARKER.captures_iter(&text) {
        let code = caps[1].to_string();
        if BENIGN_CODES.contains(&code.as_str()) {
            benign.push(code);
        } else {
            errors.push(code);
        }
    }
    for code in BENIGN_CODES {
        if !benign.iter().any(|b| b == code) && text.contains(code) {
            benign.push(code.to_string());
        }
    }
    errors.sort();
    errors.dedup();
    benign.sort();
    benign.dedup();

    let passed = if output.success() {
        errors.is_empty()
    } else {
        errors.is_empty() && !benign.is_empty()
    };

    ValidatorVerdict {
        passed,
        errors,
        benign,
    }
}

/// Runs the external domain validator.
pub struct DomainValidator<'a> {
    runner: &'a dyn CommandRunner,
    command: &'a [String],
}

impl<'a> DomainValidator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, command: &'a [String]) -> Self {
        Self { runner, command }
    }

    pub async fn run(&self, root: &Path) -> Result<ValidatorVerdict> {
        let (program, base) = self
            .command
            .split_first()
            .ok_or_else(|| PipelineError::Config("validator_command is empty".to_string()))?;

        let mut args = base.to_vec();
        args.push(root.display().to_string());
        args.push("--ignoreWarnings".to_string());

        info!(command = %command_line(program, &args), "Running domain validator");
        let output = self.runner.run(program, &args, None).await.map_err(|e| {
            PipelineError::MissingDependencies(vec![format!("{program} ({e})")])
        })?;

        let verdict = interpret(&output);
        if !verdict.benign.is_empty() {
            warn!(codes = ?verdict.benign, "Validator reported benign gzip header codes");
        }
        if verdict.passed {
            info!("Domain validation passed");
            Ok(verdict)
        } else {
            debug!(output = %output.combined(), "Validator output");
            let detail = if verdict.errors.is_empty() {
                format!("validator exited with {:?}", output.code)
            } else {
                format!("validator errors: {}", verdict.errors.join(", "))
            };
            Err(PipelineError::Validation(detail))
        }
    }
}

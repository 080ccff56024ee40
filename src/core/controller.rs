//! Phase sequencing for one conversion run.
//!
//! [`PipelineController::run`] walks the [`PipelineState`] machine from
//! `Locking` to `Done`. Any error moves the run to `Aborted`, persists the
//! log outside the destination and rolls back a destination this run
//! created. The lock and the temp directory are owned by the controller and
//! released when it is dropped, including when the future is cancelled.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::core::auditor::{AuditReport, IntegrityAuditor};
use crate::core::backup::{backup_directory, clear_directory};
use crate::core::cleanup::remove_dataset;
use crate::core::dataset::{DatasetBuilder, StoragePolicy, SubUnitReport};
use crate::core::decide::{Choice, Question};
use crate::core::gateway::{LadderOutcome, ToolGateway};
use crate::core::hashing::HashVerifier;
use crate::core::lock::RunLock;
use crate::core::models::{DestinationOrigin, PipelineState, SourceTree};
use crate::core::preflight::Preflight;
use crate::core::transfer_engine::{CopyEngine, CopyReport, IntegrityMode, create_engine, human_bytes};
use crate::core::validator::{DomainValidator, StructureValidator};
use crate::error::{IoContext, PipelineError, Result};
use crate::logging::Status;

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub source: PathBuf,
    /// The dataset is created at `<destination_root>/<study name>`.
    pub destination_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ConversionSummary {
    pub dataset: PathBuf,
    pub subjects: usize,
    pub sub_units: SubUnitReport,
    pub copy: Option<CopyReport>,
    /// `None` in dry-run.
    pub audit: Option<AuditReport>,
    pub warnings: Vec<String>,
    pub log_path: Option<PathBuf>,
    pub dry_run: bool,
}

/// Held for the lifetime of the run.
struct RunResources {
    _lock: RunLock,
    temp: TempDir,
}

struct Destination {
    path: PathBuf,
    origin: DestinationOrigin,
    /// Create the dataset on top of existing content.
    force_create: bool,
}

pub struct PipelineController {
    ctx: RunContext,
    request: ConversionRequest,
    phase: PipelineState,
    resources: Option<RunResources>,
    warnings: Vec<String>,
}

impl PipelineController {
    pub fn new(ctx: RunContext, request: ConversionRequest) -> Self {
        Self {
            ctx,
            request,
            phase: PipelineState::Locking,
            resources: None,
            warnings: Vec::new(),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run every phase. Consumes the controller so that the lock and temp
    /// directory are released on return.
    pub async fn run(mut self) -> Result<ConversionSummary> {
        info!(
            run_id = %self.ctx.run_id,
            source = %self.request.source.display(),
            destination = %self.request.destination_root.display(),
            dry_run = self.ctx.config.dry_run,
            "Conversion run starting"
        );

        match self.execute().await {
            Ok(mut summary) => {
                summary.log_path = self.finish_log(summary.dry_run);
                if let Some(path) = &summary.log_path {
                    self.ctx.report(Status::Info, format!("Log: {}", path.display()));
                }
                Ok(summary)
            }
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    fn enter(&mut self, phase: PipelineState) {
        self.phase = phase;
        self.ctx.set_phase(phase);
        info!(phase = %phase, "Entering phase");
        self.ctx.report(Status::Step, format!("Phase: {phase}"));
    }

    fn advance(&mut self) {
        self.enter(self.phase.next());
    }

    fn warn(&mut self, message: String) {
        self.ctx.report(Status::Warn, &message);
        self.warnings.push(message);
    }

    fn temp_dir(&self) -> Option<&Path> {
        self.resources.as_ref().map(|r| r.temp.path())
    }

    fn checkpoint(&self, name: &str) -> Result<()> {
        match self.temp_dir() {
            Some(dir) => self.ctx.checkpoint(name, dir),
            None => Ok(()),
        }
    }

    fn interactive(&self) -> bool {
        !self.ctx.config.non_interactive && self.ctx.decider.is_interactive()
    }

    async fn execute(&mut self) -> Result<ConversionSummary> {
        let config = self.ctx.config.clone();
        let gateway = self.ctx.gateway();

        self.enter(PipelineState::Locking);
        self.acquire_resources()?;

        self.advance();
        let (tree, verifier) = self.preflight().await?;

        self.advance();
        self.validate_source(&tree).await?;

        self.advance();
        let destination = self.prepare_destination(&tree)?;
        let dataset = destination.path.clone();

        self.advance();
        let builder = DatasetBuilder::new(&gateway, StoragePolicy::new(config.large_file_threshold.clone()));
        self.create_dataset(&builder, &destination).await?;

        self.advance();
        let sub_units = builder
            .create_subunits(
                &dataset,
                &tree.subjects,
                destination.origin == DestinationOrigin::Reused,
            )
            .await;
        for (subject, reason) in &sub_units.skipped {
            self.warn(format!("Skipped {subject}: {reason}"));
        }

        self.checkpoint("pre-copy")?;
        self.advance();
        let copy = self.copy_files(&dataset).await?;
        self.checkpoint("post-copy")?;

        self.advance();
        self.commit(&gateway, &tree, &dataset, &sub_units).await?;

        self.advance();
        self.optimize_storage(&gateway, &dataset, &sub_units).await;

        self.advance();
        let audit = self
            .audit(&gateway, verifier, &tree, &dataset, &sub_units)
            .await?;

        self.advance();
        self.final_report(&tree, &dataset, &sub_units, copy.as_ref(), audit.as_ref());

        self.advance();
        Ok(ConversionSummary {
            dataset,
            subjects: tree.subjects.len(),
            sub_units,
            copy,
            audit,
            warnings: std::mem::take(&mut self.warnings),
            log_path: None,
            dry_run: config.dry_run,
        })
    }

    fn acquire_resources(&mut self) -> Result<()> {
        let lock = RunLock::acquire(&self.ctx.config.lock_path)?;
        let temp = tempfile::Builder::new()
            .prefix("bids2datalad-")
            .tempdir()
            .io_context(|| "creating temp working directory")?;
        debug!(temp = %temp.path().display(), "Temp working directory created");

        fs::write(temp.path().join("config.toml"), self.ctx.config.to_toml())
            .io_context(|| "writing configuration snapshot")?;
        self.resources = Some(RunResources { _lock: lock, temp });
        self.checkpoint("initialization")
    }

    async fn preflight(&mut self) -> Result<(SourceTree, HashVerifier)> {
        let source = &self.request.source;
        if !source.is_dir() {
            return Err(PipelineError::Preflight(format!(
                "source {} is not a directory",
                source.display()
            )));
        }
        let tree = SourceTree::scan(source)?;
        let dataset = self.request.destination_root.join(tree.study_name());
        ensure_disjoint(source, &dataset)?;

        info!(
            subjects = tree.subjects.len(),
            files = tree.total_files,
            size = %human_bytes(tree.total_bytes),
            "Source scanned"
        );

        let report = Preflight::new(self.ctx.runner.as_ref(), &self.ctx.config)
            .run(source, &dataset, tree.total_bytes)
            .await?;
        for warning in report.warnings {
            self.warn(warning);
        }
        self.ctx.report(
            Status::Ok,
            format!(
                "Pre-flight passed: {} free, digest {}",
                human_bytes(report.free_bytes),
                report.verifier.label()
            ),
        );
        Ok((tree, report.verifier))
    }

    async fn validate_source(&mut self, tree: &SourceTree) -> Result<()> {
        let config = self.ctx.config.clone();
        let report = StructureValidator::new(!config.no_gzheader_check).validate(&tree.root)?;

        for finding in report.advisory() {
            self.warn(finding.to_string());
        }

        let fatal: Vec<String> = report.fatal().map(|f| f.message.clone()).collect();
        if !fatal.is_empty() {
            if config.skip_validation {
                for message in fatal {
                    self.warn(format!("Ignored (validation skipped): {message}"));
                }
            } else {
                return Err(PipelineError::Validation(fatal.join("; ")));
            }
        }

        let pending: Vec<String> = report
            .needs_confirmation()
            .map(|f| f.message.clone())
            .collect();
        if !pending.is_empty() {
            let summary = pending.join("; ");
            if config.skip_validation {
                self.warn(format!("Ignored (validation skipped): {summary}"));
            } else if self.interactive() {
                let answer = self
                    .ctx
                    .decider
                    .decide(&Question::confirm(format!("{summary}. Continue anyway?")));
                if answer != Choice::Yes {
                    return Err(PipelineError::Cancelled(summary));
                }
            } else {
                return Err(PipelineError::Validation(format!(
                    "{summary} (cannot confirm in non-interactive mode)"
                )));
            }
        }

        if config.skip_validation {
            self.warn("Domain validation skipped".to_string());
        } else {
            DomainValidator::new(self.ctx.runner.as_ref(), &config.validator_command)
                .run(&tree.root)
                .await?;
        }

        self.ctx.report(
            Status::Ok,
            format!("Source validated: {} subject(s)", report.subjects),
        );
        Ok(())
    }

    fn prepare_destination(&mut self, tree: &SourceTree) -> Result<Destination> {
        let path = self.request.destination_root.join(tree.study_name());
        let destination = self.classify_destination(&path)?;

        info!(
            dataset = %destination.path.display(),
            origin = ?destination.origin,
            force = destination.force_create,
            "Destination prepared"
        );
        let mut state = self.ctx.state();
        state.dataset = Some(destination.path.clone());
        state.origin = Some(destination.origin);
        Ok(destination)
    }

    fn classify_destination(&mut self, path: &Path) -> Result<Destination> {
        let config = self.ctx.config.clone();
        let destination = |origin, force_create| Destination {
            path: path.to_path_buf(),
            origin,
            force_create,
        };

        if !path.exists() {
            return Ok(destination(DestinationOrigin::Created, false));
        }
        let non_empty = fs::read_dir(path)
            .io_context(|| format!("reading {}", path.display()))?
            .next()
            .is_some();
        if !non_empty {
            return Ok(destination(DestinationOrigin::PreexistingEmpty, false));
        }

        let is_dataset = path.join(".datalad").is_dir();
        if config.update && is_dataset {
            self.ctx.report(
                Status::Info,
                format!("Updating existing dataset at {}", path.display()),
            );
            return Ok(destination(DestinationOrigin::Reused, false));
        }

        if config.force_empty {
            return Err(PipelineError::UnsafeDestination {
                path: path.to_path_buf(),
                remedy: "--force-empty requires an empty destination; remove it or choose another destination.".to_string(),
            });
        }

        if config.backup {
            self.backup_and_clear(path)?;
            return Ok(destination(DestinationOrigin::PreexistingEmpty, false));
        }

        if self.interactive() {
            if is_dataset {
                let question = Question::existing_dataset(format!(
                    "{} already contains a dataset. What should happen?",
                    path.display()
                ));
                return match self.ctx.decider.decide(&question) {
                    Choice::BackupThenContinue => {
                        self.backup_and_clear(path)?;
                        Ok(destination(DestinationOrigin::PreexistingEmpty, false))
                    }
                    Choice::ContinueUnsafely => {
                        self.warn(format!("Continuing into existing dataset {}", path.display()));
                        Ok(destination(DestinationOrigin::Reused, true))
                    }
                    other => Err(PipelineError::Cancelled(format!(
                        "operator chose {other} for {}",
                        path.display()
                    ))),
                };
            }

            let question = Question::confirm(format!(
                "{} is not empty. Merge the conversion into it?",
                path.display()
            ));
            if self.ctx.decider.decide(&question) == Choice::Yes {
                self.warn(format!("Merging into non-empty {}", path.display()));
                return Ok(destination(DestinationOrigin::Reused, true));
            }
            return Err(PipelineError::Cancelled(format!(
                "operator declined to use {}",
                path.display()
            )));
        }

        let remedy = if is_dataset {
            "Pass --update to resume it, --backup to keep a copy and start over, or choose another destination."
        } else {
            "Pass --backup to move its contents aside, or choose another destination."
        };
        Err(PipelineError::UnsafeDestination {
            path: path.to_path_buf(),
            remedy: remedy.to_string(),
        })
    }

    fn backup_and_clear(&mut self, path: &Path) -> Result<()> {
        if self.ctx.config.dry_run {
            self.ctx.report(
                Status::Info,
                format!("[dry-run] would back up and clear {}", path.display()),
            );
            return Ok(());
        }

        let outcome = backup_directory(path, &self.ctx.timestamp())?;
        clear_directory(path)?;
        self.ctx.report(
            Status::Ok,
            format!(
                "Backed up {} entries ({}) to {}",
                outcome.totals.entries,
                human_bytes(outcome.totals.bytes),
                outcome.backup.display()
            ),
        );
        Ok(())
    }

    async fn create_dataset(&mut self, builder: &DatasetBuilder<'_>, destination: &Destination) -> Result<()> {
        let path = &destination.path;
        if destination.origin == DestinationOrigin::Reused && path.join(".datalad").is_dir() {
            info!(dataset = %path.display(), "Reusing existing dataset");
            builder.commit_policy(path).await?;
        } else {
            builder.create_top(path, destination.force_create).await?;
        }

        if !self.ctx.config.dry_run {
            let log_path = path.join(self.ctx.log_file_name());
            match self.ctx.log.persist_to(&log_path) {
                Ok(()) => debug!(log = %log_path.display(), "Run log attached to dataset"),
                Err(e) => warn!(log = %log_path.display(), error = %e, "Could not move run log into dataset"),
            }
        }
        self.ctx.report(Status::Ok, format!("Dataset ready at {}", path.display()));
        Ok(())
    }

    async fn copy_files(&mut self, dataset: &Path) -> Result<Option<CopyReport>> {
        let config = self.ctx.config.clone();
        let engine = CopyEngine::new(create_engine(config.transfer_engine), config.low_space_threshold_gb);
        let mode = IntegrityMode::from_fast_track(config.fast_track);

        if config.dry_run {
            let scan = engine.count(&self.request.source)?;
            self.ctx.report(
                Status::Info,
                format!(
                    "[dry-run] would copy {} files ({}) with {} ({})",
                    scan.files.len(),
                    human_bytes(scan.total_bytes),
                    engine.engine_name(),
                    mode.describe()
                ),
            );
            return Ok(None);
        }

        let report = engine.run(&self.request.source, dataset, mode).await?;
        {
            let mut state = self.ctx.state();
            state.files_copied = report.result.files_copied;
            state.bytes_copied = report.result.total_bytes;
        }
        if report.low_space {
            self.warn(format!(
                "Low free space at destination: {}",
                human_bytes(report.free_after.unwrap_or_default())
            ));
        }
        self.ctx.report(Status::Ok, format!("Copied {report}"));
        Ok(Some(report))
    }

    async fn commit(
        &mut self,
        gateway: &ToolGateway,
        tree: &SourceTree,
        dataset: &Path,
        sub_units: &SubUnitReport,
    ) -> Result<()> {
        for subject in sub_units.created.iter().chain(&sub_units.reused) {
            let path = dataset.join(subject);
            match gateway.save_subdataset(&path, &format!("Import {subject}")).await {
                LadderOutcome::Saved(strategy) => debug!(subject = %subject, ?strategy, "Sub-dataset saved"),
                LadderOutcome::Failed { fix_command, detail } => {
                    self.warn(format!(
                        "Could not save {subject} ({detail}). Fix manually with: {fix_command}"
                    ));
                }
            }
        }

        let message = format!(
            "Import {} ({} subjects) from {}",
            tree.study_name(),
            tree.subjects.len(),
            tree.root.display()
        );
        // Sub-datasets were saved above; this records their pointers only.
        gateway.save(dataset, &message, false).await?;
        self.ctx.report(Status::Ok, "Dataset committed");
        Ok(())
    }

    /// Best-effort `git gc` of every repository in the dataset.
    async fn optimize_storage(&mut self, gateway: &ToolGateway, dataset: &Path, sub_units: &SubUnitReport) {
        let repos = std::iter::once(dataset.to_path_buf()).chain(
            sub_units
                .created
                .iter()
                .chain(&sub_units.reused)
                .map(|s| dataset.join(s)),
        );
        for repo in repos {
            if let Err(e) = gateway.git(&repo, &["gc", "--auto", "--quiet"]).await {
                debug!(repo = %repo.display(), error = %e, "git gc failed");
            }
        }
    }

    async fn audit(
        &mut self,
        gateway: &ToolGateway,
        verifier: HashVerifier,
        tree: &SourceTree,
        dataset: &Path,
        sub_units: &SubUnitReport,
    ) -> Result<Option<AuditReport>> {
        let config = self.ctx.config.clone();
        if config.dry_run {
            self.ctx.report(Status::Info, "[dry-run] integrity audit skipped");
            return Ok(None);
        }

        let auditor = IntegrityAuditor::new(verifier, config.parallel_hash, config.hash_workers);
        let mut report = auditor.audit(&tree.root, dataset, tree.subjects.len()).await?;
        let log_name = self.ctx.log_file_name();
        report.tracking_warnings = auditor
            .tracking_check(gateway, dataset, Some(log_name.as_str()))
            .await;
        for warning in report.tracking_warnings.clone() {
            self.warn(format!("Not committed: {warning}"));
        }

        if let Some(path) = &config.report {
            self.write_report(path, tree, dataset, sub_units, &report)?;
        }

        report.ensure_passed()?;
        self.ctx.report(
            Status::Ok,
            format!(
                "Integrity check passed: {} files verified ({})",
                report.verified(),
                report.method
            ),
        );
        Ok(Some(report))
    }

    fn write_report(
        &self,
        path: &Path,
        tree: &SourceTree,
        dataset: &Path,
        sub_units: &SubUnitReport,
        audit: &AuditReport,
    ) -> Result<()> {
        let skipped: Vec<_> = sub_units
            .skipped
            .iter()
            .map(|(subject, reason)| json!({ "subject": subject, "reason": reason }))
            .collect();
        let body = json!({
            "run_id": self.ctx.run_id.to_string(),
            "started_at": self.ctx.started_at.to_rfc3339(),
            "source": tree.root,
            "dataset": dataset,
            "subjects": tree.subjects.len(),
            "skipped_subjects": skipped,
            "passed": audit.passed(),
            "verified": audit.verified(),
            "failed": audit.failures().count(),
            "audit": audit,
        });

        let text = serde_json::to_string_pretty(&body)
            .map_err(|e| PipelineError::Config(format!("report serialization: {e}")))?;
        fs::write(path, text).io_context(|| format!("writing report {}", path.display()))?;
        info!(report = %path.display(), "Integrity report written");
        Ok(())
    }

    fn final_report(
        &mut self,
        tree: &SourceTree,
        dataset: &Path,
        sub_units: &SubUnitReport,
        copy: Option<&CopyReport>,
        audit: Option<&AuditReport>,
    ) {
        let total = tree.subjects.len();
        info!(subjects = total, dataset = %dataset.display(), "Final report");
        self.ctx.report(
            Status::Info,
            format!("Subjects processed: {total} ({} as sub-datasets)", sub_units.available()),
        );
        if !sub_units.skipped.is_empty() {
            let names: Vec<&str> = sub_units.skipped.iter().map(|(s, _)| s.as_str()).collect();
            self.ctx.report(
                Status::Warn,
                format!("Skipped subjects: {}", names.join(", ")),
            );
        }
        if let Some(copy) = copy {
            self.ctx.report(Status::Info, format!("Files: {copy}"));
        }
        match audit {
            Some(audit) => self.ctx.report(
                Status::Ok,
                format!("Integrity: PASS ({} files, {})", audit.verified(), audit.method),
            ),
            None => self.ctx.report(Status::Info, "Integrity: not checked (dry-run)"),
        }
        if !self.warnings.is_empty() {
            self.ctx.report(
                Status::Warn,
                format!("{} warning(s) during the run", self.warnings.len()),
            );
        }
        self.ctx.report(Status::Ok, format!("Dataset: {}", dataset.display()));
    }

    /// Decide where the log lives after a successful run.
    fn finish_log(&self, dry_run: bool) -> Option<PathBuf> {
        if dry_run || self.ctx.log.location().is_none() {
            self.persist_fallback_log();
        }
        self.ctx.log.location()
    }

    fn persist_fallback_log(&self) {
        let fallback = self.ctx.fallback_log_path();
        if let Err(e) = self.ctx.log.persist_to(&fallback) {
            warn!(log = %fallback.display(), error = %e, "Could not persist run log");
        }
    }

    async fn abort(&mut self, cause: &PipelineError) {
        let failed_in = self.phase;
        self.enter(PipelineState::Aborted);
        error!(phase = %failed_in, error = %cause, "Conversion failed");
        self.ctx.report(Status::Fail, format!("Failed during {failed_in}: {cause}"));

        let state = self.ctx.snapshot();
        let rollback = match (state.dataset, state.origin) {
            (Some(dataset), Some(origin))
                if origin.rollback_allowed()
                    && !self.ctx.config.dry_run
                    && failed_in >= PipelineState::DatasetCreation
                    && dataset.exists() =>
            {
                Some((dataset, origin))
            }
            _ => None,
        };

        let log_in_kept_dataset = rollback.is_none() && self.ctx.log.location().is_some();
        if !log_in_kept_dataset {
            self.persist_fallback_log();
        }

        if let Some((dataset, origin)) = rollback {
            self.rollback(&dataset, origin).await;
        }

        if let Some(path) = self.ctx.log.location() {
            self.ctx.report(Status::Info, format!("Log: {}", path.display()));
        }
    }

    async fn rollback(&self, dataset: &Path, origin: DestinationOrigin) {
        self.ctx.report(
            Status::Warn,
            format!("Rolling back: removing {}", dataset.display()),
        );
        match remove_dataset(&self.ctx.gateway(), dataset).await {
            Ok(strategy) => {
                info!(dataset = %dataset.display(), ?strategy, "Rollback complete");
                if origin == DestinationOrigin::PreexistingEmpty
                    && let Err(e) = fs::create_dir_all(dataset)
                {
                    warn!(dataset = %dataset.display(), error = %e, "Could not restore empty destination");
                }
            }
            Err(e) => {
                error!(dataset = %dataset.display(), error = %e, "Rollback failed");
                self.ctx.report(
                    Status::Fail,
                    format!(
                        "Rollback failed; remove it with: bids2datalad cleanup --force {}",
                        dataset.display()
                    ),
                );
            }
        }
    }
}

/// The destination must be neither inside the source nor contain it.
fn ensure_disjoint(source: &Path, dataset: &Path) -> Result<()> {
    let source = fs::canonicalize(source).io_context(|| format!("resolving {}", source.display()))?;
    let dataset = std::path::absolute(dataset).io_context(|| format!("resolving {}", dataset.display()))?;
    if dataset.starts_with(&source) || source.starts_with(&dataset) {
        return Err(PipelineError::Preflight(format!(
            "destination {} overlaps source {}",
            dataset.display(),
            source.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_paths_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("study");
        fs::create_dir(&source).unwrap();

        assert!(ensure_disjoint(&source, &source.join("derived/study")).is_err());
        assert!(ensure_disjoint(&source, temp.path()).is_err());
        assert!(ensure_disjoint(&source, &temp.path().join("out/study")).is_ok());
    }
}
